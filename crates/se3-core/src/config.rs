use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Se3Error, Se3Result};
use crate::types::AccessLevel;

/// Top-level configuration (loaded from se3.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Se3Config {
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
    pub device: DeviceConfig,
}

impl Se3Config {
    /// Load from a TOML file, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Se3Result<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Se3Error::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Hidden marker file at the device root (default: .se3magic)
    pub marker_file: String,
    /// Open the marker file with O_DIRECT so reads/writes reach the device
    pub direct_io: bool,
    /// How long open() waits for the exclusive lock
    pub lock_timeout_ms: u64,
    /// Sleep between polls of the response slot
    pub poll_interval_ms: u64,
    /// Deadline for one request/response exchange
    pub exchange_timeout_ms: u64,
    /// Deadline for each magic block written while claiming the slots
    pub magic_write_timeout_ms: u64,
    /// Mount table enumerated during discovery
    pub mounts_file: PathBuf,
    /// Additional roots probed during discovery
    pub extra_roots: Vec<PathBuf>,
}

impl TransportConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn magic_write_timeout(&self) -> Duration {
        Duration::from_millis(self.magic_write_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Access level requested at login: "user" or "admin"
    pub access: AccessLevel,
    /// Issue ForcedLogout automatically when the device reports a session already open
    pub force_logout: bool,
    /// Deadline for the challenge/login exchange
    pub login_timeout_ms: u64,
}

impl SessionConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Parameters of the in-process device emulator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial number programmed at factory init
    pub serial: String,
    /// Greeting string published in the discovery block
    pub hello: String,
    /// Size of the emulated key flash in bytes
    pub flash_size: usize,
    /// Size of the crypto-session scratch arena in bytes
    pub arena_size: usize,
    /// Number of reads answered "busy" before a pending request is processed
    pub busy_polls: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            marker_file: ".se3magic".into(),
            direct_io: true,
            lock_timeout_ms: 2000,
            poll_interval_ms: 5,
            exchange_timeout_ms: 10_000,
            magic_write_timeout_ms: 1000,
            mounts_file: PathBuf::from("/proc/mounts"),
            extra_roots: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access: AccessLevel::User,
            force_logout: false,
            login_timeout_ms: 10_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: "SE3-EMULATED-0001".into(),
            hello: "SE3 device emulator".into(),
            flash_size: 64 * 1024,
            arena_size: 32 * 1024,
            busy_polls: 0,
        }
    }
}
