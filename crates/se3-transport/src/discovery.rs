//! Finding devices among the mounted volumes.
//!
//! A volume hosts a device when the marker file at its root answers a read
//! of slot 15 with a discovery block. A missing marker is created and the
//! slots claimed by writing the 16 magic blocks; a marker whose slot 15 does
//! not answer is re-claimed once before the volume is given up on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use se3_core::config::TransportConfig;
use se3_core::wire::{magic_block, DiscoveryInfo, BLOCK_SIZE, DISCOVERY_SLOT, SLOT_COUNT};
use se3_core::{Se3Result, TransportError};

use crate::block::{BlockTransport, FileTransport};

/// One device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub root: PathBuf,
    pub marker: PathBuf,
    pub info: DiscoveryInfo,
}

impl DeviceDescriptor {
    pub fn serial(&self) -> String {
        self.info.serial_text()
    }
}

/// Mount points listed in a `/proc/mounts`-style table.
pub fn mount_points(mounts_file: &Path) -> Se3Result<Vec<PathBuf>> {
    let table = std::fs::read_to_string(mounts_file)?;
    Ok(parse_mounts(&table))
}

fn parse_mounts(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

/// Undo the kernel's octal escaping of whitespace and backslashes (`\040`).
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points plus configured extra roots, without duplicates.
pub fn candidate_roots(config: &TransportConfig) -> Vec<PathBuf> {
    let mut roots = match mount_points(&config.mounts_file) {
        Ok(roots) => roots,
        Err(e) => {
            warn!(mounts = %config.mounts_file.display(), "cannot read mount table: {e}");
            Vec::new()
        }
    };
    roots.extend(config.extra_roots.iter().cloned());
    let mut seen = HashSet::new();
    roots.retain(|root| seen.insert(root.clone()));
    roots
}

/// Write the 16 magic blocks so the device adopts them as its slot map.
///
/// Each block must land within `config.magic_write_timeout()`.
pub fn claim_slots<B: BlockTransport>(transport: &mut B, config: &TransportConfig) -> Se3Result<()> {
    let limit = config.magic_write_timeout();
    for slot in 0..SLOT_COUNT {
        let started = Instant::now();
        transport.write(slot, &magic_block(slot as u8))?;
        if started.elapsed() > limit {
            return Err(TransportError::Timeout(limit.as_millis() as u64).into());
        }
    }
    debug!("claimed {SLOT_COUNT} protocol slots");
    Ok(())
}

fn read_discovery<B: BlockTransport>(transport: &mut B) -> Se3Result<Option<DiscoveryInfo>> {
    let mut block = [0u8; BLOCK_SIZE];
    transport.read(DISCOVERY_SLOT, &mut block)?;
    Ok(DiscoveryInfo::decode(&block))
}

/// Read the discovery block from an open transport, claiming the slots
/// first when it does not answer yet.
pub fn identify<B: BlockTransport>(
    transport: &mut B,
    config: &TransportConfig,
) -> Se3Result<Option<DiscoveryInfo>> {
    if let Some(info) = read_discovery(transport)? {
        return Ok(Some(info));
    }
    claim_slots(transport, config)?;
    read_discovery(transport)
}

/// Probe one root. `Ok(None)` means "not a device".
pub fn probe_root(root: &Path, config: &TransportConfig) -> Se3Result<Option<DeviceDescriptor>> {
    let marker = root.join(&config.marker_file);
    let created = if marker.exists() {
        false
    } else {
        match std::fs::File::create_new(&marker)
            .and_then(|f| f.set_len((SLOT_COUNT * BLOCK_SIZE) as u64))
        {
            Ok(()) => true,
            Err(e) => {
                debug!(root = %root.display(), "cannot create marker: {e}");
                return Ok(None);
            }
        }
    };

    let mut transport = FileTransport::new(&marker, config);
    transport.open(Instant::now() + config.lock_timeout())?;
    let found = identify(&mut transport, config);
    transport.close();

    match found {
        Ok(Some(info)) => {
            info!(root = %root.display(), serial = %info.serial_text(), "device found");
            Ok(Some(DeviceDescriptor {
                root: root.to_path_buf(),
                marker,
                info,
            }))
        }
        Ok(None) => {
            if created {
                // Leave no trace on volumes that are not devices
                remove_marker(&marker);
            }
            Ok(None)
        }
        Err(e) => {
            if created {
                remove_marker(&marker);
            }
            Err(e)
        }
    }
}

/// Delete a marker this probe created. Returns whether it is gone.
fn remove_marker(marker: &Path) -> bool {
    match std::fs::remove_file(marker) {
        Ok(()) => true,
        Err(e) => {
            debug!(marker = %marker.display(), "cannot remove marker: {e}");
            false
        }
    }
}

/// Probe every candidate root. Roots that fail to probe are skipped with a warning.
pub fn discover(config: &TransportConfig) -> Se3Result<Vec<DeviceDescriptor>> {
    let mut devices = Vec::new();
    for root in candidate_roots(config) {
        match probe_root(&root, config) {
            Ok(Some(device)) => devices.push(device),
            Ok(None) => {}
            Err(e) => warn!(root = %root.display(), "probe failed: {e}"),
        }
    }
    Ok(devices)
}
