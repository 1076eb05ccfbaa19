//! se3: secure-element command-line interface
//!
//! Device commands:
//!   discover                 - list devices on mounted volumes
//!   info                     - discovery block of the selected device
//!   echo <text>              - link test through the block tunnel
//!   login                    - check a PIN by logging in and out
//!   encrypt / decrypt <in>   - run a file through a device cipher session
//!   digest <in>              - SHA-256 or HMAC-SHA-256 on the device
//!   algorithms               - the device's algorithm table
//!   key list|find|add|generate|delete
//!   pin set                  - change the user or admin PIN
//!
//! Local commands:
//!   config show              - display the active configuration
//!   emulate                  - run a session against an in-process device

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use se3_client::{Authenticator, CipherSpec, CryptoSession, KeyStore, Se3Session};
use se3_core::config::Se3Config;
use se3_core::types::NO_KEY;
use se3_core::wire::discovery_status;
use se3_core::{AccessLevel, Algorithm, CipherMode};
use se3_crypto::Pin;
use se3_device::EmulatedDevice;
use se3_transport::{discover, DeviceDescriptor, FileTransport, Tunnel};

type DeviceSession = Se3Session<Tunnel<FileTransport>>;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "se3",
    version,
    about = "Secure-element client",
    long_about = "se3: talk to a secure element over its USB mass-storage tunnel"
)]
struct Cli {
    /// Path to se3.toml configuration file
    #[arg(long, short = 'c', env = "SE3_CONFIG", default_value = "/etc/se3/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SE3_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "SE3_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Serial number of the device to use (default: the first one found)
    #[arg(long, short = 'd', env = "SE3_DEVICE")]
    device: Option<String>,

    /// Extra volume root to probe, in addition to the mount table
    #[arg(long)]
    root: Vec<PathBuf>,

    /// PIN for login (prompted for when unset)
    #[arg(long, env = "SE3_PIN", hide_env_values = true)]
    pin: Option<String>,

    /// Access level to log in with (default: from config)
    #[arg(long)]
    access: Option<AccessArg>,

    /// Clear another host's session if the device reports one open
    #[arg(long)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices found on mounted volumes
    Discover,

    /// Show the discovery block of the selected device
    Info,

    /// Send text through the tunnel and print what comes back
    Echo { text: String },

    /// Log in and out again to check a PIN
    Login,

    /// Encrypt a file on the device
    Encrypt(CipherArgs),

    /// Decrypt a file produced by `se3 encrypt`
    Decrypt(CipherArgs),

    /// Hash a file on the device
    Digest {
        input: PathBuf,
        /// HMAC-SHA-256 with this key instead of plain SHA-256
        #[arg(long)]
        hmac_key: Option<u32>,
    },

    /// List the algorithms the device supports
    Algorithms,

    /// Key store management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// PIN management (admin)
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a demonstration session against an in-process emulated device
    Emulate {
        /// Message to encrypt and decrypt
        #[arg(long, default_value = "hello from the host")]
        message: String,
    },
}

#[derive(clap::Args, Debug)]
struct CipherArgs {
    input: PathBuf,
    /// Output file (default: stdout)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Stored key id
    #[arg(long, short = 'k')]
    key: u32,
    #[arg(long, short = 'm', default_value = "cbc")]
    mode: ModeArg,
    /// AES+HMAC-SHA-256: append and check an authentication tag
    #[arg(long)]
    authenticated: bool,
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// List stored key ids and lengths
    List,
    /// Check whether a key id is in use
    Find { id: u32 },
    /// Store a key value (admin)
    Add {
        id: u32,
        /// Key value as hex
        #[arg(long, conflicts_with = "file")]
        hex: Option<String>,
        /// Read the key value from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Have the device generate a key (admin)
    Generate {
        id: u32,
        #[arg(long, default_value_t = 32)]
        len: u16,
    },
    /// Delete a key (admin)
    Delete { id: u32 },
}

#[derive(Subcommand, Debug)]
enum PinAction {
    /// Set the PIN of an access level
    Set {
        #[arg(long = "for", default_value = "user")]
        target: AccessArg,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AccessArg {
    User,
    Admin,
}

impl From<AccessArg> for AccessLevel {
    fn from(arg: AccessArg) -> Self {
        match arg {
            AccessArg::User => AccessLevel::User,
            AccessArg::Admin => AccessLevel::Admin,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Ecb,
    Cbc,
    Cfb,
    Ofb,
    Ctr,
}

impl From<ModeArg> for CipherMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Ecb => CipherMode::Ecb,
            ModeArg::Cbc => CipherMode::Cbc,
            ModeArg::Cfb => CipherMode::Cfb,
            ModeArg::Ofb => CipherMode::Ofb,
            ModeArg::Ctr => CipherMode::Ctr,
        }
    }
}

impl CipherArgs {
    fn spec(&self) -> CipherSpec {
        let algorithm = if self.authenticated {
            Algorithm::AesHmacSha256
        } else {
            Algorithm::Aes
        };
        CipherSpec::new(algorithm, self.mode.into(), self.key)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging defaults come from the config file, so it is read before the
    // subscriber exists; a missing file is reported once logging is up.
    let mut config = Se3Config::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);
    if !cli.config.exists() {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    config.transport.extra_roots.extend(cli.root.iter().cloned());
    if cli.force {
        config.session.force_logout = true;
    }
    debug!(config = %cli.config.display(), "se3 starting");

    match &cli.command {
        Commands::Discover => cmd_discover(&config),
        Commands::Info => cmd_info(&cli, &config),
        Commands::Echo { text } => cmd_echo(&cli, &config, text),
        Commands::Login => cmd_login(&cli, &config),
        Commands::Encrypt(args) => cmd_cipher(&cli, &config, args, true),
        Commands::Decrypt(args) => cmd_cipher(&cli, &config, args, false),
        Commands::Digest { input, hmac_key } => cmd_digest(&cli, &config, input, *hmac_key),
        Commands::Algorithms => cmd_algorithms(&cli, &config),
        Commands::Key { action } => cmd_key(&cli, &config, action),
        Commands::Pin {
            action: PinAction::Set { target },
        } => cmd_pin_set(&cli, &config, (*target).into()),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
        Commands::Emulate { message } => cmd_emulate(&config, message),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let layer = fmt::layer().with_writer(std::io::stderr);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

// ── Device selection ──────────────────────────────────────────────────────────

fn select_device(cli: &Cli, config: &Se3Config) -> Result<DeviceDescriptor> {
    let devices = discover(&config.transport).context("discovering devices")?;
    let found = devices.len();
    let device = match &cli.device {
        Some(serial) => devices.into_iter().find(|d| &d.serial() == serial),
        None => devices.into_iter().next(),
    };
    device.with_context(|| match &cli.device {
        Some(serial) => format!("no device with serial {serial} ({found} found)"),
        None => "no se3 device found; is it mounted? (try --root <mountpoint>)".to_string(),
    })
}

fn open_device(cli: &Cli, config: &Se3Config) -> Result<DeviceSession> {
    let descriptor = select_device(cli, config)?;
    let (session, info) = Se3Session::open(&descriptor, config)
        .with_context(|| format!("opening {}", descriptor.marker.display()))?;
    info!(serial = %info.serial_text(), root = %descriptor.root.display(), "device opened");
    Ok(session)
}

fn read_pin(cli: &Cli, access: AccessLevel) -> Result<Pin> {
    let secret = match &cli.pin {
        Some(pin) => SecretString::from(pin.clone()),
        None => SecretString::from(
            rpassword::prompt_password(format!("{access} PIN: ")).context("reading PIN")?,
        ),
    };
    Ok(Pin::from_secret(&secret)?)
}

/// Open the selected device and log in at `access` (or the configured level).
fn login(cli: &Cli, config: &Se3Config, access: Option<AccessLevel>) -> Result<DeviceSession> {
    let access = access
        .or(cli.access.map(AccessLevel::from))
        .unwrap_or(config.session.access);
    let pin = read_pin(cli, access)?;
    let mut session = open_device(cli, config)?;
    session
        .login(access, &pin)
        .with_context(|| format!("logging in as {access}"))?;
    Ok(session)
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .context("progress bar template")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

// ── `se3 discover` / `se3 info` / `se3 echo` ──────────────────────────────────

fn cmd_discover(config: &Se3Config) -> Result<()> {
    let devices = discover(&config.transport).context("discovering devices")?;
    if devices.is_empty() {
        println!("no devices found");
    }
    for device in devices {
        println!("{}  {}", device.serial(), device.root.display());
    }
    Ok(())
}

fn cmd_info(cli: &Cli, config: &Se3Config) -> Result<()> {
    let device = select_device(cli, config)?;
    let status = device.info.status;
    println!("serial:      {}", device.serial());
    println!("hello:       {}", device.info.hello_text());
    println!("root:        {}", device.root.display());
    println!("marker:      {}", device.marker.display());
    println!(
        "initialised: {}",
        yes_no(status & discovery_status::FACTORY_INITIALIZED != 0)
    );
    println!(
        "logged in:   {}",
        yes_no(status & discovery_status::LOGGED_IN != 0)
    );
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn cmd_echo(cli: &Cli, config: &Se3Config, text: &str) -> Result<()> {
    let mut session = open_device(cli, config)?;
    let back = session.echo(text.as_bytes()).context("echo")?;
    println!("{}", String::from_utf8_lossy(&back));
    Ok(())
}

// ── `se3 login` ───────────────────────────────────────────────────────────────

fn cmd_login(cli: &Cli, config: &Se3Config) -> Result<()> {
    let mut session = login(cli, config, None)?;
    println!("logged in as {}", session.access());
    session.logout().context("logging out")?;
    Ok(())
}

// ── `se3 encrypt` / `se3 decrypt` / `se3 digest` ──────────────────────────────

fn cmd_cipher(cli: &Cli, config: &Se3Config, args: &CipherArgs, encrypt: bool) -> Result<()> {
    let input = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let mut session = login(cli, config, None)?;
    let spec = args.spec();

    let pb = make_progress_bar(input.len() as u64, if encrypt { "encrypt" } else { "decrypt" })?;
    let mut progress = |n: usize| pb.inc(n as u64);
    let result = if encrypt {
        session.encrypt_with(spec, &input, &mut progress)
    } else {
        session.decrypt_with(spec, &input, &mut progress)
    };
    let output = result.with_context(|| {
        format!("{:?}/{:?} with key {}", spec.algorithm, spec.mode, spec.key_id)
    })?;
    pb.finish_and_clear();

    write_output(args.output.as_deref(), &output)?;
    info!(bytes_in = input.len(), bytes_out = output.len(), "done");
    Ok(())
}

fn write_output(path: Option<&Path>, data: &[u8]) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data).context("writing stdout")?;
            stdout.flush().context("flushing stdout")
        }
    }
}

fn cmd_digest(cli: &Cli, config: &Se3Config, input: &Path, hmac_key: Option<u32>) -> Result<()> {
    let data =
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let mut session = login(cli, config, None)?;
    let (algorithm, key_id) = match hmac_key {
        Some(id) => (Algorithm::HmacSha256, id),
        None => (Algorithm::Sha256, NO_KEY),
    };
    let digest = session
        .digest(algorithm, key_id, &data)
        .context("computing digest")?;
    println!("{}  {}", hex::encode(digest), input.display());
    Ok(())
}

fn cmd_algorithms(cli: &Cli, config: &Se3Config) -> Result<()> {
    let mut session = login(cli, config, None)?;
    for info in session.crypto_list().context("listing algorithms")? {
        println!(
            "{:<16} block {:>3}  key {:>3}",
            info.name, info.block_size, info.key_size
        );
    }
    Ok(())
}

// ── `se3 key` ─────────────────────────────────────────────────────────────────

fn cmd_key(cli: &Cli, config: &Se3Config, action: &KeyAction) -> Result<()> {
    match action {
        KeyAction::List => {
            let mut session = login(cli, config, None)?;
            let keys = session.key_list().context("listing keys")?;
            if keys.is_empty() {
                println!("no keys stored");
            }
            for key in keys {
                println!("{:>10}  {} bytes", key.id, key.len);
            }
        }
        KeyAction::Find { id } => {
            let mut session = login(cli, config, None)?;
            let found = session.key_find(*id).context("looking up key")?;
            println!("{id}: {}", if found { "present" } else { "absent" });
        }
        KeyAction::Add { id, hex, file } => {
            let value = match (hex, file) {
                (Some(text), None) => hex::decode(text.trim()).context("decoding --hex value")?,
                (None, Some(path)) => std::fs::read(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                _ => anyhow::bail!("give the key value with --hex or --file"),
            };
            let mut session = login(cli, config, Some(AccessLevel::Admin))?;
            session
                .key_add(*id, &value)
                .with_context(|| format!("storing key {id}"))?;
            println!("stored key {id} ({} bytes)", value.len());
        }
        KeyAction::Generate { id, len } => {
            let mut session = login(cli, config, Some(AccessLevel::Admin))?;
            session
                .key_generate(*id, *len)
                .with_context(|| format!("generating key {id}"))?;
            println!("generated key {id} ({len} bytes)");
        }
        KeyAction::Delete { id } => {
            let mut session = login(cli, config, Some(AccessLevel::Admin))?;
            session
                .key_delete(*id)
                .with_context(|| format!("deleting key {id}"))?;
            println!("deleted key {id}");
        }
    }
    Ok(())
}

// ── `se3 pin set` ─────────────────────────────────────────────────────────────

fn cmd_pin_set(cli: &Cli, config: &Se3Config, target: AccessLevel) -> Result<()> {
    let mut session = login(cli, config, Some(AccessLevel::Admin))?;
    let first = rpassword::prompt_password(format!("new {target} PIN: ")).context("reading PIN")?;
    let again = rpassword::prompt_password(format!("repeat {target} PIN: ")).context("reading PIN")?;
    if first != again {
        anyhow::bail!("PINs do not match");
    }
    let pin = Pin::from_secret(&SecretString::from(first))?;
    session
        .set_pin(target, &pin)
        .with_context(|| format!("setting {target} PIN"))?;
    println!("{target} PIN changed");
    Ok(())
}

// ── `se3 config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &Se3Config, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `se3 emulate` ─────────────────────────────────────────────────────────────

fn cmd_emulate(config: &Se3Config, message: &str) -> Result<()> {
    const DEMO_KEY: u32 = 1;

    let device = EmulatedDevice::provisioned(&config.device).context("provisioning emulator")?;
    let (mut session, info) =
        Se3Session::connect(device.disk(0), config).context("connecting to emulator")?;
    println!("device:    {} ({})", info.serial_text(), info.hello_text());

    session
        .login(AccessLevel::Admin, &Pin::default())
        .context("admin login")?;
    session.key_generate(DEMO_KEY, 32).context("generating key")?;

    let spec = CipherSpec::new(Algorithm::AesHmacSha256, CipherMode::Ctr, DEMO_KEY);
    let cipher = session.encrypt(spec, message.as_bytes()).context("encrypting")?;
    let plain = session.decrypt(spec, &cipher).context("decrypting")?;
    let digest = session
        .digest(Algorithm::Sha256, NO_KEY, message.as_bytes())
        .context("hashing")?;

    println!("message:   {message}");
    println!("encrypted: {}", hex::encode(&cipher));
    println!("decrypted: {}", String::from_utf8_lossy(&plain));
    println!("sha256:    {}", hex::encode(digest));
    session.logout().context("logging out")?;
    Ok(())
}
