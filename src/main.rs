//! cryptfs - Encrypting passthrough filesystem
//!
//! Usage:
//!   cryptfs init <backing_root>     - Create a configuration
//!   cryptfs mount [mount_point]     - Mount the filesystem
//!   cryptfs unmount <mount_point>   - Unmount the filesystem
//!   cryptfs status                  - Show configuration status

use clap::{Parser, Subcommand};
use cryptfs::{
    config::{CodecKind, Config},
    crypto::{codec_from_config, init_codec_config},
    fs::{mount, EncryptedFs},
    Error, Result,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "cryptfs")]
#[command(version)]
#[command(about = "Encrypting passthrough filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/cryptfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new configuration for a backing directory
    Init {
        /// Directory that will hold the encoded files
        backing_root: PathBuf,

        /// Content codec (identity, reverse, aes256gcm)
        #[arg(long, default_value = "aes256gcm")]
        codec: CodecKind,

        /// Default mount point
        #[arg(short, long)]
        mount_point: Option<PathBuf>,
    },

    /// Mount the filesystem in the foreground
    Mount {
        /// Mount point directory (defaults to the configured one)
        mount_point: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Let repeated opens of a file share one buffer
        #[arg(long)]
        shared_opens: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show configuration status
    Status,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_ascii_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            backing_root,
            codec,
            mount_point,
        } => cmd_init(config_path, backing_root, codec, mount_point),
        Commands::Mount {
            mount_point,
            allow_other,
            shared_opens,
        } => cmd_mount(config_path, mount_point, allow_other, shared_opens),
        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),
        Commands::Status => cmd_status(config_path),
    }
}

/// Password from `CRYPTFS_PASSWORD`, otherwise an interactive prompt
fn read_password(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var("CRYPTFS_PASSWORD") {
        return Ok(Zeroizing::new(password));
    }
    rpassword::prompt_password(prompt)
        .map(Zeroizing::new)
        .map_err(|e| Error::Internal(e.to_string()))
}

fn cmd_init(
    config_path: &Path,
    backing_root: PathBuf,
    codec: CodecKind,
    mount_point: Option<PathBuf>,
) -> Result<()> {
    info!("Initializing cryptfs...");

    let mut config = Config::default();
    config.mount.backing_root = expand_tilde(&backing_root);
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = expand_tilde(&mount_point);
    }
    config.codec.kind = codec;
    config.validate()?;

    std::fs::create_dir_all(&config.mount.backing_root)?;

    if codec == CodecKind::Aes256Gcm {
        let password = read_password("Choose encryption password: ")?;
        if std::env::var_os("CRYPTFS_PASSWORD").is_none() {
            let confirm = read_password("Confirm encryption password: ")?;
            if *password != *confirm {
                return Err(Error::InvalidConfig("Passwords do not match".to_string()));
            }
        }
        init_codec_config(&mut config.codec, Some(password.as_bytes()))?;
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Backing root: {:?}", config.mount.backing_root);
    info!("Run 'cryptfs mount' to mount the filesystem");

    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    mount_point: Option<PathBuf>,
    allow_other: bool,
    shared_opens: bool,
) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = expand_tilde(&mount_point);
    }
    config.mount.allow_other |= allow_other;
    config.mount.shared_opens |= shared_opens;
    config.validate_for_mount()?;

    info!("Starting cryptfs with the {:?} codec...", config.codec.kind);

    let password = match config.codec.kind {
        CodecKind::Aes256Gcm => Some(read_password("Enter encryption password: ")?),
        _ => None,
    };
    let codec = codec_from_config(&config.codec, password.as_ref().map(|p| p.as_bytes()))?;
    drop(password);

    let fs = EncryptedFs::from_config(&config, codec)?;

    std::fs::create_dir_all(&config.mount.mount_point)?;
    mount(fs, &config.mount)
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    println!("cryptfs Status");
    println!("==============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Backing root: {:?}", config.mount.backing_root);
    println!(
        "Backing root present: {}",
        if config.mount.backing_root.is_dir() { "yes" } else { "no" }
    );
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Codec: {:?}", config.codec.kind);
    if config.codec.kind == CodecKind::Aes256Gcm {
        println!(
            "Key material: {}",
            if config.codec.salt.is_empty() { "missing (run 'cryptfs init')" } else { "initialized" }
        );
    }
    println!("Shared opens: {}", if config.mount.shared_opens { "enabled" } else { "disabled" });
    println!("Allow other: {}", if config.mount.allow_other { "enabled" } else { "disabled" });

    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
