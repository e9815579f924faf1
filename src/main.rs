//! layerfs - overlay a primary directory on a fallback directory
//!
//! Usage:
//!   layerfs mount <primary> <fallback> <mount_point>  - Mount the overlay
//!   layerfs unmount <mount_point>                     - Unmount it
//!   layerfs init                                      - Write a default config file
//!   layerfs status                                    - Show the effective configuration

use clap::{Parser, Subcommand};
use layerfs::{fs::OverlayFs, Config, Error, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "layerfs")]
#[command(version)]
#[command(about = "Union filesystem over a primary and a fallback directory")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/layerfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the overlay
    Mount {
        /// Directory whose entries take precedence
        primary: PathBuf,

        /// Directory consulted when the primary lacks an entry
        fallback: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Status,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Mount {
            primary,
            fallback,
            mount_point,
            allow_other,
        } => cmd_mount(config_path, primary, fallback, &mount_point, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Init { force } => cmd_init(config_path, force),

        Commands::Status => cmd_status(config_path),
    }
}

/// Config file when present, defaults plus environment otherwise
fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
    } else {
        Config::from_env()
    }
}

fn cmd_mount(
    config_path: &Path,
    primary: PathBuf,
    fallback: PathBuf,
    mount_point: &Path,
    allow_other: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if allow_other {
        config.mount.allow_other = true;
    }

    let primary = expand_tilde(&primary);
    let fallback = expand_tilde(&fallback);
    let fs = OverlayFs::new(primary, fallback, &config)?;

    std::fs::create_dir_all(mount_point)?;

    info!("Mounting at {:?}", mount_point);

    let mut options = vec![fuser::MountOption::FSName(config.mount.fs_name.clone())];

    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }

    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    info!("Mount at {:?} finished", mount_point);
    Ok(())
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

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists, pass --force to overwrite",
            config_path
        )));
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    Config::default().save(config_path)?;
    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let source = if config_path.exists() {
        format!("{:?}", config_path)
    } else {
        "defaults".to_string()
    };

    println!("layerfs configuration ({})", source);
    println!("==========================");
    println!("Filesystem name: {}", config.mount.fs_name);
    println!("Allow other: {}", config.mount.allow_other);
    println!("Auto unmount: {}", config.mount.auto_unmount);
    println!("Attribute TTL: {} ms", config.mount.attr_ttl_ms);
    println!("In-memory root mode: {:o}", config.memory.root_mode);
    println!(
        "Synthetic statfs: {} blocks of {} bytes, {} available",
        config.memory.blocks, config.memory.block_size, config.memory.blocks_available
    );
    println!(
        "Listing deduplication: {}",
        if config.listing.deduplicate { "enabled" } else { "disabled" }
    );

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
