use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use rusty_fat32::config::AppConfig;
use rusty_fat32::fs::entry::format_size;
use rusty_fat32::fs::{format_volume, FormatOptions, Volume};
use rusty_fat32::logging;
use rusty_fat32::shell::Shell;

/// Browse and edit a FAT32 disk image from an interactive prompt.
#[derive(Debug, Parser)]
#[command(name = "rusty-fat32", version = env!("APP_VERSION"))]
struct Cli {
    /// Raw disk image holding the FAT32 volume.
    image: PathBuf,

    /// Byte offset of the volume inside the image.
    #[arg(long)]
    offset: Option<u64>,

    /// Log level (off, error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<LevelFilter>,

    /// Create a fresh volume of this many bytes before opening it.
    #[arg(long, value_name = "BYTES")]
    format: Option<u64>,

    /// Sectors per cluster used with --format.
    #[arg(long, default_value_t = 2)]
    sectors_per_cluster: u8,

    /// Make a bare `ls` use the long format.
    #[arg(long)]
    long: bool,

    /// Store the effective offset, log level and listing mode as defaults.
    #[arg(long)]
    save_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load();

    let level = cli.log_level.unwrap_or_else(|| config.level_filter());
    logging::init(level).context("cannot install logger")?;
    let offset = cli.offset.unwrap_or(config.partition_offset);
    let long_listing = cli.long || config.long_listing;

    if cli.save_config {
        let saved = AppConfig {
            partition_offset: offset,
            log_level: level.to_string().to_lowercase(),
            long_listing,
        };
        saved.save().context("cannot save config")?;
        info!("saved defaults to {:?}", AppConfig::user_config_path());
    }

    if let Some(total_bytes) = cli.format {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&cli.image)
            .with_context(|| format!("cannot create {}", cli.image.display()))?;
        let opts = FormatOptions {
            total_bytes,
            sectors_per_cluster: cli.sectors_per_cluster,
            ..FormatOptions::default()
        };
        let summary = format_volume(&mut file, offset, &opts)
            .with_context(|| format!("cannot format {}", cli.image.display()))?;
        info!(
            "formatted {} ({}, {} free clusters)",
            cli.image.display(),
            format_size(total_bytes),
            summary.free_clusters
        );
    }

    let volume = Volume::open_path(&cli.image, offset)
        .with_context(|| format!("cannot open FAT32 volume in {}", cli.image.display()))?;
    let mut shell = Shell::new(volume).with_long_listing(long_listing);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    shell.run(stdin.lock(), &mut stdout, &mut stderr)?;
    Ok(())
}
