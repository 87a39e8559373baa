use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use flashd::config::AppConfig;
use flashd::context::AppContext;
use flashd::core::image::ImageCatalog;
use flashd::core::inventory::{DriveProvider, LinuxInventory};
use flashd::{logging, web};

#[derive(Parser)]
#[command(name = "flashd")]
#[command(about = "Mass flasher for removable media over USB", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon with the HTTP surface.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        listen: SocketAddr,
        #[arg(long, default_value = "images")]
        images_dir: PathBuf,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Simulated engine and inventory; no hardware is touched.
        #[arg(long)]
        simulation: bool,
        /// Allow targets that are not flagged removable.
        #[arg(long)]
        allow_non_removable: bool,
    },
    /// One-shot listing of connected block devices.
    Drives {
        #[arg(long)]
        removable: bool,
    },
    /// One-shot listing of flashable images.
    Images {
        #[arg(long, default_value = "images")]
        images_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Serve {
            listen,
            images_dir,
            data_dir,
            simulation,
            allow_non_removable,
        } => {
            let config = AppConfig {
                listen,
                images_dir,
                data_dir,
                simulation,
                allow_non_removable,
                verbose: cli.verbose,
                log_json: cli.log_json,
            };
            run_daemon(config).await.context("daemon failed")
        }
        Commands::Drives { removable } => run_drives(removable).await,
        Commands::Images { images_dir } => run_images(images_dir),
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    if !config.simulation && !nix::unistd::geteuid().is_root() {
        tracing::warn!("not running as root; raw device access will likely fail");
    }

    std::fs::create_dir_all(&config.images_dir)
        .with_context(|| format!("creating {}", config.images_dir.display()))?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let ctx = AppContext::new(config);
    // Materialise the default grid on first run.
    ctx.layout.load()?;

    web::serve(ctx).await
}

async fn run_drives(removable_only: bool) -> Result<()> {
    let drives = LinuxInventory.list_drives(removable_only).await?;
    if drives.is_empty() {
        println!("no drives found");
        return Ok(());
    }
    for drive in &drives {
        let mut flags = Vec::new();
        if drive.removable {
            flags.push("removable");
        }
        if drive.is_system {
            flags.push("SYSTEM");
        }
        if drive.mounted {
            flags.push("mounted");
        }
        println!(
            "{:<14} {:>10}  {:<24} {}",
            drive.device_path,
            drive.size_human,
            drive.model.as_deref().unwrap_or("-"),
            flags.join(",")
        );
    }
    Ok(())
}

fn run_images(images_dir: PathBuf) -> Result<()> {
    let images = ImageCatalog::new(images_dir).list()?;
    if images.is_empty() {
        println!("no images found");
        return Ok(());
    }
    for image in &images {
        println!(
            "{:<40} {:>10}  {}",
            image.name, image.size_human, image.img_type
        );
    }
    Ok(())
}
