use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use converter::{progress_broker, Controller, ConverterConfig, FfmpegEngine, StatusServer};
use log::{error, info, warn, LevelFilter};
use tokio::signal;

/// Watch a directory and convert every media file that lands in it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to watch for new files
    #[arg(long)]
    watch_dir: Option<PathBuf>,

    /// Directory converted files are written to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Address of the progress endpoint
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let mut logger = env_logger::Builder::new();
    logger
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let mut cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = args.watch_dir {
        cfg.watch_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        cfg.output_dir = dir;
    }
    if let Some(addr) = args.http_addr {
        cfg.http_addr = addr;
    }
    cfg.validate().context("Invalid configuration")?;

    info!("Media converter {} starting", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded:");
    info!("  Watch dir: {}", cfg.watch_dir.display());
    info!("  Output dir: {}", cfg.output_dir.display());
    info!("  Video codec: {}", cfg.video_codec);
    info!("  Progress endpoint: {}", cfg.http_addr);

    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("Failed to create output directory: {}", cfg.output_dir.display()))?;

    let engine = FfmpegEngine::new(&cfg);
    if let Err(e) = engine.detect_version().await {
        warn!("Could not determine FFmpeg version: {:#}", e);
    }

    let (progress, endpoint) = progress_broker();
    let server = StatusServer::start(cfg.http_addr, progress)
        .await
        .context("Failed to start progress endpoint")?;

    let controller = Controller::new(cfg, Arc::new(engine), endpoint);
    match controller.run(Some(server), shutdown_signal()).await {
        Ok(report) => {
            info!(
                "Converted {} file(s), {} cancelled, {} failed",
                report.stats.completed, report.stats.cancelled, report.stats.failed
            );
            Ok(())
        }
        Err(e) => {
            error!("Converter stopped: {}", e);
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
