use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use tpa::config::AppConfig;
use tpa::logging::init_logging;
use tpa::processor::{Processor, UpdateKind};

/// Watch a directory and run new media files through the processing pipeline.
#[derive(Debug, Parser)]
#[command(name = "tpa", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "TPA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to watch for new files (overrides the config file)
    #[arg(short, long)]
    source_dir: Option<PathBuf>,

    /// Enable debug logging for tpa
    #[arg(short, long)]
    verbose: bool,

    /// Write daily rolling log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    config.apply_env()?;
    if let Some(dir) = args.source_dir {
        config.processor.source_dir = dir;
    }
    if let Some(dir) = args.log_dir {
        config.logging.log_dir = Some(dir);
    }
    if args.verbose {
        config.logging.filter = "tpa=debug".to_string();
    }
    config.validate()?;

    let _logging = init_logging(&config.logging)?;

    let processor = Arc::new(Processor::new(config.processor)?);

    if let Some(mut failures) = processor.take_failures() {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                error!(
                    worker = %failure.label,
                    stage = %failure.stage,
                    error = %failure.error,
                    "Worker stopped after a fatal error"
                );
            }
        });
    }

    let mut updates = processor.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if let Some(item) = update.as_item() {
                        match update.kind {
                            UpdateKind::Trouble => warn!(
                                item_id = %item.id,
                                name = %item.name,
                                stage = %item.stage,
                                "Item needs attention"
                            ),
                            kind => debug!(item_id = %item.id, ?kind, "Item updated"),
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Update listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    processor.start().await.context("starting processor")?;
    info!(
        items = processor.queue().len(),
        workers = processor.workers().len(),
        "tpa is running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    processor.shutdown().await;
    Ok(())
}
