use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use schedwatch::{SchedWatchEngine, settings::Settings, telemetry};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "schedwatch", about = "Per-task CPU scheduling latency collector")]
struct Opt {
    /// YAML configuration file
    #[arg(short, long, env = "SCHEDWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let settings = Settings::new(opt.config.as_deref()).context("Failed to load settings")?;

    if let Err(e) = telemetry::init_metrics() {
        error!("Failed to initialize self-metrics: {:#}", e);
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let result = match SchedWatchEngine::new(settings) {
        Ok(engine) => engine.run(cancel).await,
        Err(e) => Err(e),
    };

    telemetry::shutdown_metrics();
    info!("Exiting...");
    result
}

fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
    Ok(())
}
