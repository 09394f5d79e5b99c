/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Running position monitor with graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt as _;

use mirrorguard_engine::{Engine, EngineConfig, Supervisor};

#[derive(Parser, Debug)]
#[command(
    name = "mirrorguard",
    version,
    about = "Dual-account protective order monitor"
)]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Run a single sequential reconciliation pass and exit.
    #[arg(long = "once")]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = EngineConfig::load(&args.config_path)?;
    let _log_guard = init_tracing(&args.log_level, &config)?;

    info!(
        config_path = %args.config_path.display(),
        mirror_enabled = config.mirror_enabled(),
        dry_run = args.dry_run,
        "starting mirrorguard"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let engine = Arc::new(Engine::new(config).context("building engine")?);

    if args.once {
        engine.tick().await.context("single reconciliation pass")?;
        info!("single pass complete");
        return Ok(());
    }

    let mut supervisor = Supervisor::new();
    let shutdown = supervisor.shutdown_token();
    setup_signal_handlers(shutdown.clone());

    let engine_for_task = engine.clone();
    supervisor.spawn("monitor-loop", move |token| engine_for_task.run(token));
    info!("monitoring loop started");

    shutdown.cancelled().await;
    info!("shutdown signal received");

    supervisor
        .shutdown_and_wait()
        .await
        .context("shutdown tasks")?;
    info!("shutdown complete");

    Ok(())
}

fn init_tracing(
    log_level: &str,
    config: &EngineConfig,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "mirrorguard.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file_writer.and(std::io::stdout))
        .with_ansi(false)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(guard)
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
