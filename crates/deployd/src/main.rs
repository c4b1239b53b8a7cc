//! deployd - deployment control plane daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use deploy_core::Config;
use deployd::{Daemon, DaemonConfig};
use eyre::{eyre, WrapErr};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "deployd", about = "Deployment control plane daemon", version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "DEPLOYD_BIND", default_value = "127.0.0.1:7800")]
    bind: SocketAddr,

    /// Path to a deployd.conf file
    #[arg(short, long, env = "DEPLOYD_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the SQLite database
    #[arg(long, env = "DEPLOYD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory for timeline reports
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut core = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(base) = cli.config.as_deref().and_then(std::path::Path::parent) {
        core.resolve_paths(base);
    }

    let defaults = DaemonConfig::default();
    let config = DaemonConfig {
        bind: cli.bind,
        db_path: cli.db_path.unwrap_or(defaults.db_path),
        reports_dir: cli.reports_dir.unwrap_or(defaults.reports_dir),
        core,
        ..defaults
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .map_err(|e| eyre!("failed to initialize daemon: {e}"))?;

        let run = daemon.run();
        tokio::pin!(run);

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = &mut run => {
                    return result.map_err(|e| eyre!("daemon error: {e}"));
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = &mut run => {
                    return result.map_err(|e| eyre!("daemon error: {e}"));
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
            }
        }

        daemon.shutdown();
        run.await.map_err(|e| eyre!("daemon error: {e}"))
    })
}
