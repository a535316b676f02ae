use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use schedd_runtime::api::{self, AppState};
use schedd_runtime::{AccountDirectory, Config, EngineConfig, SchedulerEngine, TaskStore};

/// Single-node task scheduler with a JSON/HTTP control plane.
#[derive(Debug, Parser)]
#[command(name = "schedd", version, about)]
struct Cli {
    /// Path to a Unix domain socket to bind instead of TCP.
    #[arg(long, env = "SCHEDULER_UNIX_SOCKET")]
    unix_socket: Option<String>,

    /// Path to the SQLite database file.
    #[arg(long = "db", env = "SCHEDULER_DB_PATH")]
    db: Option<String>,

    /// Base URL path to mount the API under.
    #[arg(long, env = "SCHEDULER_BASE_PATH")]
    base_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(
        Config::load(cli.db, cli.base_path, cli.unix_socket).context("invalid configuration")?,
    );

    let accounts = AccountDirectory::from_system();
    let store = Arc::new(
        TaskStore::open(&config.db_path, accounts.clone()).with_context(|| {
            format!("failed to open task database at {}", config.db_path.display())
        })?,
    );
    tracing::info!("task database ready at {}", config.db_path.display());

    let engine = Arc::new(SchedulerEngine::new(
        store.clone(),
        EngineConfig {
            task_timeout: config.task_timeout,
            condition_timeout: config.condition_timeout,
            ..EngineConfig::default()
        },
    ));
    engine.start().await;

    let state = AppState {
        store,
        engine: engine.clone(),
        accounts,
        config: config.clone(),
    };
    api::serve(state, shutdown_signal())
        .await
        .context("control plane failed")?;

    engine.stop().await;
    Ok(())
}

/// Resolves on the first SIGINT/SIGTERM. Later signals are absorbed by the
/// installed handlers, so shutdown is not interrupted.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
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
    tracing::info!("shutdown signal received, stopping scheduler...");
}
