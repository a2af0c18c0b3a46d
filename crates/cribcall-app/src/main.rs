use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod listener;
mod monitor;
mod services;

use cli::{Cli, Command, EXIT_USAGE};

#[tokio::main]
async fn main() {
    // RUST_LOG=debug for more detail.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help/version requests are not usage errors.
            std::process::exit(if e.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };

    info!("CribCall v{}", env!("CARGO_PKG_VERSION"));

    let outcome: Result<()> = match cli.command {
        Command::Monitor(args) => monitor::run(args).await,
        Command::Listener(args) => listener::run(args).await,
    };

    match outcome {
        Ok(()) => info!("Exited cleanly."),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
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
