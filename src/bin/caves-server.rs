//! caves mock cluster server.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

use caves::control::{self, ControlHandler};
use caves::server::{Config, init_logging, start_cluster};

/// caves mock cluster server.
#[derive(Parser, Debug)]
#[command(name = "caves-server")]
#[command(about = "In-process mock of a document database cluster for SDK testing")]
struct Args {
    /// Path to the configuration file. Defaults are used when it does not exist.
    #[arg(short, long, default_value = "caves.toml")]
    config: PathBuf,

    /// Log filter overriding the configured level (e.g. "caves=debug").
    #[arg(long, env = "CAVES_LOG")]
    log_level: Option<String>,

    /// Dial a waiting harness at this address instead of the configured control mode.
    #[arg(long)]
    control_connect: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        Config::default()
    };
    if args.control_connect.is_some() {
        config.server.control_connect = args.control_connect;
    }

    init_logging(&config.logging, args.log_level.as_deref())?;

    let cluster = start_cluster(&config).await?;
    tracing::info!("Connection string: {}", cluster.connection_string());
    for addr in cluster.mgmt_addrs() {
        tracing::info!("  mgmt -> {}", addr);
    }

    let handler = Arc::new(ControlHandler::new(config.cluster.cluster_options()));

    if let Some(addr) = config.server.control_connect.clone() {
        tracing::info!("Connecting to harness at {}", addr);
        tokio::select! {
            result = control::connect(addr, handler) => {
                if let Err(err) = result {
                    tracing::error!("Control connection failed: {}", err);
                }
            }
            _ = shutdown_signal() => {}
        }
    } else if let Some(addr) = config.control_addr() {
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Control channel on {}", addr);
        tokio::select! {
            result = control::serve(listener, handler) => result?,
            _ = shutdown_signal() => {}
        }
    } else {
        shutdown_signal().await;
    }

    cluster.close();
    tracing::info!("Server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
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

    tracing::info!("Shutdown signal received");
}
