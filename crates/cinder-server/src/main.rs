//! Cinder CI server entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod config;
mod telemetry;

use app::App;
use config::ServerConfig;

#[derive(Parser)]
#[command(name = "cinder")]
#[command(author, version, about = "Cinder CI server", long_about = None)]
struct Cli {
    /// Configuration file (YAML or TOML).
    #[arg(short, long, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.addr`.
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err.into());
        }
    }

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }
    telemetry::init(&config.logging);

    let app = App::build(&config).await?;
    let cancel = CancellationToken::new();
    let background = app.spawn_background(&cancel);

    let listener = TcpListener::bind(&config.server.addr).await?;
    info!(addr = %config.server.addr, link = %config.server.link, "cinder server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app.router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for handle in background {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task failed");
        }
    }
    info!("cinder server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
