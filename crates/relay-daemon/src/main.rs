//! # relay-daemon
//!
//! Standalone relay server binary: loads configuration from the
//! environment, applies CLI overrides, and serves until ctrl-c.
//!
//! Without an application invoker every dotted command is rejected with
//! `BAD_COMMAND`; the built-in commands (listeners, auth, uploads) still
//! work, which is enough for event fan-out and file sync deployments.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::{NullInvoker, RelayServer, ServerConfig};
use tracing_subscriber::EnvFilter;

/// Relay transport server.
#[derive(Parser, Debug)]
#[command(name = "relay-daemon", about = "Relay transport server")]
struct Cli {
    /// Host to bind (overrides RELAY_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides RELAY_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Strip diagnostic detail from error responses (overrides RELAY_PRODUCTION).
    #[arg(long)]
    production: bool,

    /// Serve Prometheus metrics at /metrics.
    #[arg(long)]
    metrics: bool,
}

impl Cli {
    fn apply(self, mut config: ServerConfig) -> (ServerConfig, bool) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.production {
            config.production = true;
        }
        (config, self.metrics)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, serve_metrics) = Cli::parse().apply(ServerConfig::from_env());

    let mut server = RelayServer::new(config, Arc::new(NullInvoker));
    if serve_metrics {
        let handle = relay_server::metrics::install_recorder()
            .context("failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let (addr, serve_task) = server.listen().await.context("failed to bind server")?;
    tracing::info!("relay daemon listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down...");

    if server.graceful_shutdown(serve_task).await {
        tracing::info!("shutdown complete");
        Ok(())
    } else {
        tracing::warn!("sessions did not drain within the shutdown cap");
        // Remaining tasks were aborted by the coordinator; nothing left to wait for.
        std::process::exit(1);
    }
}
