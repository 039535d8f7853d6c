//! HTTP server command implementation.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use ptyrelay::config::Config;
use ptyrelay::http_client::HttpClient;
use ptyrelay::invoke::Invocations;
use ptyrelay::server::{self, AppState};
use ptyrelay::sink::DurableSinks;
use ptyrelay::terminal::Terminals;

/// Extra time on top of the interrupt grace for output and callbacks to settle.
const SHUTDOWN_SLACK_SECONDS: u64 = 5;

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    if let Some(dir) = &config.output.log_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }

    let client = HttpClient::new(&config.http_client).context("Failed to build HTTP client")?;
    // No broker client is built in, so a queue section is rejected here.
    let durable = DurableSinks::new(config.output.clone(), None)
        .context("Invalid output configuration")?;
    let terminals = Terminals::new(config.terminal.clone(), durable.clone());
    let invocations = Invocations::new(
        client.clone(),
        config.terminal.clone(),
        durable,
        &config.callback,
        config.http_client.max_download_size,
    );

    let state = AppState {
        terminals: terminals.clone(),
        invocations: invocations.clone(),
        base_path: config.server.base_path.trim_end_matches('/').to_string(),
    };
    let app = server::build_app(state, config.server.request_timeout_seconds);

    let ip: IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(addr = %addr, base_path = %config.server.base_path, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let terminal_count = terminals.interrupt_all();
    let invoke_count = invocations.interrupt_all();
    info!(
        terminals = terminal_count,
        invocations = invoke_count,
        "Interrupted remaining processes"
    );

    // Interrupted invocations still report through their callbacks
    let grace = Duration::from_secs(config.terminal.interrupt_grace_seconds + SHUTDOWN_SLACK_SECONDS);
    let drained = tokio::time::timeout(grace, async {
        while !invocations.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = invocations.len(), "Invocations still running at shutdown");
    }

    client
        .shutdown(Duration::from_secs(SHUTDOWN_SLACK_SECONDS))
        .await;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
