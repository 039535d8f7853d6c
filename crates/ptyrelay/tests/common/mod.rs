//! Common test utilities.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;

use ptyrelay::config::{CallbackConfig, HttpClientConfig, TerminalConfig};
use ptyrelay::http_client::HttpClient;
use ptyrelay::invoke::Invocations;
use ptyrelay::server::{self, AppState};
use ptyrelay::sink::DurableSinks;
use ptyrelay::terminal::Terminals;

/// Terminal settings for tests: `sh` is always there, `bash` may not be.
pub fn test_terminal() -> TerminalConfig {
    TerminalConfig {
        shell: "sh".to_string(),
        cols: 80,
        rows: 24,
        interrupt_grace_seconds: 5,
    }
}

/// Create a test `AppState` without durable sinks.
pub fn test_app_state() -> AppState {
    test_app_state_with(test_terminal())
}

pub fn test_app_state_with(terminal: TerminalConfig) -> AppState {
    build_state(terminal, DurableSinks::disabled())
}

/// Create a test `AppState` whose sessions copy output to `durable`.
pub fn test_app_state_with_durable(durable: DurableSinks) -> AppState {
    build_state(test_terminal(), durable)
}

fn build_state(terminal: TerminalConfig, durable: DurableSinks) -> AppState {
    let client = HttpClient::new(&HttpClientConfig::default()).unwrap();
    let callback = CallbackConfig {
        max_retries: 3,
        wait_before_retry_millis: 20,
    };
    AppState {
        terminals: Terminals::new(terminal.clone(), durable.clone()),
        invocations: Invocations::new(client, terminal, durable, &callback, Some(64 * 1024)),
        base_path: String::new(),
    }
}

/// Create a test app with empty state.
pub fn test_app() -> Router {
    server::build_app(test_app_state(), 300)
}

/// Serve `app` on an ephemeral local port.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
