//! One-shot invoke protocol.
//!
//! `POST /servlet/http-invoker` starts a command and answers with a session
//! id straight away. When the command is over (output drained and status
//! final) the result is delivered to the caller's callback with retries.
//! `PUT` with the session id interrupts the command.

mod handlers;
mod session;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CallbackConfig, TerminalConfig};
use crate::http_client::{HttpClient, HttpRequest, RetryPolicy};
use crate::process::{ProcessError, ProcessListener, ProcessSpec, PtyProcess};
use crate::sink::DurableSinks;
use crate::status::Status;

pub use handlers::{cancel, invoke};
pub use session::InvokeSession;

/// Path of the invoke endpoint.
pub const INVOKE_PATH: &str = "/servlet/http-invoker";

// ============================================================================
// Wire types
// ============================================================================

/// An HTTP request the agent makes on the caller's behalf.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RemoteRequest {
    /// Validate and turn into a client request.
    pub fn to_http_request(&self) -> Result<HttpRequest, InvokeError> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| InvokeError::InvalidMethod(self.method.clone()))?;
        let url = url::Url::parse(&self.url)?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(InvokeError::UnsupportedScheme(scheme.to_string())),
        }

        let mut request = HttpRequest::new(method, url.as_str());
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(amount),
            TimeUnit::Microseconds => Duration::from_micros(amount),
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3_600)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    pub request: RemoteRequest,
    pub delay: u64,
    #[serde(default)]
    pub delay_unit: TimeUnit,
}

impl HeartbeatConfig {
    pub fn period(&self) -> Result<Duration, InvokeError> {
        let period = self.delay_unit.duration(self.delay);
        if period.is_zero() {
            return Err(InvokeError::InvalidDelay);
        }
        Ok(period)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub command: String,
    pub callback: RemoteRequest,
    #[serde(default)]
    pub heartbeat_config: Option<HeartbeatConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub session_id: String,
}

/// Body delivered to the callback when a command is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub session_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// InvokeError
// ============================================================================

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid http method: {0}")]
    InvalidMethod(String),

    #[error("heartbeat delay must be positive")]
    InvalidDelay,

    #[error("failed to start process: {0}")]
    Spawn(#[from] ProcessError),
}

impl InvokeError {
    /// Whether the caller sent a bad request.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, InvokeError::Spawn(_))
    }
}

// ============================================================================
// Invocations (registry)
// ============================================================================

/// Handle to the live invoke sessions.
#[derive(Clone)]
pub struct Invocations {
    inner: Arc<InvokeRegistry>,
}

pub(crate) struct InvokeRegistry {
    sessions: DashMap<String, Arc<InvokeSession>>,
    client: HttpClient,
    terminal: TerminalConfig,
    durable: DurableSinks,
    retry: RetryPolicy,
    max_download_size: Option<usize>,
}

impl Invocations {
    pub fn new(
        client: HttpClient,
        terminal: TerminalConfig,
        durable: DurableSinks,
        callback: &CallbackConfig,
        max_download_size: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(InvokeRegistry {
                sessions: DashMap::new(),
                client,
                terminal,
                durable,
                retry: RetryPolicy::new(
                    callback.max_retries,
                    Duration::from_millis(callback.wait_before_retry_millis),
                ),
                max_download_size,
            }),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<InvokeSession>> {
        self.inner.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Start `request` and return its session id.
    pub fn start(&self, request: InvokeRequest) -> Result<String, InvokeError> {
        if request.command.trim().is_empty() {
            return Err(InvokeError::EmptyCommand);
        }
        let callback = request
            .callback
            .to_http_request()?
            .max_download_size(self.inner.max_download_size);
        let heartbeat = match &request.heartbeat_config {
            Some(config) => Some((
                config
                    .request
                    .to_http_request()?
                    .max_download_size(self.inner.max_download_size),
                config.period()?,
            )),
            None => None,
        };

        let session_id = Uuid::new_v4().to_string();
        let durable = self.inner.durable.build(&session_id).unwrap_or_else(|e| {
            warn!(session_id = %session_id, error = %e, "Failed to open durable sinks");
            None
        });
        let session = Arc::new(InvokeSession::new(
            session_id.clone(),
            callback,
            durable,
            Arc::downgrade(&self.inner),
        ));
        self.inner
            .sessions
            .insert(session_id.clone(), Arc::clone(&session));

        session.echo(&request.command);
        let spec = ProcessSpec::new(1, request.command.clone()).with_terminal(&self.inner.terminal);
        let listener: Arc<dyn ProcessListener> = session.clone();
        let process = match PtyProcess::spawn(spec, listener) {
            Ok(process) => process,
            Err(e) => {
                self.inner.sessions.remove(&session_id);
                session.abandon();
                return Err(e.into());
            }
        };
        session.set_process(process);

        if let Some((request, period)) = heartbeat {
            let client = &self.inner.client;
            if !session.start_heartbeat(|| client.heartbeat(request, period)) {
                debug!(session_id = %session_id, "Command already finished, no heartbeat");
            }
        }

        info!(session_id = %session_id, command = %request.command, "Invocation started");
        Ok(session_id)
    }

    /// Interrupt a running session. Returns `false` if it is unknown.
    pub fn cancel(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        session.interrupt();
        true
    }

    /// Interrupt every running session. Used on shutdown.
    pub fn interrupt_all(&self) -> usize {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &sessions {
            session.interrupt();
        }
        sessions.len()
    }
}

impl InvokeRegistry {
    pub(crate) fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub(crate) fn client(&self) -> &HttpClient {
        &self.client
    }

    pub(crate) fn retry(&self) -> RetryPolicy {
        self.retry
    }
}
