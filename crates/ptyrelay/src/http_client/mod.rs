//! Retrying asynchronous HTTP invocations.
//!
//! [`HttpClient::invoke`] starts a request on the shared task tracker and
//! returns an [`Invocation`] future. Transport failures and `503` responses
//! are retried with linear backoff: retry `n` waits `n * wait_before_retry`.
//! Response bodies are read incrementally up to a byte limit.

mod heartbeat;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::HttpClientConfig;

pub use heartbeat::HeartbeatHandle;

/// Request bodies are streamed in chunks of this size.
const BODY_CHUNK: usize = 8 * 1024;

// ============================================================================
// Request / response types
// ============================================================================

/// A request to send, possibly more than once.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Stop reading the response after this many bytes. `None` reads it all.
    pub max_download_size: Option<usize>,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            max_download_size: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn max_download_size(mut self, limit: Option<usize>) -> Self {
        self.max_download_size = limit;
        self
    }
}

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait_before_retry: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, wait_before_retry: Duration) -> Self {
        Self {
            max_retries,
            wait_before_retry,
        }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.wait_before_retry * attempt
    }
}

/// Response of a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: String,
    /// `false` when the body was cut off at the download limit.
    pub complete: bool,
}

// ============================================================================
// HttpClientError
// ============================================================================

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service unavailable (503)")]
    ServiceUnavailable,

    #[error("client is shut down")]
    Cancelled,

    #[error("invocation task failed: {0}")]
    Task(String),
}

impl HttpClientError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpClientError::Transport(e) => !e.is_builder(),
            HttpClientError::ServiceUnavailable => true,
            HttpClientError::Cancelled | HttpClientError::Task(_) => false,
        }
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// A pending invocation. Dropping it does not cancel the request.
pub struct Invocation {
    handle: JoinHandle<Result<HttpResponse, HttpClientError>>,
}

impl Future for Invocation {
    type Output = Result<HttpResponse, HttpClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(HttpClientError::Task(e.to_string()))))
    }
}

// ============================================================================
// HttpClient
// ============================================================================

/// Process-wide HTTP client with its own task tracker.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, HttpClientError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("ptyrelay/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Send `request`, retrying transient failures according to `retry`.
    pub fn invoke(&self, request: HttpRequest, retry: RetryPolicy) -> Invocation {
        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let handle = self
            .tracker
            .spawn(async move { execute(&client, &cancel, &request, retry).await });
        Invocation { handle }
    }

    /// Give outstanding requests up to `grace` to finish, then cancel
    /// pending retries and wait for whatever is still in flight.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            debug!(pending = self.tracker.len(), "Cancelling outstanding HTTP invocations");
        }
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

async fn execute(
    client: &reqwest::Client,
    cancel: &CancellationToken,
    request: &HttpRequest,
    retry: RetryPolicy,
) -> Result<HttpResponse, HttpClientError> {
    if cancel.is_cancelled() {
        return Err(HttpClientError::Cancelled);
    }

    let mut attempt = 0;
    loop {
        match send_once(client, request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                attempt += 1;
                let delay = retry.delay(attempt);
                debug!(
                    uri = %request.uri,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying HTTP invocation"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(HttpClientError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                warn!(uri = %request.uri, attempts = attempt + 1, error = %e, "HTTP invocation failed");
                return Err(e);
            }
        }
    }
}

async fn send_once(
    client: &reqwest::Client,
    request: &HttpRequest,
) -> Result<HttpResponse, HttpClientError> {
    let mut builder = client.request(request.method.clone(), &request.uri);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if !request.body.is_empty() {
        builder = builder.body(reqwest::Body::wrap_stream(body_stream(request.body.clone())));
    }

    let response = builder.send().await?;
    let status = response.status();
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(HttpClientError::ServiceUnavailable);
    }

    let (body, complete) = read_limited_body(response, request.max_download_size).await?;
    Ok(HttpResponse {
        status_code: status.as_u16(),
        body: String::from_utf8_lossy(&body).into_owned(),
        complete,
    })
}

fn body_stream(
    body: Bytes,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let chunks: Vec<Result<Bytes, std::io::Error>> = (0..body.len())
        .step_by(BODY_CHUNK)
        .map(|start| Ok(body.slice(start..(start + BODY_CHUNK).min(body.len()))))
        .collect();
    futures::stream::iter(chunks)
}

/// Read the response body up to `limit` bytes. Returns the bytes and whether
/// the body was consumed completely.
async fn read_limited_body(
    response: reqwest::Response,
    limit: Option<usize>,
) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let Some(limit) = limit else {
            body.extend_from_slice(&chunk);
            continue;
        };
        let remaining = limit.saturating_sub(body.len());
        if chunk.len() > remaining {
            body.extend_from_slice(&chunk[..remaining]);
            return Ok((body, false));
        }
        body.extend_from_slice(&chunk);
    }

    Ok((body, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff() {
        let retry = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn unavailable_is_transient() {
        assert!(HttpClientError::ServiceUnavailable.is_transient());
        assert!(!HttpClientError::Cancelled.is_transient());
    }

    #[tokio::test]
    async fn body_stream_splits_into_chunks() {
        let body = Bytes::from(vec![b'x'; BODY_CHUNK * 2 + 10]);
        let chunks: Vec<_> = body_stream(body).collect().await;
        let sizes: Vec<usize> = chunks.into_iter().map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![BODY_CHUNK, BODY_CHUNK, 10]);
    }

    #[tokio::test]
    async fn invoke_after_shutdown_is_cancelled() {
        let client = HttpClient::new(&HttpClientConfig::default()).unwrap();
        client.shutdown(Duration::ZERO).await;

        let result = client
            .invoke(
                HttpRequest::new(Method::GET, "http://127.0.0.1:9/"),
                RetryPolicy::none(),
            )
            .await;
        assert!(matches!(result, Err(HttpClientError::Cancelled)));
    }
}
