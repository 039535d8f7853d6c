//! Fixed-rate liveness pings.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{HttpClient, HttpRequest, RetryPolicy, execute};

/// Stops a heartbeat started with [`HttpClient::heartbeat`].
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    cancel: CancellationToken,
}

impl HeartbeatHandle {
    /// Prevent further pings. A ping already in flight still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl HttpClient {
    /// Send `request` now and then every `period` until cancelled. Each ping
    /// is a single attempt; failures are logged.
    pub fn heartbeat(&self, request: HttpRequest, period: Duration) -> HeartbeatHandle {
        let cancel = self.cancel.child_token();
        let handle = HeartbeatHandle {
            cancel: cancel.clone(),
        };
        let period = period.max(Duration::from_millis(1));
        let this = self.clone();

        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => this.ping(request.clone()),
                }
            }
            debug!(uri = %request.uri, "Heartbeat stopped");
        });

        handle
    }

    /// Fire one ping on its own task so cancelling the timer leaves it be.
    fn ping(&self, request: HttpRequest) {
        let client = self.client.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            match execute(&client, &cancel, &request, RetryPolicy::none()).await {
                Ok(response) => {
                    debug!(uri = %request.uri, status = response.status_code, "Heartbeat sent")
                }
                Err(e) => warn!(uri = %request.uri, error = %e, "Heartbeat failed"),
            }
        });
    }
}
