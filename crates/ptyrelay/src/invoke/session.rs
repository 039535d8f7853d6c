use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use super::{CallbackPayload, InvokeRegistry};
use crate::http_client::{HeartbeatHandle, HttpRequest};
use crate::join::{CompletionJoin, Drained};
use crate::process::{ProcessListener, PtyProcess};
use crate::sink::Sink;
use crate::status::{Status, StatusUpdateEvent};
use crate::terminal::finished_marker;

#[derive(Default)]
struct InvokeState {
    process: Option<Arc<PtyProcess>>,
    heartbeat: Option<HeartbeatHandle>,
    finished: bool,
}

/// A command started through the invoke endpoint. Holds its process
/// directly; there is no connection to arbitrate.
pub struct InvokeSession {
    id: String,
    callback: HttpRequest,
    sink: Option<Sink>,
    registry: Weak<InvokeRegistry>,
    join: CompletionJoin,
    state: Mutex<InvokeState>,
}

impl InvokeSession {
    pub(super) fn new(
        id: String,
        callback: HttpRequest,
        sink: Option<Sink>,
        registry: Weak<InvokeRegistry>,
    ) -> Self {
        Self {
            id,
            callback,
            sink,
            registry,
            join: CompletionJoin::new(),
            state: Mutex::new(InvokeState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InvokeState> {
        self.state.lock().expect("invoke session mutex poisoned")
    }

    pub(super) fn echo(&self, command: &str) {
        if let Some(sink) = &self.sink
            && let Err(e) = sink.write_line(&format!("% {command}"))
        {
            debug!(session_id = %self.id, error = %e, "Failed to echo command");
        }
    }

    pub(super) fn set_process(&self, process: Arc<PtyProcess>) {
        let mut state = self.lock();
        if !state.finished {
            state.process = Some(process);
        }
    }

    /// Start the heartbeat and keep it until completion. Nothing is started
    /// once the command has finished. Returns whether it was started.
    pub(super) fn start_heartbeat(&self, start: impl FnOnce() -> HeartbeatHandle) -> bool {
        let mut state = self.lock();
        if state.finished {
            return false;
        }
        state.heartbeat = Some(start());
        true
    }

    /// The process never started; release what was opened for it.
    pub(super) fn abandon(&self) {
        self.lock().finished = true;
        self.close_sink();
    }

    /// Cooperative cancel. Completion is still reported through the callback.
    pub fn interrupt(&self) {
        let process = self.lock().process.clone();
        match process {
            Some(process) => {
                if let Err(e) = process.interrupt() {
                    debug!(session_id = %self.id, error = %e, "Interrupt ignored");
                } else {
                    info!(session_id = %self.id, "Invocation interrupted");
                }
            }
            None => debug!(session_id = %self.id, "Nothing to interrupt"),
        }
    }

    /// The join fired: stop the heartbeat, make the output durable, then
    /// report to the callback.
    fn complete(&self, event: StatusUpdateEvent) {
        let heartbeat = {
            let mut state = self.lock();
            state.finished = true;
            state.process = None;
            state.heartbeat.take()
        };
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel();
        }

        let (status, message) = match self.finish_output(event.new_status) {
            Ok(()) => (event.new_status, event.message),
            Err(reason) => (Status::Failed, Some(reason)),
        };
        info!(
            session_id = %self.id,
            status = %status,
            checksum = event.output_checksum.as_deref().unwrap_or(""),
            "Invocation finished"
        );

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        registry.remove(&self.id);

        let payload = CallbackPayload {
            session_id: self.id.clone(),
            status,
            message,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to encode callback");
                return;
            }
        };
        let request = self
            .callback
            .clone()
            .header("Content-Type", "application/json")
            .body(body);

        let invocation = registry.client().invoke(request, registry.retry());
        let session_id = self.id.clone();
        tokio::spawn(async move {
            match invocation.await {
                Ok(response) => {
                    info!(session_id = %session_id, status = response.status_code, "Callback delivered")
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "Callback delivery failed"),
            }
        });
    }

    /// Write the end marker, flush the primary sink and close everything.
    /// A flush failure is returned as the reason the task failed.
    fn finish_output(&self, status: Status) -> Result<(), String> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        if let Err(e) = sink.write_line(&finished_marker(status)) {
            debug!(session_id = %self.id, error = %e, "Failed to write marker");
        }
        let flushed = match sink.primary() {
            Some(primary) => primary.flush().map_err(|e| {
                warn!(session_id = %self.id, error = %e, "Primary sink flush failed");
                format!("failed to flush output: {e}")
            }),
            None => Ok(()),
        };
        self.close_sink();
        flushed
    }

    fn close_sink(&self) {
        if let Some(sink) = &self.sink
            && let Err(e) = sink.close()
        {
            debug!(session_id = %self.id, error = %e, "Sink close failed");
        }
    }
}

impl ProcessListener for InvokeSession {
    fn on_stdout(&self, data: &[u8]) {
        if let Some(sink) = &self.sink
            && let Err(e) = sink.write(data)
        {
            debug!(session_id = %self.id, error = %e, "Sink write failed");
        }
    }

    fn on_stdout_closed(&self, checksum: String) {
        let drained = Drained {
            checksum: Some(checksum),
            flush_failure: None,
        };
        if let Some(event) = self.join.stdout_drained(drained) {
            self.complete(event);
        }
    }

    fn on_status(&self, old: Status, event: StatusUpdateEvent) {
        debug!(session_id = %self.id, from = %old, to = %event.new_status, "Status transition");
        if event.new_status.is_final() {
            if let Some(event) = self.join.final_status(event) {
                self.complete(event);
            }
        } else {
            self.join.reset();
        }
    }
}
