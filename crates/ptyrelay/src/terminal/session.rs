//! One terminal context: its process, connections and sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::bridge::InputBridge;
use super::{AttachError, Registry};
use crate::config::TerminalConfig;
use crate::join::{CompletionJoin, Drained};
use crate::process::{ProcessListener, ProcessSpec, PtyProcess};
use crate::sink::{BinarySink, Outbound, Sink, SinkSet, TextSink};
use crate::status::{ResponseMode, Status, StatusUpdateEvent};

/// Sink id of the session's durable sinks. Connection ids start at 1.
pub(super) const DURABLE_SINK_ID: u64 = 0;

/// Marker written to every sink when a task is over.
pub fn finished_marker(status: Status) -> String {
    format!("% # Finished with status: {status}")
}

struct Master {
    id: u64,
    mode: ResponseMode,
    sink: Option<Arc<Sink>>,
}

struct SessionState {
    sinks: SinkSet,
    master: Option<Master>,
    process: Option<Arc<PtyProcess>>,
    active: bool,
    destroyed: bool,
}

/// Owns zero or one running process for a context and arbitrates the
/// connections attached to it: one writable master, any number of
/// read-only listeners.
pub struct TerminalSession {
    context: String,
    registry: Weak<Registry>,
    terminal: TerminalConfig,
    join: CompletionJoin,
    bridge: OnceLock<InputBridge>,
    next_task_id: AtomicU64,
    state: Mutex<SessionState>,
}

impl TerminalSession {
    pub(super) fn new(
        context: String,
        registry: Weak<Registry>,
        terminal: TerminalConfig,
        durable: Option<Sink>,
    ) -> Self {
        let mut sinks = SinkSet::new();
        if let Some(durable) = durable {
            // A fresh set cannot already hold a primary.
            let _ = sinks.add(DURABLE_SINK_ID, Arc::new(durable));
        }
        Self {
            context,
            registry,
            terminal,
            join: CompletionJoin::new(),
            bridge: OnceLock::new(),
            next_task_id: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                sinks,
                master: None,
                process: None,
                active: false,
                destroyed: false,
            }),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Whether a task is in flight (running or draining its output).
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn has_master(&self) -> bool {
        self.lock().master.is_some()
    }

    /// Number of registered sinks, durable ones included.
    pub fn sink_count(&self) -> usize {
        self.lock().sinks.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session mutex poisoned")
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Bind a connection. A second master is rejected and the existing one
    /// left untouched.
    pub fn attach(
        &self,
        id: u64,
        mode: ResponseMode,
        read_only: bool,
        tx: &UnboundedSender<Outbound>,
    ) -> Result<(), AttachError> {
        let sink = socket_sink(mode, tx).map(Arc::new);
        let mut state = self.lock();
        if state.destroyed {
            return Err(AttachError::Destroyed);
        }

        if read_only {
            if let Some(sink) = sink {
                state.sinks.add(id, sink)?;
            }
            debug!(context = %self.context, connection = id, ?mode, "Listener attached");
            return Ok(());
        }

        if state.master.is_some() {
            return Err(AttachError::MasterActive);
        }
        state.master = Some(Master { id, mode, sink });
        drop(state);

        self.bridge.get_or_init(InputBridge::new);
        info!(context = %self.context, connection = id, ?mode, "Master attached");
        Ok(())
    }

    /// Unbind a connection and destroy the session if it became idle.
    pub fn detach(self: &Arc<Self>, id: u64) {
        {
            let mut state = self.lock();
            if state.master.as_ref().is_some_and(|m| m.id == id) {
                state.master = None;
                info!(context = %self.context, connection = id, "Master detached");
            } else if state.sinks.remove(id).is_some() {
                debug!(context = %self.context, connection = id, "Listener detached");
            }
        }
        self.maybe_destroy();
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Raw input from the master. Goes to the process while one runs,
    /// otherwise to the line-editing bridge.
    pub fn master_input(self: &Arc<Self>, id: u64, data: &[u8]) {
        let (busy, process, echo) = {
            let state = self.lock();
            let Some(master) = state.master.as_ref().filter(|m| m.id == id) else {
                return;
            };
            let echo = (master.mode == ResponseMode::Binary)
                .then(|| master.sink.clone())
                .flatten();
            (state.active, state.process.clone(), echo)
        };

        if busy {
            self.forward_to_process(process, data);
            return;
        }

        let bridge = self.bridge.get_or_init(InputBridge::new);
        let edited = bridge.push(data);
        if let Some(echo) = echo
            && !edited.echo.is_empty()
        {
            let _ = echo.write(&edited.echo);
        }
        for line in edited.lines {
            self.submit_line(line);
        }
    }

    /// A text message from the master. While idle a message is a whole
    /// command line even without a terminator.
    pub fn master_text(self: &Arc<Self>, id: u64, text: &str) {
        let mut data = text.as_bytes().to_vec();
        if !self.is_active() && !text.ends_with(['\n', '\r']) {
            data.push(b'\n');
        }
        self.master_input(id, &data);
    }

    fn submit_line(self: &Arc<Self>, line: String) {
        let (busy, process) = {
            let state = self.lock();
            (state.active, state.process.clone())
        };
        if busy {
            self.forward_to_process(process, format!("{line}\n").as_bytes());
            return;
        }
        if line.trim().is_empty() {
            return;
        }
        self.start_task(line);
    }

    /// Input while a task is in flight. Dropped once the process has exited
    /// and its output is still draining.
    fn forward_to_process(&self, process: Option<Arc<PtyProcess>>, data: &[u8]) {
        let Some(process) = process else {
            debug!(context = %self.context, "Dropping input, task is finishing");
            return;
        };
        if let Err(e) = process.write_stdin(data) {
            warn!(context = %self.context, error = %e, "Failed to write to process");
        }
    }

    /// Echo the command to every sink, then run it.
    fn start_task(self: &Arc<Self>, line: String) {
        {
            let mut state = self.lock();
            if state.destroyed {
                debug!(context = %self.context, "Session closed, dropping command");
                return;
            }
            // Held from here on so a detach during the spawn cannot tear the
            // session down under the new process.
            state.active = true;
        }

        let echo = format!("% {line}");
        for sink in self.sinks_snapshot(false) {
            if let Err(e) = sink.write_line(&echo) {
                debug!(context = %self.context, error = %e, "Failed to echo input");
            }
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        let spec = ProcessSpec::new(task_id, line).with_terminal(&self.terminal);
        let listener: Arc<dyn ProcessListener> = Arc::new(TaskListener {
            session: Arc::clone(self),
        });

        match PtyProcess::spawn(spec, listener) {
            Ok(process) => {
                let mut state = self.lock();
                if state.active && !process.status().is_final() {
                    state.process = Some(process);
                }
            }
            Err(e) => {
                warn!(context = %self.context, task_id, error = %e, "Failed to start process");
                let event =
                    StatusUpdateEvent::new(task_id, Status::Failed).with_message(e.to_string());
                self.complete(event);
            }
        }
    }

    /// Interrupt the running process, if any.
    pub fn interrupt(&self) -> bool {
        let process = self.lock().process.clone();
        match process {
            Some(process) => process.interrupt().is_ok(),
            None => false,
        }
    }

    // ========================================================================
    // Process events
    // ========================================================================

    fn on_stdout(&self, data: &[u8]) {
        for sink in self.sinks_snapshot(true) {
            if let Err(e) = sink.write(data) {
                debug!(context = %self.context, error = %e, "Sink write failed");
            }
        }
    }

    fn on_stdout_closed(self: &Arc<Self>, checksum: String) {
        let drained = Drained {
            checksum: Some(checksum),
            flush_failure: self.flush_primary(),
        };
        if let Some(event) = self.join.stdout_drained(drained) {
            self.complete(event);
        }
    }

    fn on_status(self: &Arc<Self>, old: Status, event: StatusUpdateEvent) {
        debug!(
            context = %self.context,
            task_id = event.task_id,
            from = %old,
            to = %event.new_status,
            "Status transition"
        );
        if event.new_status.is_final() {
            // The task stays active until the join fires so the session
            // cannot be torn down while output is still draining.
            self.lock().process = None;
            if let Some(event) = self.join.final_status(event) {
                self.complete(event);
            }
        } else {
            self.lock().active = true;
            self.join.reset();
            self.broadcast(&event);
        }
    }

    /// Flush the primary sink. Returns the reason on failure.
    fn flush_primary(&self) -> Option<String> {
        let primary_owner = self
            .lock()
            .sinks
            .iter()
            .find(|s| s.primary().is_some())
            .cloned();

        primary_owner
            .as_ref()
            .and_then(|owner| owner.primary())
            .and_then(|primary| primary.flush().err())
            .map(|e| {
                warn!(context = %self.context, error = %e, "Primary sink flush failed");
                format!("failed to flush output: {e}")
            })
    }

    /// The join fired: mark the end in every sink and make it durable, drop
    /// the session if it is idle, then tell status listeners.
    fn complete(self: &Arc<Self>, mut event: StatusUpdateEvent) {
        let marker = finished_marker(event.new_status);
        for sink in self.sinks_snapshot(true) {
            if let Err(e) = sink.write_line(&marker) {
                debug!(context = %self.context, error = %e, "Failed to write marker");
            }
        }
        if let Some(reason) = self.flush_primary() {
            event.new_status = Status::Failed;
            event.message = Some(reason);
        }
        self.lock().active = false;
        info!(
            context = %self.context,
            task_id = event.task_id,
            status = %event.new_status,
            "Task finished"
        );
        self.maybe_destroy();
        self.broadcast(&event);
    }

    fn broadcast(&self, event: &StatusUpdateEvent) {
        if let Some(registry) = self.registry.upgrade() {
            registry.broadcast(&self.context, event);
        }
    }

    /// Registered sinks, optionally followed by the master's output sink.
    fn sinks_snapshot(&self, with_master: bool) -> Vec<Arc<Sink>> {
        let state = self.lock();
        let mut sinks: Vec<Arc<Sink>> = state.sinks.iter().cloned().collect();
        if with_master && let Some(sink) = state.master.as_ref().and_then(|m| m.sink.clone()) {
            sinks.push(sink);
        }
        sinks
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    fn maybe_destroy(self: &Arc<Self>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_idle(self);
        }
    }

    /// Flag the session destroyed if nothing keeps it alive. Called with the
    /// registry entry locked.
    pub(super) fn mark_destroyed_if_idle(&self) -> bool {
        let mut state = self.lock();
        if state.destroyed || state.active || state.master.is_some() {
            return false;
        }
        state.destroyed = true;
        true
    }

    /// Close and drop every sink. Read-only connections see their channel
    /// close.
    pub(super) fn release(&self) {
        let sinks = self.lock().sinks.drain();
        for sink in sinks {
            if let Err(e) = sink.close() {
                debug!(context = %self.context, error = %e, "Sink close failed");
            }
        }
    }
}

fn socket_sink(mode: ResponseMode, tx: &UnboundedSender<Outbound>) -> Option<Sink> {
    match mode {
        ResponseMode::Binary => Some(Sink::Binary(BinarySink::new(tx.clone()))),
        ResponseMode::Text => Some(Sink::Text(TextSink::new(tx.clone()))),
        ResponseMode::Silent => None,
    }
}

/// Routes process callbacks into the session that started it.
struct TaskListener {
    session: Arc<TerminalSession>,
}

impl ProcessListener for TaskListener {
    fn on_stdout(&self, data: &[u8]) {
        self.session.on_stdout(data);
    }

    fn on_stdout_closed(&self, checksum: String) {
        self.session.on_stdout_closed(checksum);
    }

    fn on_status(&self, old: Status, event: StatusUpdateEvent) {
        self.session.on_status(old, event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::config::TerminalConfig;
    use crate::sink::DurableSinks;
    use crate::status::ResponseMode;
    use crate::terminal::Terminals;

    #[tokio::test]
    async fn destroyed_session_starts_no_task() {
        let terminal = TerminalConfig {
            shell: "sh".to_string(),
            ..TerminalConfig::default()
        };
        let terminals = Terminals::new(terminal, DurableSinks::disabled());
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        terminals.listen("ctx", status_tx);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = terminals
            .attach("ctx", 1, ResponseMode::Silent, false, &tx)
            .unwrap();
        session.detach(1);
        assert!(session.is_destroyed());

        session.start_task("echo late".to_string());

        assert!(!session.is_active());
        assert!(session.lock().process.is_none());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(status_rx.try_recv().is_err());
    }
}

