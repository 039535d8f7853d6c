//! Terminal protocol: sessions keyed by context, shared over WebSockets.
//!
//! Uses `DashMap` for concurrent access with atomic get-or-create. A session
//! is created on first attach and dropped once it has neither a running task
//! nor a master connection. Status subscribers are kept per context so they
//! outlive any single session.

mod bridge;
mod route;
mod session;
mod socket;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::config::TerminalConfig;
use crate::sink::{DurableSinks, Outbound, SinkError};
use crate::status::{ResponseMode, StatusUpdateEvent};

pub use bridge::{Edited, InputBridge};
pub use route::{Endpoint, SocketRoute};
pub use session::{TerminalSession, finished_marker};
pub use socket::socket_handler;

/// Close reason sent to a rejected second master.
pub const MASTER_ACTIVE_REASON: &str = "Already active master connection";

// ============================================================================
// AttachError
// ============================================================================

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("Already active master connection")]
    MasterActive,

    /// The session was torn down concurrently; retry on a fresh one.
    #[error("session was destroyed")]
    Destroyed,

    #[error(transparent)]
    Sink(#[from] SinkError),
}

// ============================================================================
// Terminals (public handle)
// ============================================================================

/// Handle to the terminal session registry.
#[derive(Clone)]
pub struct Terminals {
    inner: Arc<Registry>,
}

pub(crate) struct Registry {
    sessions: DashMap<String, Arc<TerminalSession>>,
    listeners: DashMap<String, DashMap<u64, UnboundedSender<StatusUpdateEvent>>>,
    terminal: TerminalConfig,
    durable: DurableSinks,
    next_id: AtomicU64,
}

impl Terminals {
    pub fn new(terminal: TerminalConfig, durable: DurableSinks) -> Self {
        Self {
            inner: Arc::new(Registry {
                sessions: DashMap::new(),
                listeners: DashMap::new(),
                terminal,
                durable,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A fresh connection id. Never returns the durable sink id.
    pub fn next_connection_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, context: &str) -> Option<Arc<TerminalSession>> {
        self.inner.sessions.get(context).map(|s| Arc::clone(&s))
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Attach a connection to the session for `context`, creating it if
    /// needed.
    pub fn attach(
        &self,
        context: &str,
        id: u64,
        mode: ResponseMode,
        read_only: bool,
        tx: &UnboundedSender<Outbound>,
    ) -> Result<Arc<TerminalSession>, AttachError> {
        loop {
            let session = self.get_or_create(context);
            match session.attach(id, mode, read_only, tx) {
                Ok(()) => return Ok(session),
                Err(AttachError::Destroyed) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn get_or_create(&self, context: &str) -> Arc<TerminalSession> {
        let entry = self
            .inner
            .sessions
            .entry(context.to_string())
            .or_insert_with(|| {
                let durable = match self.inner.durable.build(context) {
                    Ok(sink) => sink,
                    Err(e) => {
                        warn!(context = %context, error = %e, "Failed to open durable sinks");
                        None
                    }
                };
                info!(context = %context, "Session created");
                Arc::new(TerminalSession::new(
                    context.to_string(),
                    Arc::downgrade(&self.inner),
                    self.inner.terminal.clone(),
                    durable,
                ))
            });
        Arc::clone(&entry)
    }

    /// Subscribe to status events of `context`. Returns the subscription id.
    pub fn listen(&self, context: &str, tx: UnboundedSender<StatusUpdateEvent>) -> u64 {
        let id = self.next_connection_id();
        self.inner
            .listeners
            .entry(context.to_string())
            .or_default()
            .insert(id, tx);
        debug!(context = %context, listener = id, "Status listener added");
        id
    }

    /// Number of status subscribers for `context`.
    pub fn listener_count(&self, context: &str) -> usize {
        self.inner.listeners.get(context).map_or(0, |s| s.len())
    }

    pub fn unlisten(&self, context: &str, id: u64) {
        if let Some(subscribers) = self.inner.listeners.get(context) {
            subscribers.remove(&id);
        }
        self.inner
            .listeners
            .remove_if(context, |_, subscribers| subscribers.is_empty());
    }

    /// Interrupt every running task. Used on shutdown.
    pub fn interrupt_all(&self) -> usize {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.iter().filter(|s| s.interrupt()).count()
    }
}

impl Registry {
    pub(crate) fn broadcast(&self, context: &str, event: &StatusUpdateEvent) {
        if let Some(subscribers) = self.listeners.get(context) {
            subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Drop `session` from the map if it is still the registered one and
    /// nothing keeps it alive.
    pub(crate) fn remove_if_idle(&self, session: &Arc<TerminalSession>) {
        let removed = self.sessions.remove_if(session.context(), |_, current| {
            Arc::ptr_eq(current, session) && current.mark_destroyed_if_idle()
        });
        if let Some((context, session)) = removed {
            session.release();
            info!(context = %context, "Session destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::config::{OutputConfig, PrimarySink, QueueOutputConfig};
    use crate::sink::QueuePublisher;
    use crate::status::Status;

    fn terminals() -> Terminals {
        Terminals::new(TerminalConfig::default(), DurableSinks::disabled())
    }

    fn sh_terminals(durable: DurableSinks) -> Terminals {
        let terminal = TerminalConfig {
            shell: "sh".to_string(),
            cols: 80,
            rows: 24,
            interrupt_grace_seconds: 5,
        };
        Terminals::new(terminal, durable)
    }

    async fn next_final(rx: &mut mpsc::UnboundedReceiver<StatusUpdateEvent>) -> StatusUpdateEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("no final status in time")
                .expect("status channel closed");
            if event.new_status.is_final() {
                return event;
            }
        }
    }

    /// Run `command` from a silent master and return the final event.
    async fn run_command(terminals: &Terminals, command: &str) -> StatusUpdateEvent {
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        terminals.listen("ctx", status_tx);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = terminals
            .attach("ctx", 1, ResponseMode::Silent, false, &tx)
            .unwrap();

        session.master_text(1, command);
        next_final(&mut status_rx).await
    }

    struct UnackedPublisher;

    impl QueuePublisher for UnackedPublisher {
        fn publish(&self, _topic: &str, _payload: String) -> Result<(), SinkError> {
            Ok(())
        }

        fn flush(&self) -> Result<(), SinkError> {
            Err(SinkError::Publish {
                topic: "output".to_string(),
                message: "broker unreachable".to_string(),
            })
        }
    }

    #[test]
    fn second_master_is_rejected() {
        let terminals = terminals();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let first = terminals
            .attach("ctx", 1, ResponseMode::Binary, false, &tx1)
            .unwrap();
        let second = terminals.attach("ctx", 2, ResponseMode::Text, false, &tx2);

        assert!(matches!(second, Err(AttachError::MasterActive)));
        assert!(first.has_master());
        assert_eq!(terminals.len(), 1);
    }

    #[test]
    fn master_detach_destroys_idle_session() {
        let terminals = terminals();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = terminals
            .attach("ctx", 1, ResponseMode::Binary, false, &tx)
            .unwrap();

        session.detach(1);

        assert!(terminals.is_empty());
        assert!(session.is_destroyed());
    }

    #[test]
    fn sequential_masters_get_fresh_sessions() {
        let terminals = terminals();
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = terminals
            .attach("ctx", 1, ResponseMode::Text, false, &tx)
            .unwrap();
        first.detach(1);
        let second = terminals
            .attach("ctx", 2, ResponseMode::Text, false, &tx)
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.has_master());
    }

    #[test]
    fn listener_detach_keeps_master_session() {
        let terminals = terminals();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = terminals
            .attach("ctx", 1, ResponseMode::Binary, false, &tx)
            .unwrap();
        terminals
            .attach("ctx", 2, ResponseMode::Text, true, &tx)
            .unwrap();
        assert_eq!(session.sink_count(), 1);

        session.detach(2);

        assert_eq!(session.sink_count(), 0);
        assert_eq!(terminals.len(), 1);
    }

    #[test]
    fn destroy_closes_listener_channels() {
        let terminals = terminals();
        let (master_tx, _master_rx) = mpsc::unbounded_channel();
        let (listener_tx, mut listener_rx) = mpsc::unbounded_channel();

        let session = terminals
            .attach("ctx", 1, ResponseMode::Binary, false, &master_tx)
            .unwrap();
        terminals
            .attach("ctx", 2, ResponseMode::Binary, true, &listener_tx)
            .unwrap();
        drop(listener_tx);

        session.detach(1);

        assert!(listener_rx.try_recv().is_err());
        assert!(listener_rx.is_closed());
    }

    #[test]
    fn status_listeners_are_per_context() {
        let terminals = terminals();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = terminals.listen("ctx", tx);

        let event = StatusUpdateEvent::new(1, crate::status::Status::Running);
        terminals.inner.broadcast("ctx", &event);
        terminals.inner.broadcast("other", &event);

        assert_eq!(rx.try_recv().unwrap(), event);
        assert!(rx.try_recv().is_err());
        assert_eq!(terminals.listener_count("ctx"), 1);

        terminals.unlisten("ctx", id);
        assert!(terminals.inner.listeners.is_empty());
    }

    #[tokio::test]
    async fn running_task_keeps_session_after_master_leaves() {
        let terminals = sh_terminals(DurableSinks::disabled());
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        terminals.listen("ctx", status_tx);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = terminals
            .attach("ctx", 1, ResponseMode::Silent, false, &tx)
            .unwrap();

        session.master_text(1, "sleep 0.5");
        session.detach(1);

        assert!(terminals.get("ctx").is_some());
        assert!(session.is_active());
        assert!(!session.is_destroyed());

        let event = next_final(&mut status_rx).await;
        assert_eq!(event.new_status, Status::Completed);
        assert!(terminals.is_empty());
        assert!(session.is_destroyed());
    }

    #[tokio::test]
    async fn end_marker_is_on_disk_when_completion_is_broadcast() {
        let tmp = TempDir::new().unwrap();
        let durable = DurableSinks::new(
            OutputConfig {
                log_dir: Some(tmp.path().to_path_buf()),
                ..OutputConfig::default()
            },
            None,
        )
        .unwrap();
        let terminals = sh_terminals(durable);

        let event = run_command(&terminals, "echo hi").await;

        assert_eq!(event.new_status, Status::Completed);
        let content = std::fs::read_to_string(tmp.path().join("ctx.log")).unwrap();
        assert!(content.starts_with("% echo hi\n"), "log was {content:?}");
        assert!(
            content.ends_with("% # Finished with status: COMPLETED\n"),
            "log was {content:?}"
        );
    }

    #[tokio::test]
    async fn primary_flush_failure_fails_the_task() {
        let durable = DurableSinks::new(
            OutputConfig {
                primary: PrimarySink::Queue,
                queue: Some(QueueOutputConfig {
                    topic: "output".to_string(),
                }),
                ..OutputConfig::default()
            },
            Some(Arc::new(UnackedPublisher)),
        )
        .unwrap();
        let terminals = sh_terminals(durable);

        let event = run_command(&terminals, "echo hi").await;

        assert_eq!(event.new_status, Status::Failed);
        let message = event.message.unwrap();
        assert!(
            message.starts_with("failed to flush output:"),
            "unexpected message: {message}"
        );
        assert!(event.output_checksum.is_some());
    }
}
