//! Output sinks.
//!
//! Every consumer of process output (a WebSocket listener, a log file, a
//! message queue, the structured log) is a [`Sink`]. Sinks share one small
//! capability surface: `write`, `write_line`, `flush`, `close` and
//! `is_primary`. At most one sink in a set is primary; its flush is awaited
//! before a task's output is considered durable.
//!
//! ```text
//!  process stdout ──► Session ──► SinkSet ──┬─► Binary  (ws, raw bytes)
//!                                           ├─► Text    (ws, one msg per line)
//!                                           └─► Join ───┬─► File   (primary)
//!                                                       ├─► Queue
//!                                                       └─► Log
//! ```

mod durable;
mod file;
mod log;
mod queue;
mod socket;

use std::sync::Arc;

use thiserror::Error;

pub use durable::DurableSinks;
pub use file::FileSink;
pub use log::{LogSink, OUTPUT_TARGET};
pub use queue::{ChannelPublisher, LineFormatter, QueuePublisher, QueueRecord, QueueSink};
pub use socket::{BinarySink, Outbound, TextSink};

// ============================================================================
// SinkError
// ============================================================================

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,

    #[error("{0} does not support flush")]
    Unsupported(&'static str),

    #[error("only one primary sink is allowed per set")]
    DuplicatePrimary,

    #[error("publish to topic '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Sink
// ============================================================================

/// A destination for process output.
pub enum Sink {
    Binary(BinarySink),
    Text(TextSink),
    File(FileSink),
    Queue(QueueSink),
    Log(LogSink),
    Join(JoinSink),
}

impl Sink {
    /// Write a chunk of raw output.
    pub fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        match self {
            Sink::Binary(s) => s.write(data),
            Sink::Text(s) => s.write(data),
            Sink::File(s) => s.write(data),
            Sink::Queue(s) => s.write(data),
            Sink::Log(s) => s.write(data),
            Sink::Join(s) => s.write(data),
        }
    }

    /// Write a whole line that must not merge with an unterminated output tail
    /// (input echo, completion markers).
    pub fn write_line(&self, line: &str) -> Result<(), SinkError> {
        match self {
            Sink::Binary(s) => s.write_line(line),
            Sink::Text(s) => s.write_line(line),
            Sink::File(s) => s.write_line(line),
            Sink::Queue(s) => s.write_line(line),
            Sink::Log(s) => s.write_line(line),
            Sink::Join(s) => s.write_line(line),
        }
    }

    /// Push buffered output to the destination.
    pub fn flush(&self) -> Result<(), SinkError> {
        match self {
            Sink::Binary(_) => Ok(()),
            Sink::Text(s) => s.flush(),
            Sink::File(s) => s.flush(),
            Sink::Queue(s) => s.flush(),
            Sink::Log(_) => Err(SinkError::Unsupported("structured log sink")),
            Sink::Join(s) => s.flush(),
        }
    }

    /// Emit any remainder and release the destination.
    pub fn close(&self) -> Result<(), SinkError> {
        match self {
            Sink::Binary(_) => Ok(()),
            Sink::Text(s) => s.close(),
            Sink::File(s) => s.close(),
            Sink::Queue(s) => s.close(),
            Sink::Log(s) => s.close(),
            Sink::Join(s) => s.close(),
        }
    }

    pub fn is_primary(&self) -> bool {
        match self {
            Sink::File(s) => s.is_primary(),
            Sink::Queue(s) => s.is_primary(),
            Sink::Binary(_) | Sink::Text(_) | Sink::Log(_) | Sink::Join(_) => false,
        }
    }

    /// The primary sink at or below this one.
    pub fn primary(&self) -> Option<&Sink> {
        match self {
            Sink::Join(s) => s.primary(),
            other if other.is_primary() => Some(other),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Sink::Binary(_) => "binary",
            Sink::Text(_) => "text",
            Sink::File(_) => "file",
            Sink::Queue(_) => "queue",
            Sink::Log(_) => "log",
            Sink::Join(_) => "join",
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("kind", &self.kind())
            .field("primary", &self.is_primary())
            .finish()
    }
}

// ============================================================================
// JoinSink
// ============================================================================

/// Fans every operation out to its members in registration order.
pub struct JoinSink {
    members: Vec<Arc<Sink>>,
}

impl JoinSink {
    /// Build a composite sink. Fails if more than one member is primary.
    pub fn new(members: Vec<Arc<Sink>>) -> Result<Self, SinkError> {
        let primaries = members.iter().filter(|m| m.primary().is_some()).count();
        if primaries > 1 {
            return Err(SinkError::DuplicatePrimary);
        }
        Ok(Self { members })
    }

    pub fn primary(&self) -> Option<&Sink> {
        self.members.iter().find_map(|m| m.primary())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        self.each(|m| m.write(data))
    }

    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        self.each(|m| m.write_line(line))
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.each(|m| m.flush())
    }

    fn close(&self) -> Result<(), SinkError> {
        self.each(|m| m.close())
    }

    /// Run `op` on every member and return the first failure.
    fn each(&self, op: impl Fn(&Sink) -> Result<(), SinkError>) -> Result<(), SinkError> {
        let mut first_err = None;
        for member in &self.members {
            if let Err(e) = op(member)
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ============================================================================
// SinkSet
// ============================================================================

/// Registration-ordered set of sinks keyed by the id of their owner.
#[derive(Default)]
pub struct SinkSet {
    entries: Vec<(u64, Arc<Sink>)>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. Rejects a second primary.
    pub fn add(&mut self, id: u64, sink: Arc<Sink>) -> Result<(), SinkError> {
        if sink.primary().is_some() && self.primary().is_some() {
            return Err(SinkError::DuplicatePrimary);
        }
        self.entries.push((id, sink));
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<Arc<Sink>> {
        let pos = self.entries.iter().position(|(i, _)| *i == id)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn primary(&self) -> Option<&Sink> {
        self.entries.iter().find_map(|(_, s)| s.primary())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Sink>> {
        self.entries.iter().map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every sink.
    pub fn drain(&mut self) -> Vec<Arc<Sink>> {
        self.entries.drain(..).map(|(_, s)| s).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
