//! Sinks that feed a live WebSocket connection.
//!
//! The connection task owns the socket; sinks only push [`Outbound`] frames
//! into its channel, so writes never block on the network.

use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use super::SinkError;
use crate::framer::LineFramer;

/// A frame queued for a WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
    /// Close the connection with the given reason.
    Close(String),
}

// ============================================================================
// BinarySink
// ============================================================================

/// Passes output bytes through unmodified.
pub struct BinarySink {
    tx: UnboundedSender<Outbound>,
}

impl BinarySink {
    pub fn new(tx: UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub(super) fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        self.tx
            .send(Outbound::Binary(Bytes::copy_from_slice(data)))
            .map_err(|_| SinkError::Closed)
    }

    pub(super) fn write_line(&self, line: &str) -> Result<(), SinkError> {
        self.write(format!("{line}\r\n").as_bytes())
    }
}

// ============================================================================
// TextSink
// ============================================================================

/// Sends one text frame per completed line.
pub struct TextSink {
    tx: UnboundedSender<Outbound>,
    framer: Mutex<LineFramer>,
}

impl TextSink {
    pub fn new(tx: UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            framer: Mutex::new(LineFramer::new()),
        }
    }

    pub(super) fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        let lines = self.framer.lock().expect("framer mutex poisoned").push(data);
        self.send_all(lines)
    }

    pub(super) fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let mut lines: Vec<String> = self
            .framer
            .lock()
            .expect("framer mutex poisoned")
            .take_pending()
            .into_iter()
            .collect();
        lines.push(line.to_string());
        self.send_all(lines)
    }

    pub(super) fn flush(&self) -> Result<(), SinkError> {
        let rest = self
            .framer
            .lock()
            .expect("framer mutex poisoned")
            .take_pending();
        self.send_all(rest)
    }

    pub(super) fn close(&self) -> Result<(), SinkError> {
        self.flush()
    }

    fn send_all(&self, lines: impl IntoIterator<Item = String>) -> Result<(), SinkError> {
        for line in lines {
            self.tx
                .send(Outbound::Text(line))
                .map_err(|_| SinkError::Closed)?;
        }
        Ok(())
    }
}
