//! Forward output lines to the structured log.

use std::sync::Mutex;

use tracing::info;

use super::SinkError;
use crate::framer::LineFramer;

/// Tracing target for forwarded process output.
pub const OUTPUT_TARGET: &str = "ptyrelay::output";

/// Emits every completed line as a `tracing` event. Cannot be flushed, so it
/// is never primary.
pub struct LogSink {
    source: String,
    framer: Mutex<LineFramer>,
}

impl LogSink {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            framer: Mutex::new(LineFramer::new()),
        }
    }

    pub(super) fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        let lines = self.framer.lock().expect("framer mutex poisoned").push(data);
        for line in lines {
            self.emit(&line);
        }
        Ok(())
    }

    pub(super) fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let tail = self
            .framer
            .lock()
            .expect("framer mutex poisoned")
            .take_pending();
        if let Some(tail) = tail {
            self.emit(&tail);
        }
        self.emit(line);
        Ok(())
    }

    pub(super) fn close(&self) -> Result<(), SinkError> {
        let tail = self
            .framer
            .lock()
            .expect("framer mutex poisoned")
            .take_pending();
        if let Some(tail) = tail {
            self.emit(&tail);
        }
        Ok(())
    }

    fn emit(&self, line: &str) {
        info!(target: OUTPUT_TARGET, source = %self.source, "{line}");
    }
}
