//! Publish output lines to a message-queue topic.
//!
//! The broker itself sits behind [`QueuePublisher`]; [`ChannelPublisher`]
//! hands records to an in-process consumer.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use super::SinkError;
use crate::framer::LineFramer;

/// Turns `(source, line)` into the payload published for that line.
pub type LineFormatter = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Broker-facing side of a queue sink.
pub trait QueuePublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: String) -> Result<(), SinkError>;

    /// Block until previously published records are acknowledged.
    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

// ============================================================================
// ChannelPublisher
// ============================================================================

/// A record handed to an in-process consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub topic: String,
    pub payload: String,
}

/// Publishes into an unbounded channel.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<QueueRecord>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl QueuePublisher for ChannelPublisher {
    fn publish(&self, topic: &str, payload: String) -> Result<(), SinkError> {
        self.tx
            .send(QueueRecord {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| SinkError::Publish {
                topic: topic.to_string(),
                message: "consumer disconnected".to_string(),
            })
    }
}

// ============================================================================
// QueueSink
// ============================================================================

#[derive(Serialize)]
struct LineRecord<'a> {
    source: &'a str,
    timestamp: String,
    message: &'a str,
}

/// Default payload: a JSON object with source, timestamp and message.
pub fn json_formatter() -> LineFormatter {
    Arc::new(|source, line| {
        let record = LineRecord {
            source,
            timestamp: Utc::now().to_rfc3339(),
            message: line,
        };
        serde_json::to_string(&record).unwrap_or_else(|_| line.to_string())
    })
}

/// Line-framed queue appender.
pub struct QueueSink {
    source: String,
    topic: String,
    primary: bool,
    formatter: LineFormatter,
    publisher: Arc<dyn QueuePublisher>,
    framer: Mutex<LineFramer>,
}

impl QueueSink {
    pub fn new(
        source: impl Into<String>,
        topic: impl Into<String>,
        publisher: Arc<dyn QueuePublisher>,
        primary: bool,
    ) -> Self {
        Self {
            source: source.into(),
            topic: topic.into(),
            primary,
            formatter: json_formatter(),
            publisher,
            framer: Mutex::new(LineFramer::new()),
        }
    }

    pub fn with_formatter(mut self, formatter: LineFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub(super) fn is_primary(&self) -> bool {
        self.primary
    }

    pub(super) fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        let lines = self.framer.lock().expect("framer mutex poisoned").push(data);
        self.publish_all(lines)
    }

    pub(super) fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let tail = self
            .framer
            .lock()
            .expect("framer mutex poisoned")
            .take_pending();
        self.publish_all(tail.into_iter().chain(std::iter::once(line.to_string())))
    }

    pub(super) fn flush(&self) -> Result<(), SinkError> {
        let tail = self
            .framer
            .lock()
            .expect("framer mutex poisoned")
            .take_pending();
        self.publish_all(tail)?;
        self.publisher.flush()
    }

    pub(super) fn close(&self) -> Result<(), SinkError> {
        self.flush()
    }

    fn publish_all(&self, lines: impl IntoIterator<Item = String>) -> Result<(), SinkError> {
        for line in lines {
            let payload = (self.formatter)(&self.source, &line);
            self.publisher.publish(&self.topic, payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_one_record_per_line() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let sink = QueueSink::new("build-1", "logs", Arc::new(publisher), false)
            .with_formatter(Arc::new(|source, line| format!("{source}|{line}")));

        sink.write(b"a\nb").unwrap();
        sink.flush().unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.topic, "logs");
        assert_eq!(first.payload, "build-1|a");
        assert_eq!(rx.try_recv().unwrap().payload, "build-1|b");
    }

    #[test]
    fn default_payload_is_json() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let sink = QueueSink::new("ctx", "logs", Arc::new(publisher), true);

        sink.write_line("% echo hi").unwrap();

        let record = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(json["source"], "ctx");
        assert_eq!(json["message"], "% echo hi");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn disconnected_consumer_fails_publish() {
        let (publisher, rx) = ChannelPublisher::new();
        drop(rx);
        let sink = QueueSink::new("ctx", "logs", Arc::new(publisher), false);

        assert!(matches!(
            sink.write(b"line\n"),
            Err(SinkError::Publish { .. })
        ));
    }
}
