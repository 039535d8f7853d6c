//! Per-session durable sinks built from the `output` config section.

use std::path::PathBuf;
use std::sync::Arc;

use super::{FileSink, JoinSink, LogSink, QueuePublisher, QueueSink, Sink, SinkError};
use tracing::warn;

use crate::config::{ConfigError, OutputConfig, PrimarySink};

/// Builds the file/queue/log sinks every session copies its output to.
#[derive(Clone)]
pub struct DurableSinks {
    config: OutputConfig,
    publisher: Option<Arc<dyn QueuePublisher>>,
}

impl DurableSinks {
    /// Check `config` against the available publisher. A queue section or a
    /// queue primary that cannot be honoured is an error, never ignored.
    pub fn new(
        config: OutputConfig,
        publisher: Option<Arc<dyn QueuePublisher>>,
    ) -> Result<Self, ConfigError> {
        if config.queue.is_some() && publisher.is_none() {
            return Err(ConfigError::InvalidOutput(
                "`queue` is configured but no queue publisher is available",
            ));
        }
        if config.primary == PrimarySink::Queue && config.queue.is_none() {
            return Err(ConfigError::InvalidOutput(
                "primary sink is `queue` but no `queue` section is configured",
            ));
        }
        if config.primary == PrimarySink::File && config.log_dir.is_none() {
            warn!("Primary sink is `file` but no `log_dir` is set, output is not durable");
        }
        Ok(Self { config, publisher })
    }

    /// No durable output at all.
    pub fn disabled() -> Self {
        Self {
            config: OutputConfig {
                primary: PrimarySink::None,
                ..OutputConfig::default()
            },
            publisher: None,
        }
    }

    /// Path of the log file for `key`, if a log directory is configured.
    pub fn file_path(&self, key: &str) -> Option<PathBuf> {
        let dir = self.config.log_dir.as_ref()?;
        Some(dir.join(format!("{}.log", sanitize(key))))
    }

    /// Build the composite sink for `key` (a terminal context or invoke
    /// session id). Returns `None` when nothing is configured.
    pub fn build(&self, key: &str) -> Result<Option<Sink>, SinkError> {
        let mut members = Vec::new();

        if let Some(path) = self.file_path(key) {
            let primary = self.config.primary == PrimarySink::File;
            members.push(Arc::new(Sink::File(FileSink::open(path, primary)?)));
        }

        if let (Some(queue), Some(publisher)) = (&self.config.queue, &self.publisher) {
            let primary = self.config.primary == PrimarySink::Queue;
            members.push(Arc::new(Sink::Queue(QueueSink::new(
                key,
                queue.topic.clone(),
                Arc::clone(publisher),
                primary,
            ))));
        }

        if self.config.log.enabled {
            members.push(Arc::new(Sink::Log(LogSink::new(key))));
        }

        if members.is_empty() {
            return Ok(None);
        }
        Ok(Some(Sink::Join(JoinSink::new(members)?)))
    }
}

fn sanitize(key: &str) -> String {
    if key.is_empty() {
        return "default".to_string();
    }
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogOutputConfig, QueueOutputConfig};
    use crate::sink::ChannelPublisher;
    use tempfile::TempDir;

    #[test]
    fn sanitizes_context_into_file_name() {
        assert_eq!(sanitize(""), "default");
        assert_eq!(sanitize("builds/42"), "builds_42");
        assert_eq!(sanitize("a-b_c.d"), "a-b_c.d");
    }

    #[test]
    fn disabled_builds_nothing() {
        assert!(DurableSinks::disabled().build("ctx").unwrap().is_none());
    }

    #[test]
    fn file_sink_is_primary_by_default() {
        let tmp = TempDir::new().unwrap();
        let sinks = DurableSinks::new(
            OutputConfig {
                log_dir: Some(tmp.path().to_path_buf()),
                ..OutputConfig::default()
            },
            None,
        )
        .unwrap();

        let sink = sinks.build("builds/7").unwrap().unwrap();
        assert!(matches!(sink.primary(), Some(Sink::File(_))));

        sink.write_line("% make").unwrap();
        sink.flush().unwrap();
        let content = std::fs::read_to_string(tmp.path().join("builds_7.log")).unwrap();
        assert_eq!(content, "% make\n");
    }

    #[test]
    fn queue_primary_with_publisher() {
        let tmp = TempDir::new().unwrap();
        let (publisher, mut rx) = ChannelPublisher::new();
        let sinks = DurableSinks::new(
            OutputConfig {
                log_dir: Some(tmp.path().to_path_buf()),
                primary: PrimarySink::Queue,
                log: LogOutputConfig { enabled: true },
                queue: Some(QueueOutputConfig {
                    topic: "logs".to_string(),
                }),
            },
            Some(Arc::new(publisher)),
        )
        .unwrap();

        let sink = sinks.build("ctx").unwrap().unwrap();
        assert!(matches!(sink.primary(), Some(Sink::Queue(_))));

        sink.write(b"line\n").unwrap();
        assert_eq!(rx.try_recv().unwrap().topic, "logs");
    }

    #[test]
    fn queue_without_publisher_is_rejected() {
        let result = DurableSinks::new(
            OutputConfig {
                primary: PrimarySink::Queue,
                queue: Some(QueueOutputConfig {
                    topic: "logs".to_string(),
                }),
                ..OutputConfig::default()
            },
            None,
        );
        assert!(matches!(result, Err(ConfigError::InvalidOutput(_))));
    }

    #[test]
    fn queue_primary_needs_queue_section() {
        let (publisher, _rx) = ChannelPublisher::new();
        let result = DurableSinks::new(
            OutputConfig {
                primary: PrimarySink::Queue,
                ..OutputConfig::default()
            },
            Some(Arc::new(publisher)),
        );
        assert!(matches!(result, Err(ConfigError::InvalidOutput(_))));
    }
}
