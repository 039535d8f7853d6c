//! Process status and the events broadcast when it changes.

use serde::{Deserialize, Serialize};

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    New,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl Status {
    /// Whether no further transition can leave this status.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Interrupted
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::New => "NEW",
            Status::Running => "RUNNING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Interrupted => "INTERRUPTED",
        };
        f.write_str(s)
    }
}

// ============================================================================
// ResponseMode
// ============================================================================

/// How a terminal connection receives process output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Raw bytes, one binary message per chunk.
    Binary,
    /// One text message per completed line.
    Text,
    /// No output at all.
    Silent,
}

// ============================================================================
// StatusUpdateEvent
// ============================================================================

/// A single status transition of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateEvent {
    pub task_id: u64,
    pub new_status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusUpdateEvent {
    pub fn new(task_id: u64, new_status: Status) -> Self {
        Self {
            task_id,
            new_status,
            output_checksum: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.output_checksum = checksum;
        self
    }
}

/// Wire envelope sent on the status-subscription socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub action: String,
    pub event: StatusUpdateEvent,
}

impl From<StatusUpdateEvent> for StatusEnvelope {
    fn from(event: StatusUpdateEvent) -> Self {
        Self {
            action: "status-update".to_string(),
            event,
        }
    }
}
