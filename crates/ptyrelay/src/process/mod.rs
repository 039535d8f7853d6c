//! Pseudo-terminal backed processes.
//!
//! A [`PtyProcess`] runs one command line under `<shell> -c` on a fresh PTY.
//! Output and status changes are pushed to a [`ProcessListener`] from
//! blocking-pool threads; the listener must not block for long.

mod pty;

use std::time::Duration;

use thiserror::Error;

use crate::status::{Status, StatusUpdateEvent};

pub use pty::PtyProcess;

// ============================================================================
// ProcessListener
// ============================================================================

/// Receives everything a process produces.
pub trait ProcessListener: Send + Sync + 'static {
    /// A chunk of raw PTY output.
    fn on_stdout(&self, data: &[u8]);

    /// The PTY reached EOF. `checksum` is the hex SHA-256 of all output.
    fn on_stdout_closed(&self, checksum: String);

    /// A status transition. Every process goes NEW → RUNNING → final.
    fn on_status(&self, old: Status, event: StatusUpdateEvent);
}

// ============================================================================
// ProcessSpec
// ============================================================================

/// What to run and how.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub task_id: u64,
    pub command_line: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Kill the process this long after an unanswered interrupt.
    pub interrupt_grace: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(task_id: u64, command_line: impl Into<String>) -> Self {
        Self {
            task_id,
            command_line: command_line.into(),
            shell: "bash".to_string(),
            cols: 200,
            rows: 50,
            interrupt_grace: None,
        }
    }

    pub fn with_terminal(mut self, terminal: &crate::config::TerminalConfig) -> Self {
        self.shell = terminal.shell.clone();
        self.cols = terminal.cols;
        self.rows = terminal.rows;
        self.interrupt_grace = terminal.interrupt_grace();
        self
    }
}

// ============================================================================
// ProcessError
// ============================================================================

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("process is not running")]
    NotRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
