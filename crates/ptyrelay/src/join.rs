//! Two-phase completion join.
//!
//! A task is over only when its stdout has been fully drained *and* its
//! process has reported a final status. The two signals arrive from
//! different threads in either order; [`CompletionJoin`] hands the held
//! final event to exactly one caller once both have been seen.

use std::sync::Mutex;

use crate::status::{Status, StatusUpdateEvent};

/// Outcome of draining a task's stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    /// SHA-256 of everything the process wrote.
    pub checksum: Option<String>,
    /// Why the primary sink could not be flushed.
    pub flush_failure: Option<String>,
}

#[derive(Debug, Default)]
struct Slots {
    drained: Option<Drained>,
    completion: Option<StatusUpdateEvent>,
}

impl Slots {
    /// Take the event if both halves are present, clearing both slots.
    fn take_if_ready(&mut self) -> Option<StatusUpdateEvent> {
        if self.drained.is_none() || self.completion.is_none() {
            return None;
        }
        let drained = self.drained.take()?;
        let mut event = self.completion.take()?;
        if event.output_checksum.is_none() {
            event.output_checksum = drained.checksum;
        }
        Some(match drained.flush_failure {
            Some(message) => StatusUpdateEvent::new(event.task_id, Status::Failed)
                .with_checksum(event.output_checksum)
                .with_message(message),
            None => event,
        })
    }
}

/// Merges "stdout drained" and "final status" into one completion event.
///
/// Callers act on the returned event outside of the join; nothing here
/// performs I/O under the lock.
#[derive(Debug, Default)]
pub struct CompletionJoin {
    slots: Mutex<Slots>,
}

impl CompletionJoin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that stdout reached EOF and the primary sink was flushed.
    /// A flush failure turns the eventual completion into FAILED.
    pub fn stdout_drained(&self, drained: Drained) -> Option<StatusUpdateEvent> {
        let mut slots = self.slots.lock().expect("join mutex poisoned");
        if slots.drained.is_none() {
            slots.drained = Some(drained);
        }
        slots.take_if_ready()
    }

    /// Record the final status event of the task.
    pub fn final_status(&self, event: StatusUpdateEvent) -> Option<StatusUpdateEvent> {
        let mut slots = self.slots.lock().expect("join mutex poisoned");
        if slots.completion.is_none() {
            slots.completion = Some(event);
        }
        slots.take_if_ready()
    }

    /// Forget both halves. Called when a new task starts.
    pub fn reset(&self) {
        let mut slots = self.slots.lock().expect("join mutex poisoned");
        *slots = Slots::default();
    }
}
