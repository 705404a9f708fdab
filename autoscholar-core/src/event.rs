//! Event system for the Autoscholar session loop.
//!
//! The orchestrator reports lifecycle changes to consumers (CLI, TUI)
//! through this channel-based system, alongside its `tracing` output.

use crate::knowledge::SessionMetrics;
use crate::ledger::OutcomeReason;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default channel buffer size.
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Events emitted by the orchestrator during a session.
#[derive(Debug, Clone)]
pub enum Event {
    /// A session has started.
    SessionStarted {
        /// Session name.
        session: String,
        /// Number of tasks planned.
        tasks: usize,
    },

    /// A task is starting.
    TaskStarted {
        /// 1-indexed position in the session.
        index: usize,
        /// Task topic.
        topic: String,
    },

    /// A task produced and stored an entry.
    TaskCompleted {
        /// Task topic.
        topic: String,
        /// The stored entry.
        entry_id: Uuid,
        /// Score in [0, 1].
        score: f64,
        /// Whether the verifier passed the entry.
        verified: bool,
    },

    /// A task failed.
    TaskFailed {
        /// Task topic.
        topic: String,
        /// Why.
        message: String,
    },

    /// A result was queued for human review.
    ReviewQueued {
        /// Feedback item id.
        item_id: Uuid,
        /// Score that fell under the threshold.
        confidence: f64,
    },

    /// A tag topic was synthesized.
    Synthesized {
        /// The tag.
        topic: String,
    },

    /// A self-modification cycle ran.
    ModificationAttempted {
        /// Whether it ended with a passing check.
        improved: bool,
        /// Why it ended that way.
        reason: OutcomeReason,
    },

    /// Warning message.
    Warning {
        /// The warning message.
        message: String,
    },

    /// The session's metrics have been persisted.
    SessionFinished {
        /// Final metrics.
        metrics: SessionMetrics,
    },
}

/// Sender for events.
pub type EventSender = mpsc::Sender<Event>;

/// Receiver for events.
pub type EventReceiver = mpsc::Receiver<Event>;

/// Create a new event channel with the default buffer size.
///
/// Returns a sender and receiver pair for event communication.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_SIZE)
}

impl Event {
    /// Create a warning event with the given message.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_creation() {
        let (tx, _rx) = channel();
        tx.try_send(Event::warning("test")).unwrap();
    }

    #[test]
    fn test_warning_constructor() {
        let warning = Event::warning("be careful");
        assert!(matches!(warning, Event::Warning { message } if message == "be careful"));
    }
}
