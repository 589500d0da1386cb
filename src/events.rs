//! Lifecycle event model for session observers.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::mutant::Outcome;
use crate::report::SessionSummary;

/// Event emitted during session orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session entered its verification and testing phases.
    SessionStarted {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Number of mutants in scope.
        mutants: usize,
        /// Number of known tests.
        tests: usize,
    },
    /// Mutant execution dispatched.
    MutantStarted {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutant id.
        mutant_id: String,
    },
    /// Mutant reached a terminal status.
    MutantFinished {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutant id.
        mutant_id: String,
        /// Terminal outcome.
        outcome: Outcome,
        /// Reported from the cache without execution.
        #[serde(default)]
        cached: bool,
    },
    /// Session reached a terminal phase.
    SessionFinished {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Final counts.
        summary: SessionSummary,
    },
    /// Recoverable or fatal condition surfaced to observers.
    Error {
        /// Session id.
        session_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Stable condition kind, e.g. `configuration` or `backend`.
        kind: String,
        /// Human-readable detail.
        message: String,
    },
}

/// Observer for session events. The engine never prints; hosts render.
pub trait EventSink {
    /// Receive one event.
    fn emit(&self, event: &SessionEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &SessionEvent) {}
}

/// Sink that records events in memory, for tests and embedding hosts.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SessionEvent>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event received so far.
    pub fn events(&self) -> Vec<SessionEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &SessionEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event.clone());
        }
    }
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    (duration.as_secs() as i64)
        .saturating_mul(1000)
        .saturating_add(duration.subsec_millis() as i64)
}
