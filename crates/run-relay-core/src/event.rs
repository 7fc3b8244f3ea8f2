//! Typed run events and the frames pushed to observers.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Kind of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A result item produced by the executor.
    Item,
    /// A loading-state transition.
    Status,
    /// The run failed. Terminal.
    Error,
    /// The run finished successfully. Terminal.
    Complete,
}

impl EventKind {
    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Status => "status",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    /// Whether an event of this kind ends the run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Complete)
    }
}

/// One immutable entry of a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: EventKind,
    pub payload: Value,
}

impl RunEvent {
    /// Result item event.
    #[must_use]
    pub const fn item(payload: Value) -> Self {
        Self {
            kind: EventKind::Item,
            payload,
        }
    }

    /// Loading-state event.
    #[must_use]
    pub fn status(loading: bool) -> Self {
        Self {
            kind: EventKind::Status,
            payload: json!({ "loading": loading }),
        }
    }

    /// Failure event carrying the executor's message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            payload: json!({ "message": message.into() }),
        }
    }

    /// Successful completion marker.
    #[must_use]
    pub fn complete() -> Self {
        Self {
            kind: EventKind::Complete,
            payload: json!({}),
        }
    }

    /// Approximate size in bytes, used for logging.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        self.payload.to_string().len() + OVERHEAD
    }
}

/// A unit pushed down an observer connection.
///
/// Keep-alives never enter the event log and are never replayed.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(RunEvent),
    KeepAlive,
}

impl Frame {
    /// The carried event, if this is not a keep-alive.
    #[must_use]
    pub const fn as_event(&self) -> Option<&RunEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::KeepAlive => None,
        }
    }
}
