//! Wire shapes for the HTTP surface.

use run_relay_core::{RunEvent, RunState, SessionId};
use serde::{Deserialize, Serialize};

/// Response to a multi-session start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub session_id: SessionId,
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub session_id: SessionId,
    pub state: RunState,
    pub events: Vec<RunEvent>,
    pub observers: usize,
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Health check response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
}
