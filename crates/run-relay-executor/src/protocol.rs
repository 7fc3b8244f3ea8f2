//! JSON-lines protocol spoken by agent processes on stdout/stdin.
//!
//! Each stdout line is one message:
//! - `{"type":"loading","loading":true}` - loading-state change
//! - `{"type":"confirm","request_id":"..","prompt":".."}` - blocks until answered
//! - any other JSON object - a result item, passed through whole
//! - anything else - a text item `{"type":"text","text":line}`
//!
//! Confirmations are answered on stdin with one [`ConfirmResponse`] line.

use run_relay_core::ConfirmationRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentLine {
    Item(Value),
    Loading(bool),
    Confirm(ConfirmationRequest),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Control {
    Loading { loading: bool },
    Confirm(ConfirmationRequest),
}

/// Decode one non-empty stdout line.
#[must_use]
pub fn parse_line(line: &str) -> AgentLine {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => value,
        _ => return AgentLine::Item(json!({ "type": "text", "text": line })),
    };

    let is_control = matches!(
        value.get("type").and_then(Value::as_str),
        Some("loading" | "confirm")
    );
    if !is_control {
        return AgentLine::Item(value);
    }

    match serde_json::from_value::<Control>(value.clone()) {
        Ok(Control::Loading { loading }) => AgentLine::Loading(loading),
        Ok(Control::Confirm(request)) => AgentLine::Confirm(request),
        Err(e) => {
            tracing::warn!("Malformed control line, passing through as item: {e}");
            AgentLine::Item(value)
        }
    }
}

/// Answer to a confirmation, written to the agent's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "confirm_response")]
pub struct ConfirmResponse {
    pub request_id: String,
    pub approved: bool,
}
