//! Validated run requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Request rejected before any session is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("instruction must not be empty")]
    EmptyInstruction,
}

/// What a run is asked to do.
///
/// Only constructible through [`RunRequest::new`], so an instance always
/// carries a non-empty instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRequest {
    instruction: String,
    attachments: Vec<Value>,
}

impl RunRequest {
    /// Validate and build a request. The instruction is trimmed.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyInstruction`] if the instruction is
    /// missing or blank.
    pub fn new(
        instruction: Option<&str>,
        attachments: Vec<Value>,
    ) -> Result<Self, ValidationError> {
        let instruction = instruction
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::EmptyInstruction)?;

        Ok(Self {
            instruction: instruction.to_owned(),
            attachments,
        })
    }

    /// The trimmed instruction.
    #[must_use]
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Opaque attachment references, in request order.
    #[must_use]
    pub fn attachments(&self) -> &[Value] {
        &self.attachments
    }
}

/// Untrusted request body as it arrives from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRunRequest {
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

impl From<&str> for RawRunRequest {
    fn from(instruction: &str) -> Self {
        Self {
            instruction: Some(instruction.to_owned()),
            attachments: Vec::new(),
        }
    }
}

impl TryFrom<RawRunRequest> for RunRequest {
    type Error = ValidationError;

    fn try_from(raw: RawRunRequest) -> Result<Self, Self::Error> {
        Self::new(raw.instruction.as_deref(), raw.attachments)
    }
}
