//! Approval handling for executor confirmation requests.

use async_trait::async_trait;
use run_relay_core::ConfirmationRequest;
use thiserror::Error;

/// Decision on a confirmation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalResult {
    /// Let the executor proceed.
    Allow,
    /// Refuse the request.
    Deny { reason: String },
}

impl ApprovalResult {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// The handler could not reach a decision. Treated as a denial.
#[derive(Debug, Error)]
#[error("Approval unavailable: {0}")]
pub struct ApprovalError(pub String);

/// Trait for answering executor-initiated confirmation requests.
///
/// Runs relayed to remote observers are unattended, so the relay wires
/// [`AutoApproveHandler`]. Other surfaces can plug in their own UX.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide on one confirmation request.
    async fn request_approval(
        &self,
        request: &ConfirmationRequest,
    ) -> Result<ApprovalResult, ApprovalError>;
}

/// Approval handler that approves everything.
#[derive(Debug, Default, Clone)]
pub struct AutoApproveHandler;

#[async_trait]
impl ApprovalHandler for AutoApproveHandler {
    async fn request_approval(
        &self,
        request: &ConfirmationRequest,
    ) -> Result<ApprovalResult, ApprovalError> {
        tracing::debug!(request_id = %request.request_id, "auto-approving confirmation");
        Ok(ApprovalResult::Allow)
    }
}
