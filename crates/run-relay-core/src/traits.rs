//! Core traits and types at the executor seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::RunRequest;

/// Session identifier.
pub type SessionId = Uuid;

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Admitted but the executor has not been invoked yet.
    Pending,
    /// The executor is running.
    Running,
    /// The executor resolved normally.
    Succeeded,
    /// The executor rejected.
    Failed,
}

impl RunState {
    /// Whether the state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A confirmation the executor wants answered before it proceeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    /// Executor-chosen identifier for the request.
    pub request_id: String,
    /// Human-readable description of what is being confirmed.
    pub prompt: String,
    /// Extra executor-specific detail.
    #[serde(default)]
    pub detail: Value,
}

/// Notification from a running executor.
#[derive(Debug)]
pub enum ExecutorNotice {
    /// A result item was produced.
    Item(Value),
    /// The loading state changed.
    Loading(bool),
    /// The executor is blocked on a confirmation. Reply `true` to approve.
    Confirm {
        request: ConfirmationRequest,
        reply: oneshot::Sender<bool>,
    },
}

/// Sending half handed to an executor for its notifications.
#[derive(Debug, Clone)]
pub struct NoticeSender {
    tx: mpsc::UnboundedSender<ExecutorNotice>,
}

impl NoticeSender {
    /// Create a sender/receiver pair.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutorNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a produced item.
    pub fn item(&self, item: Value) {
        self.send(ExecutorNotice::Item(item));
    }

    /// Report a loading-state change.
    pub fn loading(&self, loading: bool) {
        self.send(ExecutorNotice::Loading(loading));
    }

    /// Ask for a confirmation and wait for the answer.
    ///
    /// Resolves to `false` when nobody is listening anymore.
    pub async fn confirm(&self, request: ConfirmationRequest) -> bool {
        let (reply, answer) = oneshot::channel();
        self.send(ExecutorNotice::Confirm { request, reply });
        answer.await.unwrap_or(false)
    }

    fn send(&self, notice: ExecutorNotice) {
        // The orchestrator drops its receiver once the run is terminal.
        if self.tx.send(notice).is_err() {
            tracing::debug!("executor notice dropped after run resolved");
        }
    }
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),
    #[error("Spawn failed: {0}")]
    Spawn(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command build error: {0}")]
    CommandBuild(String),
}

/// Trait for the long-running operation behind a run.
///
/// Implementations report progress through `notices` and resolve once.
/// Dropping the returned future must release every resource the run holds.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Execute one run.
    async fn execute(
        &self,
        request: RunRequest,
        notices: NoticeSender,
    ) -> Result<(), ExecutorError>;
}
