//! Run orchestrator: drives executors and turns their notices into events.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use futures::FutureExt;
use run_relay_core::{
    ConfirmationRequest, ExecutorNotice, NoticeSender, RawRunRequest, RunEvent, RunExecutor,
    RunRequest, Session, SessionId, ValidationError,
};
use run_relay_executor::{ApprovalHandler, ApprovalResult};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};

use crate::{
    admission::{AdmissionController, AdmissionPermit},
    registry::{RegistryClosed, SessionRegistry},
};

/// Start error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Another run is already in flight")]
    AdmissionRejected,
    #[error("Run was cancelled before it resolved")]
    Cancelled,
    #[error("Relay is shutting down")]
    ShuttingDown,
}

impl From<RegistryClosed> for StartError {
    fn from(_: RegistryClosed) -> Self {
        Self::ShuttingDown
    }
}

/// Everything a single-flight run produced, returned when it resolves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedRun {
    pub items: Vec<Value>,
    pub loading_transitions: Vec<bool>,
    /// `id` of the last item that carried a string id.
    pub last_id: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BufferedRun {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Where executor notices end up.
trait RunSink: Send {
    fn on_item(&mut self, item: Value);
    fn on_loading(&mut self, loading: bool);
}

struct SessionSink(Arc<Session>);

impl RunSink for SessionSink {
    fn on_item(&mut self, item: Value) {
        self.0.emit(RunEvent::item(item));
    }

    fn on_loading(&mut self, loading: bool) {
        self.0.emit(RunEvent::status(loading));
    }
}

impl RunSink for BufferedRun {
    fn on_item(&mut self, item: Value) {
        if let Some(id) = item.get("id").and_then(Value::as_str) {
            self.last_id = Some(id.to_owned());
        }
        self.items.push(item);
    }

    fn on_loading(&mut self, loading: bool) {
        self.loading_transitions.push(loading);
    }
}

/// Starts runs, tracks their tasks, and records their outcome.
pub struct RunOrchestrator {
    registry: SessionRegistry,
    executor: Arc<dyn RunExecutor>,
    approvals: Arc<dyn ApprovalHandler>,
    admission: AdmissionController,
    /// `None` once shut down.
    runs: Mutex<Option<JoinSet<()>>>,
}

impl RunOrchestrator {
    #[must_use]
    pub fn new(
        registry: SessionRegistry,
        executor: Arc<dyn RunExecutor>,
        approvals: Arc<dyn ApprovalHandler>,
        admission: AdmissionController,
    ) -> Self {
        Self {
            registry,
            executor,
            approvals,
            admission,
            runs: Mutex::new(Some(JoinSet::new())),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    fn runs(&self) -> MutexGuard<'_, Option<JoinSet<()>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, raw: RawRunRequest) -> Result<(RunRequest, AdmissionPermit), StartError> {
        let request = RunRequest::try_from(raw)?;
        if self.registry.is_closed() {
            return Err(StartError::ShuttingDown);
        }
        let Some(permit) = self.admission.try_admit() else {
            tracing::warn!(
                policy = %self.admission.policy(),
                "run rejected, another run is in flight"
            );
            return Err(StartError::AdmissionRejected);
        };
        Ok((request, permit))
    }

    /// Spawn a tracked task, reaping finished ones first.
    fn track<F>(&self, task: F) -> Result<(), StartError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.runs();
        let Some(runs) = guard.as_mut() else {
            return Err(StartError::ShuttingDown);
        };
        while let Some(finished) = runs.try_join_next() {
            if let Err(e) = finished {
                tracing::error!("Run task ended abnormally: {e}");
            }
        }
        runs.spawn(task);
        Ok(())
    }

    /// Admit a run, create its session, and start the executor in the
    /// background. Returns as soon as the session exists.
    ///
    /// # Errors
    /// Returns error if the request is invalid, admission is refused, or the
    /// orchestrator is shutting down. No session is created in any case.
    pub fn start(&self, raw: RawRunRequest) -> Result<SessionId, StartError> {
        let (request, permit) = self.admit(raw)?;
        let session = self.registry.create_session()?;
        let id = session.id();

        let registry = self.registry.clone();
        let executor = Arc::clone(&self.executor);
        let approvals = Arc::clone(&self.approvals);
        self.track(async move {
            let _permit = permit;
            if !session.mark_running() {
                return;
            }
            tracing::info!(session_id = %id, "run started");

            let mut sink = SessionSink(Arc::clone(&session));
            let outcome = pump(executor.as_ref(), approvals.as_ref(), request, &mut sink).await;
            match &outcome {
                Ok(()) => tracing::info!(session_id = %id, "run succeeded"),
                Err(message) => tracing::warn!(session_id = %id, error = %message, "run failed"),
            }

            session.finish(outcome);
            registry.reclaim(&session);
        })?;

        Ok(id)
    }

    /// Admit a run and wait for its buffered result.
    ///
    /// The run executes in a tracked task, so it keeps going (and keeps the
    /// admission slot) even if the caller stops waiting.
    ///
    /// # Errors
    /// Returns error if the request is invalid, admission is refused, or
    /// shutdown began before the run resolved.
    pub async fn run_buffered(&self, raw: RawRunRequest) -> Result<BufferedRun, StartError> {
        let (request, permit) = self.admit(raw)?;
        let (done_tx, done_rx) = oneshot::channel();

        let executor = Arc::clone(&self.executor);
        let approvals = Arc::clone(&self.approvals);
        self.track(async move {
            let started = Instant::now();
            tracing::info!("buffered run started");

            let mut buffer = BufferedRun::default();
            let outcome = pump(executor.as_ref(), approvals.as_ref(), request, &mut buffer).await;
            buffer.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            buffer.error = outcome.err();
            tracing::info!(
                items = buffer.items.len(),
                duration_ms = buffer.duration_ms,
                success = buffer.is_success(),
                "buffered run resolved"
            );

            // Slot is freed before the result is delivered.
            drop(permit);
            let _ = done_tx.send(buffer);
        })?;

        done_rx.await.map_err(|_| StartError::Cancelled)
    }

    /// Refuse new runs, drop all sessions and abort every in-flight run.
    ///
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        let dropped = self.registry.close();
        let Some(mut runs) = self.runs().take() else {
            return;
        };
        let in_flight = runs.len();
        runs.abort_all();
        while runs.join_next().await.is_some() {}
        tracing::info!(sessions = dropped, runs = in_flight, "orchestrator shut down");
    }
}

impl std::fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("registry", &self.registry)
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

/// Run the executor to resolution, feeding its notices into `sink`.
///
/// Notices are handled strictly in arrival order and all of them are
/// delivered before the outcome is returned.
async fn pump(
    executor: &dyn RunExecutor,
    approvals: &dyn ApprovalHandler,
    request: RunRequest,
    sink: &mut dyn RunSink,
) -> Result<(), String> {
    let (notices, mut rx) = NoticeSender::channel();
    let run = AssertUnwindSafe(executor.execute(request, notices)).catch_unwind();
    tokio::pin!(run);

    let resolved = loop {
        tokio::select! {
            biased;
            Some(notice) = rx.recv() => handle_notice(approvals, sink, notice).await,
            resolved = &mut run => break resolved,
        }
    };
    drain(approvals, sink, &mut rx).await;

    match resolved {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("executor panicked".to_string()),
    }
}

async fn drain(
    approvals: &dyn ApprovalHandler,
    sink: &mut dyn RunSink,
    rx: &mut mpsc::UnboundedReceiver<ExecutorNotice>,
) {
    rx.close();
    while let Ok(notice) = rx.try_recv() {
        handle_notice(approvals, sink, notice).await;
    }
}

async fn handle_notice(
    approvals: &dyn ApprovalHandler,
    sink: &mut dyn RunSink,
    notice: ExecutorNotice,
) {
    match notice {
        ExecutorNotice::Item(item) => sink.on_item(item),
        ExecutorNotice::Loading(loading) => sink.on_loading(loading),
        ExecutorNotice::Confirm { request, reply } => {
            let approved = decide(approvals, &request).await;
            // The executor may have resolved without waiting for the answer.
            let _ = reply.send(approved);
        }
    }
}

async fn decide(approvals: &dyn ApprovalHandler, request: &ConfirmationRequest) -> bool {
    match approvals.request_approval(request).await {
        Ok(ApprovalResult::Allow) => true,
        Ok(ApprovalResult::Deny { reason }) => {
            tracing::info!(request_id = %request.request_id, %reason, "confirmation denied");
            false
        }
        Err(e) => {
            tracing::warn!(request_id = %request.request_id, "Approval failed, denying: {e}");
            false
        }
    }
}
