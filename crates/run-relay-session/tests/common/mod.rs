//! Channel-driven executor double shared by the scenario tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use run_relay_core::{
    ConfirmationRequest, ExecutorError, NoticeSender, RunExecutor, RunRequest,
};
use run_relay_executor::AutoApproveHandler;
use run_relay_session::{AdmissionController, AdmissionPolicy, RunOrchestrator, SessionRegistry};
use serde_json::Value;
use tokio::sync::mpsc;

/// One scripted action of the executor.
#[derive(Debug)]
pub enum Step {
    Item(Value),
    Loading(bool),
    Confirm(&'static str),
    Succeed,
    Fail(&'static str),
    Panic,
}

/// Executor whose every move is fed in by the test.
pub struct ScriptedExecutor {
    steps: tokio::sync::Mutex<mpsc::UnboundedReceiver<Step>>,
    calls: AtomicUsize,
    instructions: Mutex<Vec<String>>,
    confirmations: Mutex<Vec<bool>>,
}

impl ScriptedExecutor {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Step>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Arc::new(Self {
            steps: tokio::sync::Mutex::new(rx),
            calls: AtomicUsize::new(0),
            instructions: Mutex::new(Vec::new()),
            confirmations: Mutex::new(Vec::new()),
        });
        (executor, tx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions.lock().unwrap().clone()
    }

    pub fn confirmations(&self) -> Vec<bool> {
        self.confirmations.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: RunRequest,
        notices: NoticeSender,
    ) -> Result<(), ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.instructions
            .lock()
            .unwrap()
            .push(request.instruction().to_string());

        let mut steps = self.steps.lock().await;
        while let Some(step) = steps.recv().await {
            match step {
                Step::Item(item) => notices.item(item),
                Step::Loading(loading) => notices.loading(loading),
                Step::Confirm(prompt) => {
                    let approved = notices
                        .confirm(ConfirmationRequest {
                            request_id: prompt.to_string(),
                            prompt: prompt.to_string(),
                            detail: Value::Null,
                        })
                        .await;
                    self.confirmations.lock().unwrap().push(approved);
                }
                Step::Succeed => return Ok(()),
                Step::Fail(message) => return Err(ExecutorError::Failed(message.to_string())),
                Step::Panic => panic!("scripted executor panic"),
            }
        }
        Err(ExecutorError::Failed("script ended".into()))
    }
}

pub fn orchestrator(
    policy: AdmissionPolicy,
) -> (Arc<RunOrchestrator>, Arc<ScriptedExecutor>, mpsc::UnboundedSender<Step>) {
    let (executor, steps) = ScriptedExecutor::new();
    let orchestrator = RunOrchestrator::new(
        SessionRegistry::new(),
        executor.clone(),
        Arc::new(AutoApproveHandler),
        AdmissionController::new(policy),
    );
    (Arc::new(orchestrator), executor, steps)
}

/// Poll `condition` until it holds, failing the test after a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
