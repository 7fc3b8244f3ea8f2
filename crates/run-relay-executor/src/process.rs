//! Run executor backed by an agent child process.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use run_relay_core::{ExecutorError, NoticeSender, RunExecutor, RunRequest};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    task::JoinHandle,
};

use crate::{
    command::CommandBuilder,
    protocol::{AgentLine, ConfirmResponse, parse_line},
};

/// Spawns the configured agent command once per run.
///
/// The instruction is passed as the last argument, preceded by one
/// `--attachment <ref>` pair per attachment. The process runs in its own
/// process group, which is killed if the run is dropped before it exits.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    builder: CommandBuilder,
    working_dir: PathBuf,
}

impl CommandExecutor {
    #[must_use]
    pub const fn new(builder: CommandBuilder, working_dir: PathBuf) -> Self {
        Self {
            builder,
            working_dir,
        }
    }

    fn run_args(request: &RunRequest) -> Vec<String> {
        let mut args = Vec::with_capacity(request.attachments().len() * 2 + 1);
        for attachment in request.attachments() {
            args.push("--attachment".to_string());
            args.push(match attachment {
                Value::String(reference) => reference.clone(),
                other => other.to_string(),
            });
        }
        args.push(request.instruction().to_string());
        args
    }

    async fn spawn(&self, request: &RunRequest) -> Result<ProcessGuard, ExecutorError> {
        let parts = self
            .builder
            .build(&Self::run_args(request))
            .map_err(|e| ExecutorError::CommandBuild(e.to_string()))?;
        let (program, args) = parts
            .into_resolved()
            .await
            .map_err(|e| ExecutorError::ExecutableNotFound(e.to_string()))?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command
            .group_spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", program.display())))?;
        tracing::debug!(program = %program.display(), pid = ?child.id(), "agent process spawned");

        Ok(ProcessGuard {
            child,
            exited: false,
        })
    }

    async fn drive(
        mut process: ProcessGuard,
        notices: &NoticeSender,
    ) -> Result<(), ExecutorError> {
        let inner = process.child.inner();
        let (Some(stdout), Some(stdin), Some(stderr)) =
            (inner.stdout.take(), inner.stdin.take(), inner.stderr.take())
        else {
            return Err(ExecutorError::Spawn("agent stdio was not captured".into()));
        };

        let stderr_tail = spawn_stderr_tail(stderr);
        let mut stdin = Some(stdin);
        let mut lines = LossyLines::new(stdout);

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                AgentLine::Item(item) => notices.item(item),
                AgentLine::Loading(loading) => notices.loading(loading),
                AgentLine::Confirm(request) => {
                    let request_id = request.request_id.clone();
                    let approved = notices.confirm(request).await;
                    let response = ConfirmResponse {
                        request_id,
                        approved,
                    };
                    if let Err(e) = write_response(&mut stdin, &response).await {
                        // The exit status decides the outcome if the agent went away.
                        tracing::warn!("Failed to answer confirmation: {e}");
                        stdin = None;
                    }
                }
            }
        }

        drop(stdin);
        let status = process.child.wait().await?;
        process.exited = true;

        if status.success() {
            return Ok(());
        }
        let tail = stderr_tail.await.ok().flatten();
        Err(ExecutorError::Failed(
            tail.unwrap_or_else(|| format!("agent exited with {status}")),
        ))
    }
}

#[async_trait]
impl RunExecutor for CommandExecutor {
    async fn execute(
        &self,
        request: RunRequest,
        notices: NoticeSender,
    ) -> Result<(), ExecutorError> {
        let process = self.spawn(&request).await?;
        notices.loading(true);
        let result = Self::drive(process, &notices).await;
        notices.loading(false);
        result
    }
}

/// Kills the process group unless the child was reaped.
struct ProcessGuard {
    child: AsyncGroupChild,
    exited: bool,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if !self.exited {
            if let Err(e) = self.child.start_kill() {
                tracing::debug!("Failed to kill agent process group: {e}");
            }
        }
    }
}

async fn write_response(
    stdin: &mut Option<ChildStdin>,
    response: &ConfirmResponse,
) -> std::io::Result<()> {
    let Some(stdin) = stdin.as_mut() else {
        return Ok(());
    };
    let json = serde_json::to_string(response)?;
    stdin.write_all(json.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Line reader that replaces invalid UTF-8 instead of failing.
struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Collect the last non-empty stderr line.
fn spawn_stderr_tail<R>(stderr: R) -> JoinHandle<Option<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut last = None;
        let mut lines = LossyLines::new(stderr);
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                tracing::debug!(target: "run_relay_executor::agent_stderr", "{line}");
                last = Some(line.to_owned());
            }
        }
        last
    })
}
