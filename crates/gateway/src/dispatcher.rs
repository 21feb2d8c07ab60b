//! Fire-and-forget execution of voice tasks through the external runner.
//!
//! A dispatch moves through `Started -> CollectingOutput -> Completed`.
//! Every failure along the way (spawn error, non-zero exit, unparsable
//! output) collapses into an `error` [`TaskResult`], so each dispatch ends
//! with exactly one status record and one notification attempt.
//!
//! There is no timeout: a runner that never exits holds its task forever.

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use codelexa_common::Clock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::notifications::Notifier;
use crate::status_store::{StatusEntry, StatusStore};

const CONTEXT_OPEN: &str = "[codelexa-context]";
const CONTEXT_CLOSE: &str = "[/codelexa-context]";
const LOG_SNIPPET_LIMIT: usize = 512;
const SUMMARY_LIMIT: usize = 240;

/// One task headed for the runner.
#[derive(Clone)]
pub struct TaskMessage {
    pub task: String,
    pub intent: String,
    pub access_token: Option<String>,
}

impl TaskMessage {
    pub fn new(
        task: impl Into<String>,
        intent: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            task: task.into(),
            intent: intent.into(),
            access_token: access_token.filter(|token| !token.is_empty()),
        }
    }

    /// Plain-text input for the runner: an optional context block followed by
    /// the task text.
    pub fn envelope(&self) -> String {
        let mut context = Vec::new();
        if !self.intent.is_empty() {
            context.push(format!("INTENT={}", single_line(&self.intent)));
        }
        if let Some(token) = &self.access_token {
            context.push(format!("ACCESS_TOKEN={}", single_line(token)));
        }

        let mut envelope = String::new();
        if !context.is_empty() {
            envelope.push_str(CONTEXT_OPEN);
            envelope.push('\n');
            for line in context {
                envelope.push_str(&line);
                envelope.push('\n');
            }
            envelope.push_str(CONTEXT_CLOSE);
            envelope.push_str("\n\n");
        }
        envelope.push_str(&self.task);
        envelope.push('\n');
        envelope
    }
}

// The access token must never appear in logs.
impl std::fmt::Debug for TaskMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMessage")
            .field("task", &self.task)
            .field("intent", &self.intent)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The runner's verdict, read from the last line of its stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub recipients: Option<Vec<String>>,
}

impl TaskResult {
    pub const SUCCESS: &'static str = "success";
    pub const ERROR: &'static str = "error";

    fn failed(summary: String) -> Self {
        Self {
            status: Self::ERROR.to_string(),
            summary,
            session: None,
            recipients: None,
        }
    }
}

#[derive(Debug)]
enum DispatchState {
    Started,
    CollectingOutput { pid: Option<u32> },
    Completed(TaskResult),
}

#[derive(Debug)]
struct WorkerOutput {
    success: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

pub struct TaskDispatcher {
    worker: WorkerConfig,
    store: StatusStore,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    limiter: Option<Arc<Semaphore>>,
}

impl TaskDispatcher {
    pub fn new(
        worker: WorkerConfig,
        store: StatusStore,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = worker
            .max_concurrent
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            worker,
            store,
            notifier,
            clock,
            limiter,
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Start a dispatch in the background and return immediately.
    ///
    /// The handle resolves to the recorded entry; callers on the request path
    /// drop it.
    pub fn enqueue(
        self: &Arc<Self>,
        task: impl Into<String>,
        intent: impl Into<String>,
        access_token: Option<String>,
    ) -> JoinHandle<StatusEntry> {
        let message = TaskMessage::new(task, intent, access_token);
        info!(task = %message.task, intent = %message.intent, "task enqueued");
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.dispatch(message).await })
    }

    /// Run one task to completion, record it, and send the completion notice.
    pub async fn dispatch(&self, message: TaskMessage) -> StatusEntry {
        let permit = match &self.limiter {
            Some(limiter) => Arc::clone(limiter).acquire_owned().await.ok(),
            None => None,
        };

        let result = self.run_worker(&message).await;

        let entry = StatusEntry {
            timestamp: self.clock.now(),
            task: message.task.clone(),
            status: result.status.clone(),
            summary: result.summary.clone(),
            session: result.session.clone(),
            recipients: result.recipients.clone().unwrap_or_default(),
            intent: message.intent.clone(),
        };
        self.record(entry.clone()).await;
        drop(permit);

        let notice = if result.summary.trim().is_empty() {
            format!("Codex finished: {}", message.task)
        } else {
            result.summary
        };
        if let Err(err) = self.notifier.notify(&notice).await {
            warn!(task = %message.task, error = %err, "completion notice not delivered");
        }

        entry
    }

    async fn record(&self, entry: StatusEntry) {
        let store = self.store.clone();
        match task::spawn_blocking(move || store.record(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %format!("{err:#}"), "failed to record task status"),
            Err(err) => error!(error = %err, "status recorder panicked"),
        }
    }

    async fn run_worker(&self, message: &TaskMessage) -> TaskResult {
        let mut state = DispatchState::Started;
        self.trace(message, &state);

        let mut command = self.command();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(
                    runner = %self.worker.runner.display(),
                    error = %err,
                    "failed to start task runner"
                );
                state = DispatchState::Completed(TaskResult::failed(format!(
                    "Codex could not start \"{}\": {}",
                    message.task, err
                )));
                return self.finish(message, state);
            }
        };

        state = DispatchState::CollectingOutput { pid: child.id() };
        self.trace(message, &state);

        let stdin = child.stdin.take();
        let envelope = message.envelope();
        let feeder = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(envelope.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), io::Error>(())
        });

        let waited = child.wait_with_output().await;
        match feeder.await {
            Ok(Ok(())) => {}
            // A runner may exit before reading its input; its exit status says more.
            Ok(Err(err)) => debug!(error = %err, "runner input not fully delivered"),
            Err(err) => warn!(error = %err, "runner input writer aborted"),
        }

        let result = match waited {
            Ok(output) => interpret(
                message,
                WorkerOutput {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
            ),
            Err(err) => TaskResult::failed(format!(
                "Codex lost track of \"{}\": {}",
                message.task, err
            )),
        };

        state = DispatchState::Completed(result);
        self.finish(message, state)
    }

    fn finish(&self, message: &TaskMessage, state: DispatchState) -> TaskResult {
        self.trace(message, &state);
        match state {
            DispatchState::Completed(result) => result,
            other => TaskResult::failed(format!(
                "Codex stopped \"{}\" in an unexpected state ({other:?})",
                message.task
            )),
        }
    }

    fn trace(&self, message: &TaskMessage, state: &DispatchState) {
        match state {
            DispatchState::Started => debug!(task = %message.task, "dispatch started"),
            DispatchState::CollectingOutput { pid } => {
                debug!(task = %message.task, pid = ?pid, "runner spawned; collecting output")
            }
            DispatchState::Completed(result) => info!(
                task = %message.task,
                status = %result.status,
                summary = %result.summary,
                "dispatch completed"
            ),
        }
    }

    fn command(&self) -> Command {
        let mut command = match &self.worker.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&self.worker.runner);
                command
            }
            None => Command::new(&self.worker.runner),
        };
        command
            .args(&self.worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

fn interpret(message: &TaskMessage, output: WorkerOutput) -> TaskResult {
    debug!(
        task = %message.task,
        exit_code = ?output.exit_code,
        stdout = %snippet(&output.stdout, LOG_SNIPPET_LIMIT),
        stderr = %snippet(&output.stderr, LOG_SNIPPET_LIMIT),
        "runner exited"
    );

    let parsed = parse_result_line(&output.stdout);
    if output.success {
        if let Some(result) = parsed {
            return result;
        }
        warn!(task = %message.task, "runner output had no result line");
    } else {
        warn!(task = %message.task, exit_code = ?output.exit_code, "runner exited with failure");
    }

    let stderr = output.stderr.trim();
    let summary = if !stderr.is_empty() {
        format!(
            "Codex could not finish \"{}\": {}",
            message.task,
            snippet(stderr, SUMMARY_LIMIT)
        )
    } else {
        match output.exit_code {
            Some(code) if code != 0 => {
                format!("Codex could not finish \"{}\" (exit code {code})", message.task)
            }
            Some(_) => format!("Codex finished \"{}\" without a result", message.task),
            None => format!("Codex could not finish \"{}\" (terminated)", message.task),
        }
    };
    TaskResult::failed(summary)
}

/// The runner's verdict is the last non-blank line of stdout.
fn parse_result_line(stdout: &str) -> Option<TaskResult> {
    let line = stdout.lines().rev().map(str::trim).find(|line| !line.is_empty())?;
    serde_json::from_str::<TaskResult>(line).ok()
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn snippet(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}
