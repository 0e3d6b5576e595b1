//! Host controller: owns one worker and runs requests against it.
//!
//! The caller thread writes requests and waits on a queue fed by a single
//! reader thread, so every wait can be bounded by a deadline. Tool calls
//! arriving while a request is in flight run on a pool thread through the
//! [`ToolBridge`] and count against the same deadline.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{CallBudget, remaining_budget};
use crate::core::hygiene::{redact_secrets, summarize_stdout, tail};
use crate::core::profile::ExecutionProfile;
use crate::core::protocol::{
    ExecuteRequest, ExecuteResponse, ToolCall, ToolReply, WorkerMessage, decode_worker_line,
    encode_line,
};
use crate::core::registry::Registration;
use crate::host::bridge::{HostTool, ToolBridge};
use crate::host::limiter::SubQueryLimiter;
use crate::host::pool::WorkerPool;
use crate::host::reader::{ReaderEvent, StderrTail, spawn_line_reader};
use crate::host::transport::{WorkerHandle, WorkerLauncher};
use crate::io::backend::ReasoningBackend;
use crate::io::config::RlmConfig;

/// How long to let the stderr drain catch up after the worker's stdout closed.
const STDERR_SETTLE: Duration = Duration::from_millis(200);

/// Transport faults. Fatal to the worker: the controller has already shut it
/// down when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error(
        "worker did not respond within {}s; the worker was terminated and its state discarded",
        .after.as_secs_f64()
    )]
    Timeout { after: Duration },
    #[error("{}", exit_message(.stderr_tail))]
    WorkerExited { stderr_tail: String },
    #[error("worker i/o failed: {0}")]
    Io(String),
    #[error("worker protocol error: {0}")]
    Protocol(String),
}

fn exit_message(stderr_tail: &str) -> String {
    if stderr_tail.trim().is_empty() {
        "worker exited unexpectedly".to_string()
    } else {
        format!("worker exited unexpectedly; stderr tail:\n{}", stderr_tail.trim_end())
    }
}

/// What a request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutput {
    /// Summarized stdout followed by the full stderr.
    Text(String),
    /// Normalized final-output payload.
    Final(Value),
}

/// Variables merged into the worker session before a request runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables(Map<String, Value>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value`, falling back to its `Debug` text when it cannot be
    /// represented as JSON.
    pub fn with<T: Serialize + fmt::Debug>(mut self, name: &str, value: &T) -> Self {
        let json = serde_json::to_value(value).unwrap_or_else(|err| {
            debug!(variable = name, error = %err, "variable sent as text");
            Value::String(format!("{value:?}"))
        });
        self.0.insert(name.to_string(), json);
        self
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// Per-request options beyond code and variables.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Tools to expose; `None` exposes every tool registered on the controller.
    pub tool_names: Option<Vec<String>>,
    pub output_names: Vec<String>,
    pub profile: ExecutionProfile,
    /// Overrides the configured execution timeout.
    pub timeout: Option<Duration>,
}

/// Limits applied by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub execute_timeout: Duration,
    pub subquery_timeout: Duration,
    pub max_llm_calls: usize,
    pub max_batch_workers: usize,
    pub stdout_limit_chars: usize,
    pub stdout_preview_chars: usize,
    pub stderr_tail_bytes: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&RlmConfig::default())
    }
}

impl From<&RlmConfig> for ControllerSettings {
    fn from(config: &RlmConfig) -> Self {
        Self {
            execute_timeout: Duration::from_secs(config.execute_timeout_secs),
            subquery_timeout: Duration::from_secs(config.subquery_timeout_secs),
            max_llm_calls: config.max_llm_calls,
            max_batch_workers: config.max_batch_workers,
            stdout_limit_chars: config.stdout_limit_chars,
            stdout_preview_chars: config.stdout_preview_chars,
            stderr_tail_bytes: config.stderr_tail_bytes,
        }
    }
}

/// Everything tied to one running worker.
struct WorkerSession {
    stdin: Box<dyn Write + Send>,
    events: Receiver<ReaderEvent>,
    stderr: StderrTail,
    handle: Box<dyn WorkerHandle>,
    limiter: Arc<SubQueryLimiter>,
    tools: WorkerPool,
}

enum AwaitOutcome {
    Response(ExecuteResponse),
    TimedOut,
    Exited { stderr_tail: String },
    Failed(String),
}

pub struct HostController {
    launcher: Box<dyn WorkerLauncher>,
    backend: Arc<dyn ReasoningBackend>,
    bridge: Arc<ToolBridge>,
    settings: ControllerSettings,
    budget: Arc<CallBudget>,
    session: Option<WorkerSession>,
}

impl HostController {
    pub fn new(
        launcher: impl WorkerLauncher + 'static,
        backend: Arc<dyn ReasoningBackend>,
        settings: ControllerSettings,
    ) -> Self {
        let budget = Arc::new(CallBudget::new(settings.max_llm_calls));
        Self {
            launcher: Box::new(launcher),
            backend,
            bridge: Arc::new(ToolBridge::new()),
            settings,
            budget,
            session: None,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Expose `tool` to evaluated code under `name`.
    ///
    /// Names owned by the runtime are skipped; the returned [`Registration`]
    /// says so.
    pub fn register_tool(&mut self, name: &str, tool: impl HostTool + 'static) -> Registration {
        Arc::make_mut(&mut self.bridge).register(name, tool)
    }

    pub fn register_tool_fn<F>(&mut self, name: &str, f: F) -> Registration
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.bridge).register_fn(name, f)
    }

    /// Launch the worker if it is not running. A fresh launch starts a fresh
    /// sub-query budget.
    #[instrument(skip_all)]
    pub fn start(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        info!(worker = %self.launcher.describe(), "launching worker");
        let streams = self.launcher.launch().context("launch worker")?;
        let events = spawn_line_reader(streams.stdout)?;
        let stderr = match streams.stderr {
            Some(stderr) => StderrTail::spawn(stderr, self.settings.stderr_tail_bytes)?,
            None => StderrTail::empty(),
        };

        self.budget.reset();
        let single = WorkerPool::new("rlm-subquery", 1)?;
        let limiter = SubQueryLimiter::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.budget),
            single,
            self.settings.subquery_timeout,
        )
        .with_max_batch_workers(self.settings.max_batch_workers);
        let tools = WorkerPool::new("rlm-tool", 1)?;

        debug!(pid = ?streams.handle.id(), "worker started");
        self.session = Some(WorkerSession {
            stdin: streams.stdin,
            events,
            stderr,
            handle: streams.handle,
            limiter: Arc::new(limiter),
            tools,
        });
        Ok(())
    }

    pub fn execute(&mut self, code: &str, variables: Variables) -> Result<ExecutionOutput> {
        self.execute_with(code, variables, &ExecuteOptions::default())
    }

    /// Run one request and wait for its response.
    ///
    /// Transport faults are returned as [`ControllerError`] (downcast from the
    /// `anyhow::Error`) after the worker has been shut down.
    #[instrument(skip_all, fields(code_len = code.len(), profile = %options.profile))]
    pub fn execute_with(
        &mut self,
        code: &str,
        variables: Variables,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutput> {
        self.start()?;

        let request = ExecuteRequest {
            code: code.to_string(),
            variables: variables.into_map(),
            tool_names: options
                .tool_names
                .clone()
                .unwrap_or_else(|| self.bridge.tool_names()),
            output_names: options.output_names.clone(),
            profile: options.profile,
        };
        let line = encode_line(&request)?;
        let timeout = options.timeout.unwrap_or(self.settings.execute_timeout);
        let deadline = Instant::now() + timeout;

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("worker is not running"))?;
        let outcome = match write_line(session.stdin.as_mut(), &line) {
            Ok(()) => await_response(session, &self.bridge, deadline, &self.settings),
            Err(err) => {
                debug!(error = %format!("{err:#}"), "request write failed");
                AwaitOutcome::Exited {
                    stderr_tail: stderr_tail(session, &self.settings),
                }
            }
        };

        match outcome {
            AwaitOutcome::Response(response) => Ok(self.render(response)),
            AwaitOutcome::TimedOut => {
                warn!(timeout_secs = timeout.as_secs(), "worker timed out; terminating");
                self.shutdown();
                Err(ControllerError::Timeout { after: timeout }.into())
            }
            AwaitOutcome::Exited { stderr_tail } => {
                warn!("worker exited unexpectedly");
                self.shutdown();
                Err(ControllerError::WorkerExited { stderr_tail }.into())
            }
            AwaitOutcome::Failed(message) => {
                warn!(error = %message, "worker i/o failed; terminating");
                self.shutdown();
                Err(ControllerError::Io(message).into())
            }
        }
    }

    /// Terminate the worker and release everything tied to it. Safe to call
    /// repeatedly; never waits on threads that may be blocked.
    pub fn shutdown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        debug!(pid = ?session.handle.id(), "shutting down worker");
        session.handle.terminate();
        // Dropping the session closes stdin, detaches the reader and releases
        // the sub-query and tool pools.
        drop(session);
    }

    pub fn is_running(&mut self) -> bool {
        self.session
            .as_mut()
            .is_some_and(|session| session.handle.is_alive())
    }

    /// Sub-query calls spent since the current worker was launched.
    pub fn calls_used(&self) -> usize {
        self.budget.used()
    }

    fn render(&self, response: ExecuteResponse) -> ExecutionOutput {
        if let Some(payload) = response.final_output {
            return ExecutionOutput::Final(payload);
        }
        let mut text = summarize_stdout(
            &response.stdout,
            self.settings.stdout_limit_chars,
            self.settings.stdout_preview_chars,
        );
        if !response.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&response.stderr);
        }
        ExecutionOutput::Text(text)
    }
}

impl Drop for HostController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_line(stdin: &mut (dyn Write + Send), line: &str) -> Result<()> {
    stdin
        .write_all(line.as_bytes())
        .context("write to worker stdin")?;
    stdin.flush().context("flush worker stdin")
}

/// Pump reader events until the response for the in-flight request arrives.
fn await_response(
    session: &mut WorkerSession,
    bridge: &Arc<ToolBridge>,
    deadline: Instant,
    settings: &ControllerSettings,
) -> AwaitOutcome {
    loop {
        let Some(remaining) = remaining_budget(deadline) else {
            return AwaitOutcome::TimedOut;
        };
        let line = match session.events.recv_timeout(remaining) {
            Ok(ReaderEvent::Line(line)) => line,
            Ok(ReaderEvent::Eof) | Err(RecvTimeoutError::Disconnected) => {
                return AwaitOutcome::Exited {
                    stderr_tail: stderr_tail(session, settings),
                };
            }
            Err(RecvTimeoutError::Timeout) => return AwaitOutcome::TimedOut,
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_worker_line(&line) {
            Ok(WorkerMessage::Response(response)) => return AwaitOutcome::Response(response),
            Ok(WorkerMessage::ToolCall(message)) => {
                let call = message.tool_call;
                let Some(reply) = run_tool(session, bridge, &call, deadline) else {
                    warn!(tool = %call.name, "tool call outlived the execution deadline");
                    let reply = ToolReply::Error(format!(
                        "tool {} did not finish before the execution deadline",
                        call.name
                    ));
                    // Best effort: the worker is torn down either way.
                    let _ = encode_line(&reply)
                        .and_then(|encoded| write_line(session.stdin.as_mut(), &encoded));
                    return AwaitOutcome::TimedOut;
                };
                let written = encode_line(&reply)
                    .and_then(|encoded| write_line(session.stdin.as_mut(), &encoded));
                if let Err(err) = written {
                    return AwaitOutcome::Failed(format!("{err:#}"));
                }
            }
            Err(err) => {
                let preview: String = line.chars().take(200).collect();
                warn!(error = %format!("{err:#}"), line = %preview, "ignoring undecodable worker line");
            }
        }
    }
}

/// Dispatch `call` on the tool pool. `None` when the deadline passes first.
fn run_tool(
    session: &WorkerSession,
    bridge: &Arc<ToolBridge>,
    call: &ToolCall,
    deadline: Instant,
) -> Option<ToolReply> {
    let (job_bridge, limiter, job_call) =
        (Arc::clone(bridge), Arc::clone(&session.limiter), call.clone());
    let rx = match session
        .tools
        .submit(move || Ok(job_bridge.dispatch(&job_call, &limiter)))
    {
        Ok(rx) => rx,
        Err(err) => return Some(ToolReply::Error(format!("{err:#}"))),
    };
    let remaining = remaining_budget(deadline)?;
    match rx.recv_timeout(remaining) {
        Ok(Ok(reply)) => Some(reply),
        Ok(Err(err)) => Some(ToolReply::Error(format!("{err:#}"))),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(ToolReply::Error(format!(
            "tool {} stopped before answering",
            call.name
        ))),
    }
}

fn stderr_tail(session: &WorkerSession, settings: &ControllerSettings) -> String {
    let snapshot = session.stderr.snapshot(STDERR_SETTLE);
    redact_secrets(tail(&snapshot, settings.stderr_tail_bytes))
}
