//! Host-side resolution of tool calls issued by evaluated code.

use std::panic::{self, AssertUnwindSafe};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use crate::core::hygiene::{redact_secrets, tail};
use crate::core::protocol::{ToolCall, ToolReply};
use crate::core::registry::{LLM_QUERY, LLM_QUERY_BATCHED, Registration, ToolRegistry};
use crate::host::limiter::SubQueryLimiter;
use crate::host::pool::panic_message;
use crate::io::process::run_command_with_timeout;

/// A capability the host exposes to evaluated code.
pub trait HostTool: Send + Sync {
    fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value>;
}

/// Tool backed by a closure.
pub struct FnTool<F>(F);

impl<F> FnTool<F>
where
    F: Fn(&[Value], &Map<String, Value>) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> HostTool for FnTool<F>
where
    F: Fn(&[Value], &Map<String, Value>) -> Result<Value> + Send + Sync,
{
    fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value> {
        (self.0)(args, kwargs)
    }
}

/// Tool backed by an external command.
///
/// The command receives `{"args": [..], "kwargs": {..}}` on stdin. Its stdout
/// is parsed as JSON when possible and passed back as a string otherwise.
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandTool {
    pub fn new(command: &[String], timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("tool command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            output_limit_bytes,
        })
    }
}

impl HostTool for CommandTool {
    #[instrument(skip_all, fields(program = %self.program))]
    fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value> {
        let input = serde_json::to_vec(&json!({ "args": args, "kwargs": kwargs }))
            .context("serialize tool input")?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let output =
            run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
                .with_context(|| format!("run tool command {}", self.program))?;
        if output.timed_out {
            bail!("tool command timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "tool command failed with status {:?}: {}",
                output.status.code(),
                redact_secrets(tail(stderr.trim_end(), 500))
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

/// Resolves every tool call to exactly one reply.
#[derive(Default, Clone)]
pub struct ToolBridge {
    tools: ToolRegistry<Arc<dyn HostTool>>,
}

impl ToolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` under `name`. Reserved and empty names are skipped.
    pub fn register(&mut self, name: &str, tool: impl HostTool + 'static) -> Registration {
        let registration = self.tools.register(name, Arc::new(tool));
        if !registration.is_active() {
            debug!(tool = name, ?registration, "host tool not registered");
        }
        registration
    }

    pub fn register_fn<F>(&mut self, name: &str, f: F) -> Registration
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, FnTool::new(f))
    }

    /// Names of registered tools, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.names()
    }

    /// Resolve `call`. Never panics and never fails: every outcome is a reply.
    #[instrument(skip_all, fields(tool = %call.name))]
    pub fn dispatch(&self, call: &ToolCall, limiter: &SubQueryLimiter) -> ToolReply {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.resolve(call, limiter)))
            .unwrap_or_else(|payload| {
                Err(anyhow!(
                    "tool {} panicked: {}",
                    call.name,
                    panic_message(&*payload)
                ))
            });
        match outcome {
            Ok(value) => ToolReply::Result(value),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "tool call failed");
                ToolReply::Error(format!("{err:#}"))
            }
        }
    }

    fn resolve(&self, call: &ToolCall, limiter: &SubQueryLimiter) -> Result<Value> {
        match call.name.as_str() {
            LLM_QUERY => {
                let prompt = argument(call, 0, "prompt")
                    .ok_or_else(|| anyhow!("{LLM_QUERY} requires a prompt"))?;
                let answer = limiter.query(&text_of(prompt))?;
                Ok(Value::String(answer))
            }
            LLM_QUERY_BATCHED => {
                let prompts = argument(call, 0, "prompts")
                    .and_then(Value::as_array)
                    .ok_or_else(|| anyhow!("{LLM_QUERY_BATCHED} requires a list of prompts"))?;
                let prompts: Vec<String> = prompts.iter().map(text_of).collect();
                let answers = limiter.query_batched(&prompts)?;
                Ok(Value::Array(answers.into_iter().map(Value::String).collect()))
            }
            name => match self.tools.get(name) {
                Some(tool) => tool.call(&call.args, &call.kwargs),
                None => bail!("unknown tool: {name}"),
            },
        }
    }
}

/// Positional argument `index`, falling back to keyword `key`.
fn argument<'a>(call: &'a ToolCall, index: usize, key: &str) -> Option<&'a Value> {
    call.args.get(index).or_else(|| call.kwargs.get(key))
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
