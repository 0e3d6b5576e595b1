//! Reasoning backend abstraction for sub-queries.
//!
//! The [`ReasoningBackend`] trait decouples the sub-query limiter from the
//! model that answers prompts. [`CommandBackend`] pipes the prompt to an
//! external command; tests use closures and scripted failures instead.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};

use crate::core::hygiene::{redact_secrets, tail};
use crate::io::config::BackendConfig;
use crate::io::process::run_command_with_timeout;

/// Bytes of backend stderr quoted in failure messages.
const STDERR_EXCERPT_BYTES: usize = 500;

/// Answers one prompt with one completion.
pub trait ReasoningBackend: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;

    /// Short human-readable description for logs and diagnostics.
    fn describe(&self) -> String {
        "backend".to_string()
    }
}

/// Backend that writes the prompt to a command's stdin and reads the completion
/// from its stdout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(command: &[String], timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("backend command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            output_limit_bytes,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Self::new(
            &config.command,
            Duration::from_secs(config.timeout_secs),
            config.output_limit_bytes,
        )
    }
}

impl ReasoningBackend for CommandBackend {
    #[instrument(skip_all, fields(program = %self.program, prompt_len = prompt.len()))]
    fn complete(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run backend command {}", self.program))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "backend command timed out");
            bail!("backend command timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "backend command failed");
            bail!(
                "backend command failed with status {:?}: {}",
                output.status.code(),
                redact_secrets(tail(stderr.trim_end(), STDERR_EXCERPT_BYTES))
            );
        }

        let mut text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        text.push_str(&output.stdout_truncated_notice("backend"));
        debug!(completion_len = text.len(), "backend call completed");
        Ok(text)
    }

    fn describe(&self) -> String {
        format!("command `{} {}`", self.program, self.args.join(" "))
            .trim_end()
            .to_string()
    }
}
