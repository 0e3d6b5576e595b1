//! Host CLI: run code in a persistent worker, issue sub-queries, and check
//! that the worker and the reasoning backend are reachable.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use rlm::core::budget::CallBudget;
use rlm::core::profile::ExecutionProfile;
use rlm::exit_codes;
use rlm::host::bridge::CommandTool;
use rlm::host::limiter::SubQueryLimiter;
use rlm::host::pool::WorkerPool;
use rlm::host::{
    ControllerError, ControllerSettings, ExecuteOptions, ExecutionOutput, HostController, Variables,
};
use rlm::io::backend::{CommandBackend, ReasoningBackend};
use rlm::io::config::{DEFAULT_CONFIG_PATH, RlmConfig, load_config};
use rlm::io::process::ProcessLauncher;
use rlm::logging;
use serde_json::Value;
use tracing::warn;

const BACKEND_PROBE: &str = "Reply with the single word: ok";

#[derive(Parser)]
#[command(
    name = "rlm",
    version,
    about = "Run code in a persistent worker with host tools and budgeted sub-queries"
)]
struct Cli {
    /// Path to the TOML config; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run code in a fresh worker and print the result (stdin when neither --file nor --code).
    Exec {
        #[arg(long, conflicts_with = "code")]
        file: Option<PathBuf>,
        #[arg(long)]
        code: Option<String>,
        /// Session variable; the value is parsed as JSON, else taken as a string.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// root, delegate or maintenance.
        #[arg(long, default_value = "root")]
        profile: String,
        /// Name for a positional final-output value (repeatable).
        #[arg(long = "output", value_name = "NAME")]
        outputs: Vec<String>,
        /// Host tool backed by a command reading JSON on stdin (repeatable).
        #[arg(long = "tool", value_name = "NAME=COMMAND")]
        tools: Vec<String>,
        /// Overrides execute_timeout_secs.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Send one prompt through the sub-query limiter.
    Query { prompt: String },
    /// Verify the reasoning backend answers.
    CheckBackend,
    /// Verify the worker starts and runs code.
    CheckWorker,
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::from(exit_codes::OK),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Exec {
            file,
            code,
            vars,
            profile,
            outputs,
            tools,
            timeout_secs,
        } => {
            let code = read_code(file, code)?;
            let options = ExecuteOptions {
                tool_names: None,
                output_names: outputs,
                profile: profile.parse::<ExecutionProfile>()?,
                timeout: timeout_secs.map(Duration::from_secs),
            };
            cmd_exec(&config, &code, &vars, &tools, &options)
        }
        Command::Query { prompt } => cmd_query(&config, &prompt),
        Command::CheckBackend => cmd_check_backend(&config),
        Command::CheckWorker => cmd_check_worker(&config),
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ControllerError>() {
        Some(ControllerError::Timeout { .. }) => exit_codes::TIMEOUT,
        Some(ControllerError::WorkerExited { .. }) => exit_codes::WORKER_EXITED,
        _ => exit_codes::FAILED,
    }
}

fn cmd_exec(
    config: &RlmConfig,
    code: &str,
    vars: &[String],
    tools: &[String],
    options: &ExecuteOptions,
) -> Result<()> {
    let mut variables = Variables::new();
    for spec in vars {
        let (name, raw) = split_assignment(spec)?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        variables.insert(name, value);
    }

    let mut controller = build_controller(config)?;
    for spec in tools {
        let (name, command) = split_assignment(spec)?;
        let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let tool = CommandTool::new(
            &parts,
            Duration::from_secs(config.backend.timeout_secs),
            config.backend.output_limit_bytes,
        )
        .with_context(|| format!("tool {name}"))?;
        let registration = controller.register_tool(name, tool);
        if !registration.is_active() {
            warn!(tool = name, ?registration, "tool skipped: name is reserved");
        }
    }

    let output = controller.execute_with(code, variables, options)?;
    controller.shutdown();
    match output {
        ExecutionOutput::Text(text) => print!("{text}"),
        ExecutionOutput::Final(payload) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("serialize final output")?
            );
        }
    }
    Ok(())
}

fn cmd_query(config: &RlmConfig, prompt: &str) -> Result<()> {
    let limiter = SubQueryLimiter::new(
        build_backend(config)?,
        Arc::new(CallBudget::new(config.max_llm_calls)),
        WorkerPool::new("rlm-subquery", 1)?,
        Duration::from_secs(config.subquery_timeout_secs),
    );
    let answer = limiter.query(prompt)?;
    println!("{answer}");
    Ok(())
}

fn cmd_check_backend(config: &RlmConfig) -> Result<()> {
    let backend = build_backend(config)?;
    let answer = backend
        .complete(BACKEND_PROBE)
        .with_context(|| format!("backend {} is not reachable", backend.describe()))?;
    let first_line = answer.lines().next().unwrap_or_default();
    println!("backend ok ({}): {first_line}", backend.describe());
    Ok(())
}

fn cmd_check_worker(config: &RlmConfig) -> Result<()> {
    let mut controller = build_controller(config)?;
    let output = controller.execute(r#"print("ok");"#, Variables::new())?;
    controller.shutdown();
    match output {
        ExecutionOutput::Text(text) if text.trim() == "ok" => {
            println!("worker ok");
            Ok(())
        }
        other => bail!("worker answered unexpectedly: {other:?}"),
    }
}

fn build_backend(config: &RlmConfig) -> Result<Arc<dyn ReasoningBackend>> {
    Ok(Arc::new(CommandBackend::from_config(&config.backend)?))
}

fn build_controller(config: &RlmConfig) -> Result<HostController> {
    let mut launcher = if config.worker.command.is_empty() {
        ProcessLauncher::sibling_worker()?
    } else {
        ProcessLauncher::from_command(&config.worker.command)?
    };
    if let Some(root) = &config.worker.storage_root {
        launcher = launcher.with_storage_root(root);
    }
    Ok(HostController::new(
        launcher,
        build_backend(config)?,
        ControllerSettings::from(config),
    ))
}

fn read_code(file: Option<PathBuf>, code: Option<String>) -> Result<String> {
    match (file, code) {
        (Some(path), _) => {
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
        }
        (None, Some(code)) => Ok(code),
        (None, None) => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("read code from stdin")?;
            Ok(code)
        }
    }
}

/// Split `NAME=VALUE`.
fn split_assignment(spec: &str) -> Result<(&str, &str)> {
    let (name, value) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got {spec:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("missing name in {spec:?}");
    }
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exec_with_repeated_flags() {
        let cli = Cli::parse_from([
            "rlm", "exec", "--code", "print(1);", "--var", "n=3", "--var", "s=x", "--output",
            "a", "--profile", "delegate",
        ]);
        match cli.command {
            Command::Exec {
                code,
                vars,
                outputs,
                profile,
                file,
                ..
            } => {
                assert_eq!(code.as_deref(), Some("print(1);"));
                assert_eq!(vars, vec!["n=3", "s=x"]);
                assert_eq!(outputs, vec!["a"]);
                assert_eq!(profile, "delegate");
                assert!(file.is_none());
            }
            _ => panic!("expected exec"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from(["rlm", "check-worker", "--config", "other.toml"]);
        assert!(matches!(cli.command, Command::CheckWorker));
        assert_eq!(cli.config, PathBuf::from("other.toml"));
    }

    #[test]
    fn file_and_code_conflict() {
        assert!(Cli::try_parse_from(["rlm", "exec", "--file", "a.rhai", "--code", "x"]).is_err());
    }

    #[test]
    fn split_assignment_keeps_equals_in_value() {
        assert_eq!(split_assignment("q=a=b").expect("split"), ("q", "a=b"));
        assert!(split_assignment("novalue").is_err());
        assert!(split_assignment("=1").is_err());
    }

    #[test]
    fn exit_codes_follow_controller_errors() {
        let timeout = anyhow::Error::new(ControllerError::Timeout {
            after: Duration::from_secs(1),
        })
        .context("exec");
        assert_eq!(exit_code_for(&timeout), exit_codes::TIMEOUT);
        let exited = anyhow::Error::new(ControllerError::WorkerExited {
            stderr_tail: String::new(),
        });
        assert_eq!(exit_code_for(&exited), exit_codes::WORKER_EXITED);
        assert_eq!(exit_code_for(&anyhow!("other")), exit_codes::FAILED);
    }
}
