//! Host configuration stored in `rlm.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::host::limiter::MAX_BATCH_WORKERS;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "rlm.toml";

/// Host configuration (TOML).
///
/// Missing fields default to the values below; an absent file is the same as an
/// empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RlmConfig {
    /// Deadline for one execution request, tool calls included.
    pub execute_timeout_secs: u64,

    /// Sub-query ceiling per worker lifetime.
    pub max_llm_calls: usize,

    /// Deadline for one sub-query.
    pub subquery_timeout_secs: u64,

    /// Thread cap for a batched sub-query (at most 8).
    pub max_batch_workers: usize,

    /// Stdout longer than this many characters is summarized.
    pub stdout_limit_chars: usize,

    /// Characters of stdout kept in a summary.
    pub stdout_preview_chars: usize,

    /// Bytes of worker stderr kept for exit diagnostics.
    pub stderr_tail_bytes: usize,

    pub worker: WorkerConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command that starts a worker. Empty means the `rlm-worker` binary next
    /// to `rlm`.
    pub command: Vec<String>,

    /// Directory exposed to the storage helpers.
    pub storage_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Command that answers a prompt on stdin (e.g. `["llm", "-m", "gpt-4o-mini"]`).
    pub command: Vec<String>,

    /// Kill the backend command after this many seconds.
    pub timeout_secs: u64,

    /// Truncate backend output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            execute_timeout_secs: 180,
            max_llm_calls: 50,
            subquery_timeout_secs: 120,
            max_batch_workers: MAX_BATCH_WORKERS,
            stdout_limit_chars: 10_000,
            stdout_preview_chars: 500,
            stderr_tail_bytes: 4_000,
            worker: WorkerConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl RlmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.execute_timeout_secs == 0 {
            return Err(anyhow!("execute_timeout_secs must be > 0"));
        }
        if self.subquery_timeout_secs == 0 {
            return Err(anyhow!("subquery_timeout_secs must be > 0"));
        }
        if self.max_batch_workers == 0 || self.max_batch_workers > MAX_BATCH_WORKERS {
            return Err(anyhow!(
                "max_batch_workers must be between 1 and {MAX_BATCH_WORKERS}"
            ));
        }
        if self.stdout_limit_chars == 0 {
            return Err(anyhow!("stdout_limit_chars must be > 0"));
        }
        if self.stdout_preview_chars > self.stdout_limit_chars {
            return Err(anyhow!(
                "stdout_preview_chars must not exceed stdout_limit_chars"
            ));
        }
        if self.stderr_tail_bytes == 0 {
            return Err(anyhow!("stderr_tail_bytes must be > 0"));
        }
        if self
            .worker
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("worker.command must start with a program"));
        }
        if self.backend.command.is_empty() || self.backend.command[0].trim().is_empty() {
            return Err(anyhow!("backend.command must be a non-empty array"));
        }
        if self.backend.timeout_secs == 0 {
            return Err(anyhow!("backend.timeout_secs must be > 0"));
        }
        if self.backend.output_limit_bytes == 0 {
            return Err(anyhow!("backend.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RlmConfig::default()`.
pub fn load_config(path: &Path) -> Result<RlmConfig> {
    if !path.exists() {
        let cfg = RlmConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RlmConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RlmConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RlmConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rlm.toml");
        let mut cfg = RlmConfig::default();
        cfg.worker.storage_root = Some(temp.path().join("store"));
        cfg.backend.command = vec!["llm".into(), "-m".into(), "small".into()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("rlm.toml");
        fs::write(&path, "max_llm_calls = 5\n[backend]\ntimeout_secs = 9\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_llm_calls, 5);
        assert_eq!(cfg.backend.timeout_secs, 9);
        assert_eq!(cfg.backend.command, vec!["llm".to_string()]);
        assert_eq!(cfg.execute_timeout_secs, 180);
    }

    #[test]
    fn validate_rejects_bad_limits() {
        let cfg = RlmConfig {
            max_batch_workers: 9,
            ..RlmConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = RlmConfig {
            stdout_preview_chars: 20_000,
            ..RlmConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = RlmConfig::default();
        cfg.backend.command.clear();
        assert!(cfg.validate().is_err());
    }
}
