//! Execution profiles gating which convenience helpers evaluated code may use.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Closed set of profiles a request can run under.
///
/// `Root` is the top-level orchestration profile and stays minimal: the text
/// and storage helpers refuse to run there so heavy lifting is pushed into
/// sub-queries. `Delegate` and `Maintenance` get the full toolbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProfile {
    #[default]
    Root,
    Delegate,
    Maintenance,
}

impl ExecutionProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionProfile::Root => "root",
            ExecutionProfile::Delegate => "delegate",
            ExecutionProfile::Maintenance => "maintenance",
        }
    }

    /// Whether profile-gated helpers may run.
    pub fn allows_helpers(self) -> bool {
        !matches!(self, ExecutionProfile::Root)
    }

    /// Message raised when `helper` is called under a profile that forbids it.
    pub fn helper_denied_message(self, helper: &str) -> String {
        format!(
            "{helper}() is not available in the {} profile; delegate this work with llm_query or llm_query_batched",
            self.as_str()
        )
    }
}

impl fmt::Display for ExecutionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "root" => Ok(ExecutionProfile::Root),
            "delegate" => Ok(ExecutionProfile::Delegate),
            "maintenance" => Ok(ExecutionProfile::Maintenance),
            other => Err(anyhow!(
                "unknown profile {other:?} (expected root, delegate or maintenance)"
            )),
        }
    }
}
