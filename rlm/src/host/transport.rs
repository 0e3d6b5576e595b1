//! How the host obtains a worker.
//!
//! [`WorkerLauncher`] hides whether the worker is a child process
//! ([`crate::io::process::ProcessLauncher`]) or something in-process used by
//! tests. The controller only ever sees the three byte streams and a handle.

use std::io::{Read, Write};

use anyhow::Result;

/// Control over a running worker.
pub trait WorkerHandle: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Stop the worker. Must not block indefinitely and must be safe to call
    /// more than once.
    fn terminate(&mut self);
}

/// A freshly launched worker.
pub struct WorkerStreams {
    /// Request lines and tool replies go here.
    pub stdin: Box<dyn Write + Send>,
    /// Tool calls and responses come from here.
    pub stdout: Box<dyn Read + Send>,
    /// Diagnostics; drained into a bounded tail.
    pub stderr: Option<Box<dyn Read + Send>>,
    pub handle: Box<dyn WorkerHandle>,
}

/// Abstraction over worker backends.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> Result<WorkerStreams>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String {
        "worker".to_string()
    }
}
