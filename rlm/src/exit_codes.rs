//! Stable exit codes for the `rlm` and `rlm-worker` binaries.

/// Command succeeded.
pub const OK: u8 = 0;
/// Command failed for any other reason.
pub const FAILED: u8 = 1;
/// `rlm exec` hit the execution timeout; the worker was terminated.
pub const TIMEOUT: u8 = 2;
/// The worker exited before answering a request.
pub const WORKER_EXITED: u8 = 3;
