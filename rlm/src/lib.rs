//! Persistent code-execution worker with host tool calls and budgeted
//! sub-queries.
//!
//! A host hands code to a long-lived worker process over newline-delimited
//! JSON. The worker keeps its session state between requests, can suspend
//! mid-evaluation to call host tools, and signals a final answer explicitly or
//! implicitly. The crate is split the usual way:
//!
//! - **[`core`]**: Pure logic (wire types, final-output normalization, budget,
//!   registry, output hygiene). No I/O.
//! - **[`io`]**: Side effects (config files, child processes, the reasoning
//!   backend).
//! - **[`worker`]**: The worker loop and evaluation engine (`rlm-worker`).
//! - **[`host`]**: The controller, tool bridge and sub-query limiter (`rlm`).
//! - **[`stream`]**: Translation of planner streams into presentation events.

pub mod core;
pub mod exit_codes;
pub mod host;
pub mod io;
pub mod logging;
pub mod stream;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
