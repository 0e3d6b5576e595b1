//! The host side of the execution protocol.
//!
//! [`controller::HostController`] owns one worker at a time. Tool calls from the
//! worker are resolved by [`bridge::ToolBridge`]; sub-queries go through
//! [`limiter::SubQueryLimiter`], which runs backend calls on
//! [`pool::WorkerPool`] threads under a shared call budget.

pub mod bridge;
pub mod controller;
pub mod limiter;
pub mod pool;
pub mod reader;
pub mod transport;

pub use controller::{
    ControllerError, ControllerSettings, ExecuteOptions, ExecutionOutput, HostController, Variables,
};
