//! The worker side of the execution protocol.
//!
//! A worker is a long-lived process that owns one [`session::SessionState`]
//! and serves requests sequentially over stdin/stdout. Nothing in here is
//! `Send`; the whole loop runs on one thread.

pub mod channel;
pub mod driver;
pub mod evaluate;
pub mod helpers;
pub mod session;
pub mod storage;

pub use driver::WorkerLoop;
