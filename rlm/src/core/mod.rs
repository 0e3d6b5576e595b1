//! Deterministic, pure logic shared by the worker and the host.
//!
//! Core modules must be free of I/O side effects. They define the wire
//! protocol, payload normalization, budgets and output hygiene, and are
//! testable in isolation.

pub mod budget;
pub mod final_output;
pub mod hygiene;
pub mod profile;
pub mod protocol;
pub mod registry;
