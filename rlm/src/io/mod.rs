//! Side-effecting collaborators: configuration files, child processes and the
//! reasoning backend.

pub mod backend;
pub mod config;
pub mod process;
