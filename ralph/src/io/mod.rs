//! Side-effecting operations: filesystem state, child processes, git.

pub mod agent;
pub mod atomic;
pub mod backlog_store;
pub mod config;
pub mod git;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod publisher;
pub mod registry;
pub mod supervisor;
