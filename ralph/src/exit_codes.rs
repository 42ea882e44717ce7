//! Stable exit codes for ralph CLI commands.

/// Command succeeded. A run that stops on its iteration cap or is
/// interrupted still exits with this code.
pub const OK: i32 = 0;
/// Unexpected failure (I/O, corrupt registry, bad config).
pub const FAILED: i32 = 1;
/// The run never started: not in a project, no backlog, already running, or
/// the agent binary is missing.
pub const SETUP_FAILED: i32 = 2;
