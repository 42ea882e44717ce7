//! Autonomous multi-iteration coding loop runner.
//!
//! A project keeps a backlog of work items in `.ralph/prd.json`. `ralph run`
//! repeatedly invokes a coding agent against that backlog until every item
//! passes, the iteration cap is reached, or the user interrupts. The layout
//! follows a strict split:
//!
//! - **[`core`]**: Pure data and state transitions (backlog, session records).
//!   No filesystem, process, or network access.
//! - **[`io`]**: Side effects (files, registry, child processes, git).
//!
//! [`looping`] orchestrates the two; [`signals`] turns SIGINT/SIGTERM into
//! cancellation of a running loop.

pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod signals;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
