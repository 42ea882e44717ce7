//! Pure, deterministic logic shared by the loop.
//!
//! Core modules never touch the filesystem, spawn processes, or talk to the
//! network. They operate on in-memory data structures; the one impurity is
//! [`session::now`], which reads the wall clock to stamp lifecycle changes.

pub mod backlog;
pub mod session;
pub mod types;
