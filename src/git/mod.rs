//! Git subprocess plumbing.
//!
//! Everything here shells out to the system `git` binary.  Long-running
//! protocol processes are wrapped in a [`GitProcess`] so their whole process
//! group is torn down with the request that started them.

pub mod commands;
pub mod process;

pub use commands::{Rpc, git_init, spawn_stateless_rpc};
pub use process::GitProcess;
