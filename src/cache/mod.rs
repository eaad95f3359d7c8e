//! Repository materialization for git requests.
//!
//! A [`RepoCache`] turns an app ID into a [`WorkingRepo`] (restored from the
//! blob store or freshly initialised, with the pre-receive hook installed)
//! and uploads the repository store again after a push.

pub mod archive;
pub mod hook;
pub mod manager;

pub use manager::{RepoCache, WorkingRepo};
