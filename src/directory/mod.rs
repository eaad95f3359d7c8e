//! App directory abstraction.
//!
//! Git URLs carry a user-facing app name; the repository cache is keyed by
//! the app's stable ID.  The [`AppDirectory`] trait resolves one to the
//! other so the HTTP layer does not depend on how the lookup is done.

pub mod controller;

use std::fmt;

use anyhow::Result;

pub use controller::ControllerDirectory;

/// Stable identifier of an app, used as the repository cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves app names to [`AppId`]s.
#[async_trait::async_trait]
pub trait AppDirectory: Send + Sync {
    /// Look up `name`.  `Ok(None)` means the app does not exist; `Err` means
    /// the lookup itself failed.
    async fn lookup(&self, name: &str) -> Result<Option<AppId>>;
}
