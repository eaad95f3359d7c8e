//! Git command wrappers using [`tokio::process::Command`].
//!
//! `git init` runs to completion and reports stderr on failure.  The
//! stateless-RPC services are long-lived protocol processes and are started
//! through [`GitProcess`] instead.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::process::GitProcess;

/// Environment variable through which the pre-receive hook learns which app
/// it is deploying.
pub const RECEIVE_APP_ENV: &str = "RECEIVE_APP";

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// The two smart-protocol services `git` can run as a stateless RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rpc {
    UploadPack,
    ReceivePack,
}

impl Rpc {
    /// Parse a `service=` value such as `git-upload-pack`.
    pub fn from_service(service: &str) -> Option<Self> {
        match service {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// Wire name, e.g. `git-upload-pack`.
    pub fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// `git` subcommand, e.g. `upload-pack`.
    pub fn subcommand(self) -> &'static str {
        self.name().trim_start_matches("git-")
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Run `git init` inside `path`.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn git_init(path: &Path) -> Result<()> {
    let output = Command::new("git")
        .arg("init")
        .current_dir(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("empty repository initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Stateless RPC
// ---------------------------------------------------------------------------

/// Start `git <rpc> --stateless-rpc [--advertise-refs] <repo_path>` for `app`.
///
/// Ref advertisements read nothing from the client, so only the full RPC
/// gets a stdin pipe.
#[instrument(skip_all, fields(rpc = rpc.name(), repo = %repo_path.display(), %app))]
pub fn spawn_stateless_rpc(
    rpc: Rpc,
    repo_path: &Path,
    app: &str,
    advertise_refs: bool,
) -> Result<GitProcess> {
    let mut args: Vec<&OsStr> = vec![
        OsStr::new(rpc.subcommand()),
        OsStr::new("--stateless-rpc"),
    ];
    if advertise_refs {
        args.push(OsStr::new("--advertise-refs"));
    }
    args.push(repo_path.as_os_str());

    GitProcess::start("git", args, &[(RECEIVE_APP_ENV, app)], !advertise_refs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
