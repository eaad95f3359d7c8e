//! Process-group-scoped subprocess handle.
//!
//! `git` forks helpers of its own (pack-objects, hooks, whatever the hooks
//! run), so killing only the direct child would leave orphans behind.  Every
//! [`GitProcess`] is therefore started as the leader of a fresh process group,
//! and releasing the handle signals the whole group and reaps the leader in
//! the background.  Release happens on every exit path: explicitly through
//! [`GitProcess::cleanup`] or implicitly on drop.

use std::ffi::OsStr;
use std::os::fd::OwnedFd;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

/// A running subprocess and the resources that belong to it.
pub struct GitProcess {
    program: String,
    child: Option<Child>,
    pgid: Option<Pid>,
    /// Read end of the pipe shared by the child's stdout and stderr.
    output: Option<pipe::Receiver>,
    stdin: Option<ChildStdin>,
}

impl GitProcess {
    /// Launch `program` with `args` in a new process group.
    ///
    /// The child inherits this process's environment plus `env`.  Its stdout
    /// and stderr share a single pipe, readable through
    /// [`take_output`](Self::take_output).  With `with_stdin` the child's
    /// stdin is a pipe (see [`take_stdin`](Self::take_stdin)); otherwise it is
    /// `/dev/null`.
    pub fn start<I, S>(
        program: &str,
        args: I,
        env: &[(&str, &str)],
        with_stdin: bool,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (reader, writer) = std::io::pipe().context("failed to create output pipe")?;
        let stderr = writer
            .try_clone()
            .context("failed to duplicate output pipe")?;

        let child = {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .envs(env.iter().copied())
                .stdin(if with_stdin {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::from(writer))
                .stderr(Stdio::from(stderr))
                .process_group(0);
            cmd.spawn()
                .with_context(|| format!("failed to spawn {program}"))?
            // `cmd` drops here, closing our copies of the pipe's write end so
            // the reader sees EOF once the process group is done with it.
        };

        let mut process = Self {
            program: program.to_string(),
            pgid: child.id().map(|id| Pid::from_raw(id as i32)),
            child: Some(child),
            output: None,
            stdin: None,
        };
        process.stdin = process.child.as_mut().and_then(|c| c.stdin.take());
        process.output = Some(
            pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
                .context("failed to register output pipe")?,
        );

        debug!(program, pgid = ?process.pgid, "subprocess started");
        Ok(process)
    }

    /// Take the combined stdout/stderr stream.
    pub fn take_output(&mut self) -> Option<pipe::Receiver> {
        self.output.take()
    }

    /// Take the stdin pipe, if the process was started with one.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Wait for the process to exit.
    ///
    /// Closes any stdin still held by the handle first.  A non-zero or
    /// signalled exit is returned as an error.
    pub async fn wait(&mut self) -> Result<()> {
        self.stdin.take();
        let child = self
            .child
            .as_mut()
            .with_context(|| format!("{} was already cleaned up", self.program))?;
        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait on {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }

    /// Terminate the process group and reap the leader without blocking.
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub fn cleanup(&mut self) {
        self.stdin.take();
        self.output.take();
        let Some(mut child) = self.child.take() else {
            return;
        };

        // The leader may already be reaped by `wait`, but helpers it left
        // behind keep the group, and with it the ID, alive.  Once the group is
        // empty the ID is free for reuse, so a late call could in principle
        // reach an unrelated group that took it; that window is accepted.
        if let Some(pgid) = self.pgid.take() {
            match killpg(pgid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(
                    program = %self.program,
                    %pgid,
                    error = %e,
                    "failed to signal process group"
                ),
            }
        }

        let program = self.program.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match child.wait().await {
                        Ok(status) => debug!(%program, %status, "subprocess reaped"),
                        Err(e) => warn!(%program, error = %e, "failed to reap subprocess"),
                    }
                });
            }
            Err(_) => {
                // No runtime to reap on; tokio's orphan queue picks it up.
                let _ = child.try_wait();
            }
        }
    }
}

impl Drop for GitProcess {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
