//! The pre-receive hook installed into every working repository.
//!
//! The hook runs inside `git receive-pack`, not inside this service.  For a
//! push to `refs/heads/master` it checks the new revision out next to the
//! repository store (submodules included), tars the tree without VCS
//! metadata and pipes it into `/bin/flynn-receiver "$RECEIVE_APP" "$newrev"`.
//! The receiver's output is relayed to the pushing client with each line
//! prefixed by `ESC[1G ESC[K` so progress lines overwrite in place.  Pushes to
//! other refs are ignored.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::archive::GIT_DIR;

pub const PRE_RECEIVE_HOOK: &str = r#"#!/bin/bash
set -eo pipefail;
git-archive-all() {
	GIT_DIR="$(pwd)"
	cd ..
	git checkout --force --quiet $1
	git submodule --quiet update --init --recursive
	tar --create --exclude-vcs .
}
while read oldrev newrev refname; do
	[[ $refname = "refs/heads/master" ]] && git-archive-all $newrev | /bin/flynn-receiver "$RECEIVE_APP" "$newrev" | sed -u "s/^/"$'\e[1G\e[K'"/"
done
"#;

/// Location of the pre-receive hook inside the working repository at `repo`.
pub fn hook_path(repo: &Path) -> PathBuf {
    repo.join(GIT_DIR).join("hooks").join("pre-receive")
}

/// Write [`PRE_RECEIVE_HOOK`] into `repo` with mode 0755, replacing any hook
/// that came with a snapshot.
pub async fn install_hook(repo: &Path) -> Result<()> {
    write_hook(repo, PRE_RECEIVE_HOOK).await
}

async fn write_hook(repo: &Path, script: &str) -> Result<()> {
    let path = hook_path(repo);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create hooks dir {}", parent.display()))?;
    }
    tokio::fs::write(&path, script)
        .await
        .with_context(|| format!("failed to write hook {}", path.display()))?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("failed to chmod hook {}", path.display()))?;

    debug!(path = %path.display(), "pre-receive hook installed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::git::commands::tests::{git_available, push_request, run_git};
    use crate::git::{Rpc, git_init, spawn_stateless_rpc};

    const RELAY_PREFIX: &str = "\x1b[1G\x1b[K";

    /// A receiver stand-in that records its arguments and stdin under `dir`.
    struct StubReceiver {
        dir: tempfile::TempDir,
    }

    impl StubReceiver {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let script = format!(
                "#!/bin/sh\nprintf '%s\\n' \"$*\" > '{root}/args'\ncat > '{root}/stdin.tar'\necho \"deployed $1\"\n",
                root = dir.path().display()
            );
            let path = dir.path().join("receiver");
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir }
        }

        /// The production hook, pointed at this stub.
        fn hook(&self) -> String {
            let path = self.dir.path().join("receiver");
            PRE_RECEIVE_HOOK.replace("/bin/flynn-receiver", &path.display().to_string())
        }

        fn args(&self) -> String {
            std::fs::read_to_string(self.dir.path().join("args")).unwrap()
        }

        fn tar_entries(&self) -> Vec<String> {
            let bytes = std::fs::read(self.dir.path().join("stdin.tar")).unwrap();
            let mut archive = tar::Archive::new(&bytes[..]);
            archive
                .entries()
                .unwrap()
                .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
                .collect()
        }
    }

    /// The hook is a bash script that shells out to GNU tar.
    fn hook_runnable() -> bool {
        let gnu_tar = std::process::Command::new("tar")
            .arg("--version")
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains("GNU tar"))
            .unwrap_or(false);
        git_available() && Path::new("/bin/bash").exists() && gnu_tar
    }

    #[test]
    fn hook_targets_master_and_receiver() {
        assert!(PRE_RECEIVE_HOOK.starts_with("#!/bin/bash\n"));
        assert!(PRE_RECEIVE_HOOK.contains(r#"[[ $refname = "refs/heads/master" ]]"#));
        assert!(PRE_RECEIVE_HOOK.contains(r#"/bin/flynn-receiver "$RECEIVE_APP" "$newrev""#));
        assert!(PRE_RECEIVE_HOOK.contains(r#"$'\e[1G\e[K'"#));
        assert!(PRE_RECEIVE_HOOK.contains("tar --create --exclude-vcs ."));
    }

    #[tokio::test]
    async fn install_creates_executable_hook() {
        let repo = tempfile::tempdir().unwrap();
        install_hook(repo.path()).await.unwrap();

        let path = hook_path(repo.path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), PRE_RECEIVE_HOOK);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn install_replaces_existing_hook() {
        let repo = tempfile::tempdir().unwrap();
        let path = hook_path(repo.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        install_hook(repo.path()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), PRE_RECEIVE_HOOK);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn hook_hands_checked_out_tree_to_receiver() {
        if !hook_runnable() {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        run_git(repo.path(), &["init", "--quiet"]);
        std::fs::write(repo.path().join("Procfile"), "web: ./server\n").unwrap();
        run_git(repo.path(), &["add", "Procfile"]);
        run_git(
            repo.path(),
            &["-c", "commit.gpgsign=false", "commit", "--quiet", "-m", "app"],
        );
        let sha = String::from_utf8(run_git(repo.path(), &["rev-parse", "HEAD"])).unwrap();
        let sha = sha.trim();

        let receiver = StubReceiver::new();
        write_hook(repo.path(), &receiver.hook()).await.unwrap();

        // Hooks run from inside the repository store.
        let mut hook = tokio::process::Command::new(hook_path(repo.path()))
            .current_dir(repo.path().join(GIT_DIR))
            .env("RECEIVE_APP", "app-1")
            .env_remove("GIT_DIR")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let zero = "0".repeat(40);
        let mut stdin = hook.stdin.take().unwrap();
        stdin
            .write_all(format!("{zero} {sha} refs/heads/master\n").as_bytes())
            .await
            .unwrap();
        drop(stdin);
        let out = hook.wait_with_output().await.unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

        assert_eq!(receiver.args(), format!("app-1 {sha}\n"));
        let entries = receiver.tar_entries();
        assert!(entries.iter().any(|e| e.trim_start_matches("./") == "Procfile"), "{entries:?}");
        assert!(!entries.iter().any(|e| e.contains(".git")), "{entries:?}");

        let stdout = String::from_utf8(out.stdout).unwrap();
        assert_eq!(stdout, format!("{RELAY_PREFIX}deployed app-1\n"));
    }

    #[tokio::test]
    async fn receive_pack_runs_hook_with_app_and_revision() {
        if !hook_runnable() {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        git_init(repo.path()).await.unwrap();
        let receiver = StubReceiver::new();
        write_hook(repo.path(), &receiver.hook()).await.unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let (sha, body) = push_request(scratch.path(), "refs/heads/master", "report-status");

        let mut git = spawn_stateless_rpc(Rpc::ReceivePack, repo.path(), "app-1", false).unwrap();
        let mut output = git.take_output().unwrap();
        let mut stdin = git.take_stdin().unwrap();
        stdin.write_all(&body).await.unwrap();
        drop(stdin);
        let mut relayed = Vec::new();
        output.read_to_end(&mut relayed).await.unwrap();
        // Whether the ref update is accepted depends on the git version
        // (checkout inside the push quarantine); the hook ran either way.
        let _ = git.wait().await;

        assert_eq!(receiver.args(), format!("app-1 {sha}\n"));
        let relayed = String::from_utf8_lossy(&relayed);
        assert!(
            relayed.contains(&format!("{RELAY_PREFIX}deployed app-1\n")),
            "output: {relayed:?}"
        );
    }

    #[tokio::test]
    async fn hook_rejects_pushes_to_other_branches() {
        if !hook_runnable() {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        git_init(repo.path()).await.unwrap();
        let receiver = StubReceiver::new();
        write_hook(repo.path(), &receiver.hook()).await.unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let (_, body) = push_request(scratch.path(), "refs/heads/feature", "report-status");

        let mut git = spawn_stateless_rpc(Rpc::ReceivePack, repo.path(), "app-1", false).unwrap();
        let mut output = git.take_output().unwrap();
        let mut stdin = git.take_stdin().unwrap();
        stdin.write_all(&body).await.unwrap();
        drop(stdin);
        let mut relayed = Vec::new();
        output.read_to_end(&mut relayed).await.unwrap();
        let _ = git.wait().await;

        // The receiver never runs, and the loop's failed test declines the ref.
        assert!(!receiver.dir.path().join("args").exists());
        let relayed = String::from_utf8_lossy(&relayed);
        assert!(
            relayed.contains("ng refs/heads/feature pre-receive hook declined"),
            "output: {relayed:?}"
        );
    }
}
