//! Tar encoding of working repositories.
//!
//! A snapshot holds the repository store only: every path under `.git/`,
//! directories included so that empty `refs/` trees survive.  Whatever the
//! pre-receive hook checked out next to it is rebuilt from the store on the
//! next deploy and is left out.  Paths inside the archive are relative to
//! the working directory.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the repository store directory inside a working repository.
pub const GIT_DIR: &str = ".git";

/// Whether `rel` (relative to the working directory) belongs in a snapshot.
pub fn is_repository_path(rel: &Path) -> bool {
    matches!(rel.components().next(), Some(Component::Normal(first)) if first == GIT_DIR)
}

/// Write a tar archive of the repository store under `root` into `writer`.
///
/// Entries are emitted in sorted order; symlinks are stored as links.
/// Returns the writer once the archive trailer has been written.
pub fn pack_repository<W: Write>(root: &Path, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let mut stack = vec![PathBuf::new()];
    while let Some(rel_dir) = stack.pop() {
        let abs_dir = root.join(&rel_dir);
        let mut entries = std::fs::read_dir(&abs_dir)
            .with_context(|| format!("failed to read directory {}", abs_dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("failed to list directory {}", abs_dir.display()))?;
        entries.sort_by_key(|e| e.file_name());

        // Children are pushed in reverse so they pop in sorted order.
        for entry in entries.into_iter().rev() {
            let rel = rel_dir.join(entry.file_name());
            if !is_repository_path(&rel) {
                continue;
            }
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {}", rel.display()))?;
            builder
                .append_path_with_name(entry.path(), &rel)
                .with_context(|| format!("failed to archive {}", rel.display()))?;
            if file_type.is_dir() {
                stack.push(rel);
            }
        }
    }

    builder
        .into_inner()
        .context("failed to finish tar archive")
}

/// Unpack a snapshot read from `reader` into `dest`.
///
/// Entries that would escape `dest` are refused by the `tar` crate.
pub fn unpack_repository<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .with_context(|| format!("failed to unpack snapshot into {}", dest.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn sample_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(GIT_DIR);
        fs::create_dir_all(git.join("refs/heads")).unwrap();
        fs::create_dir_all(git.join("objects/ab")).unwrap();
        fs::create_dir_all(git.join("hooks")).unwrap();
        fs::write(git.join("HEAD"), "ref: refs/heads/master\n").unwrap();
        fs::write(git.join("objects/ab/cdef"), b"\x78\x01blob").unwrap();
        fs::write(git.join("hooks/pre-receive"), "#!/bin/sh\n").unwrap();
        fs::write(dir.path().join("README.md"), "checked out").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.go"), "package main").unwrap();
        dir
    }

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut ar = tar::Archive::new(archive);
        ar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn repository_path_filter() {
        assert!(is_repository_path(Path::new(".git")));
        assert!(is_repository_path(Path::new(".git/objects/ab/cdef")));
        assert!(!is_repository_path(Path::new(".gitignore")));
        assert!(!is_repository_path(Path::new("README.md")));
        assert!(!is_repository_path(Path::new("vendor/lib/.git/HEAD")));
        assert!(!is_repository_path(Path::new(".github/workflows/ci.yml")));
    }

    #[test]
    fn archive_holds_only_the_repository_store() {
        let repo = sample_repo();
        let bytes = pack_repository(repo.path(), Vec::new()).unwrap();
        let names = entry_names(&bytes);

        assert!(names.iter().any(|n| n.trim_end_matches('/') == ".git"));
        assert!(names.iter().any(|n| n == ".git/HEAD"));
        assert!(names.iter().any(|n| n.trim_end_matches('/') == ".git/refs/heads"));
        assert!(names.iter().all(|n| n.starts_with(".git")));
        assert!(!names.iter().any(|n| n.contains("README")));
    }

    #[test]
    fn archive_order_is_stable() {
        let repo = sample_repo();
        let a = entry_names(&pack_repository(repo.path(), Vec::new()).unwrap());
        let b = entry_names(&pack_repository(repo.path(), Vec::new()).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn unpack_restores_store_and_empty_dirs() {
        let repo = sample_repo();
        let bytes = pack_repository(repo.path(), Vec::new()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack_repository(&bytes[..], dest.path()).unwrap();

        let git = dest.path().join(GIT_DIR);
        assert_eq!(
            fs::read_to_string(git.join("HEAD")).unwrap(),
            "ref: refs/heads/master\n"
        );
        assert_eq!(fs::read(git.join("objects/ab/cdef")).unwrap(), b"\x78\x01blob");
        assert!(git.join("refs/heads").is_dir());
        assert!(!dest.path().join("README.md").exists());
        assert!(!dest.path().join("src").exists());
    }

    #[test]
    fn unpack_rejects_garbage() {
        let dest = tempfile::tempdir().unwrap();
        let garbage = vec![0xffu8; 1024];
        assert!(unpack_repository(&garbage[..], dest.path()).is_err());
    }
}
