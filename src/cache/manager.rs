//! Per-request working repositories backed by blob-store snapshots.
//!
//! Every git request gets a fresh temporary directory.  It is filled from the
//! app's snapshot (or `git init` when there is none), gets the current
//! pre-receive hook, and is removed when the request ends.  After a push the
//! repository store is tarred and streamed back to the blob store; archiving
//! and uploading overlap through a bounded in-process channel.
//!
//! Concurrent pushes to the same app are not serialised here: both download
//! the same snapshot and the last upload wins.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures::TryStreamExt;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, instrument};

use super::{archive, hook};
use crate::git;
use crate::storage::BlobStore;

/// Capacity of the write buffer in front of the upload channel.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight between the archiver and the upload body.
const UPLOAD_CHANNEL_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// WorkingRepo
// ---------------------------------------------------------------------------

/// A materialized repository owned by exactly one request.
///
/// The directory is removed by [`discard`](Self::discard) or, failing that,
/// when the value is dropped.
#[derive(Debug)]
pub struct WorkingRepo {
    key: String,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl WorkingRepo {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cache key (app ID) the repository was materialized for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the directory.  Later calls are no-ops.
    pub async fn discard(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .context("remove task panicked")?
            .with_context(|| format!("failed to remove {}", self.path.display()))?;
        debug!(path = %self.path.display(), "working repository removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RepoCache
// ---------------------------------------------------------------------------

/// Materializes and persists working repositories.
#[derive(Debug, Clone)]
pub struct RepoCache {
    store: BlobStore,
    tmp_dir: Option<PathBuf>,
}

impl RepoCache {
    pub fn new(store: BlobStore, tmp_dir: Option<PathBuf>) -> Self {
        Self { store, tmp_dir }
    }

    /// Create a working repository for `key`.
    ///
    /// A stored snapshot is streamed and unpacked; a 404 from the store means
    /// a new, empty repository.  Either way the pre-receive hook is written
    /// last.  Any failure removes the directory again.
    #[instrument(skip(self))]
    pub async fn prepare(&self, key: &str) -> Result<WorkingRepo> {
        let prefix = format!("repo-{key}");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.tmp_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .context("failed to create working directory")?;

        let repo = WorkingRepo {
            key: key.to_string(),
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        };

        match self.store.fetch(key).await? {
            Some(resp) => {
                unpack_snapshot(resp, repo.path()).await?;
                debug!("working repository restored from snapshot");
            }
            None => {
                git::git_init(repo.path()).await?;
                debug!("working repository initialised empty");
            }
        }
        hook::install_hook(repo.path()).await?;

        Ok(repo)
    }

    /// Upload the repository store of `repo` as the new snapshot for its key.
    ///
    /// Errors from the archiving side and the upload side are combined.
    #[instrument(skip_all, fields(key = %repo.key()))]
    pub async fn persist(&self, repo: &WorkingRepo) -> Result<()> {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(UPLOAD_CHANNEL_DEPTH);
        let root = repo.path().to_path_buf();

        let archiver = tokio::task::spawn_blocking(move || -> Result<()> {
            let writer =
                io::BufWriter::with_capacity(UPLOAD_CHUNK_SIZE, ChunkWriter { tx: tx.clone() });
            let packed = archive::pack_repository(&root, writer).and_then(|mut w| {
                w.flush().context("failed to flush archive")?;
                Ok(())
            });
            if let Err(e) = &packed {
                // Fail the request body so a truncated tarball is never
                // accepted as a snapshot.
                let _ = tx.blocking_send(Err(io::Error::other(format!("{e:#}"))));
            }
            packed
        });

        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
        let uploaded = self.store.upload_stream(repo.key(), body).await;
        let archived = archiver
            .await
            .map_err(|e| anyhow!("archive task panicked: {e}"))
            .and_then(|r| r);

        combine(archived, uploaded)?;
        info!("repository snapshot uploaded");
        Ok(())
    }
}

/// Stream an HTTP snapshot body into `dest` without buffering it whole.
async fn unpack_snapshot(resp: reqwest::Response, dest: &Path) -> Result<()> {
    let stream = Box::pin(resp.bytes_stream().map_err(io::Error::other));
    let reader = SyncIoBridge::new(StreamReader::new(stream));
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || archive::unpack_repository(reader, &dest))
        .await
        .context("unpack task panicked")?
}

fn combine(archived: Result<()>, uploaded: Result<()>) -> Result<()> {
    match (archived, uploaded) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) => Err(e.context("failed to archive repository")),
        (Ok(()), Err(e)) => Err(e.context("failed to upload repository")),
        (Err(a), Err(u)) => Err(anyhow!(
            "failed to archive repository: {a:#}; failed to upload repository: {u:#}"
        )),
    }
}

/// Blocking writer that forwards each write as one chunk of the upload body.
struct ChunkWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload body closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
