use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use tracing::{debug, instrument};

/// HTTP client for the blob store that keeps one tar snapshot per app.
///
/// Snapshots live at `<base>/repos/<key>.tar`.  There is no versioning or
/// conditional request support: the last PUT wins.
#[derive(Debug, Clone)]
pub struct BlobStore {
    client: reqwest::Client,
    base_url: String,
}

impl BlobStore {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// URL of the snapshot stored under `key`.
    pub fn snapshot_url(&self, key: &str) -> String {
        format!("{}/repos/{key}.tar", self.base_url)
    }

    /// Start downloading the snapshot for `key`.
    ///
    /// Returns `None` when the store has no snapshot yet (404).  Any other
    /// non-200 status is an error.  The body is left unread so the caller can
    /// stream it.
    #[instrument(skip(self))]
    pub async fn fetch(&self, key: &str) -> Result<Option<reqwest::Response>> {
        let url = self.snapshot_url(key);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("blobstore GET {url}"))?;

        match resp.status() {
            StatusCode::OK => {
                debug!(content_length = ?resp.content_length(), "snapshot found");
                Ok(Some(resp))
            }
            StatusCode::NOT_FOUND => {
                debug!("no snapshot stored yet");
                Ok(None)
            }
            status => bail!("unexpected error {status} retrieving cached repo"),
        }
    }

    /// Replace the snapshot for `key` with a streamed request body.
    #[instrument(skip(self, body))]
    pub async fn upload_stream(&self, key: &str, body: reqwest::Body) -> Result<()> {
        let url = self.snapshot_url(key);
        let resp = self
            .client
            .put(&url)
            .body(body)
            .send()
            .await
            .with_context(|| format!("blobstore PUT {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("blobstore PUT {url} returned {status}");
        }
        debug!(%status, "snapshot uploaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
