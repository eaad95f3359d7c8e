//! App lookup against the controller HTTP API.

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{AppDirectory, AppId};
use crate::auth::SharedSecret;

/// The subset of the controller's app record this service needs.
#[derive(Debug, Deserialize)]
struct AppRecord {
    id: String,
}

/// [`AppDirectory`] backed by `GET <controller>/apps/<name>`.
///
/// Requests authenticate with HTTP Basic: empty user name, the shared secret
/// as password.
pub struct ControllerDirectory {
    http_client: reqwest::Client,
    base_url: String,
    key: SharedSecret,
}

impl ControllerDirectory {
    pub fn new(http_client: reqwest::Client, base_url: &str, key: SharedSecret) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        }
    }
}

#[async_trait::async_trait]
impl AppDirectory for ControllerDirectory {
    #[instrument(skip(self))]
    async fn lookup(&self, name: &str) -> Result<Option<AppId>> {
        let url = format!("{}/apps/{name}", self.base_url);
        let resp = self
            .http_client
            .get(&url)
            .basic_auth("", Some(self.key.reveal()))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .with_context(|| format!("controller GET {url}"))?;

        match resp.status() {
            StatusCode::OK => {
                let app: AppRecord = resp
                    .json()
                    .await
                    .context("failed to decode controller app record")?;
                debug!(app_id = %app.id, "app resolved");
                Ok(Some(AppId::new(app.id)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => bail!("controller GET {url} returned {status}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
