use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Liveness path answered without auth or repository work.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub blobstore: BlobstoreConfig,
    #[serde(default)]
    pub repos: RepoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            health_path: default_health_path(),
            auth: AuthConfig::default(),
            controller: ControllerConfig::default(),
            blobstore: BlobstoreConfig::default(),
            repos: RepoConfig::default(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_health_path() -> String {
    "/.well-known/status".to_string()
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Name of the environment variable that holds the shared secret.
    ///
    /// The same secret authenticates git clients (as the HTTP Basic
    /// password) and this service against the controller.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
        }
    }
}

fn default_secret_env() -> String {
    "CONTROLLER_KEY".to_string()
}

// ---------------------------------------------------------------------------
// Controller (app directory)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Base URL of the controller API that resolves app names.
    #[serde(default = "default_controller_url")]
    pub url: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: default_controller_url(),
        }
    }
}

fn default_controller_url() -> String {
    "http://controller.discoverd".to_string()
}

// ---------------------------------------------------------------------------
// Blobstore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BlobstoreConfig {
    /// Base URL of the blob store holding repository snapshots.
    #[serde(default = "default_blobstore_url")]
    pub url: String,
}

impl Default for BlobstoreConfig {
    fn default() -> Self {
        Self {
            url: default_blobstore_url(),
        }
    }
}

fn default_blobstore_url() -> String {
    "http://blobstore.discoverd".to_string()
}

// ---------------------------------------------------------------------------
// Working repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoConfig {
    /// Parent directory for per-request working repositories.  Defaults to
    /// the system temp directory.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`].
///
/// With no path every setting takes its default.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    config
        .http_listen
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid http_listen address: {}", config.http_listen))?;
    anyhow::ensure!(
        config.health_path.starts_with('/'),
        "health_path must start with '/'"
    );
    // The health path is registered as a literal route.
    anyhow::ensure!(
        !config.health_path.contains(['{', '}', '*']),
        "health_path must not contain route captures or wildcards: {}",
        config.health_path
    );
    anyhow::ensure!(!config.auth.secret_env.is_empty(), "auth.secret_env must not be empty");
    for (name, url) in [
        ("controller.url", &config.controller.url),
        ("blobstore.url", &config.blobstore.url),
    ] {
        anyhow::ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "{name} must be an http(s) URL, got {url}"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.http_listen, "0.0.0.0:8080");
        assert_eq!(config.health_path, "/.well-known/status");
        assert_eq!(config.auth.secret_env, "CONTROLLER_KEY");
        assert_eq!(config.blobstore.url, "http://blobstore.discoverd");
        assert!(config.repos.tmp_dir.is_none());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            "blobstore:\n  url: http://127.0.0.1:9000\nrepos:\n  tmp_dir: /var/tmp\n",
        )
        .unwrap();
        assert_eq!(config.blobstore.url, "http://127.0.0.1:9000");
        assert_eq!(config.repos.tmp_dir.as_deref(), Some(Path::new("/var/tmp")));
        assert_eq!(config.controller.url, "http://controller.discoverd");
        validate_config(&config).unwrap();
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "http_listen: 127.0.0.1:9999\nauth:\n  secret_env: GIT_KEY\n")
            .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.http_listen, "127.0.0.1:9999");
        assert_eq!(config.auth.secret_env, "GIT_KEY");
    }

    #[test]
    fn rejects_bad_listen_address() {
        let config = Config {
            http_listen: "not-an-address".into(),
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_relative_health_path() {
        let config = Config {
            health_path: "status".into(),
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_route_syntax_in_health_path() {
        for path in ["/{status}", "/health/*rest", "/a}"] {
            let config = Config {
                health_path: path.into(),
                ..Config::default()
            };
            assert!(validate_config(&config).is_err(), "{path} should be rejected");
        }
    }

    #[test]
    fn rejects_non_http_blobstore() {
        let mut config = Config::default();
        config.blobstore.url = "s3://bucket".into();
        assert!(validate_config(&config).is_err());
    }
}
