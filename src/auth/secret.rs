use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};
use subtle::ConstantTimeEq;

/// The shared secret clients present as their Basic password.
///
/// Cheap to clone.  `Debug` never prints the value.
#[derive(Clone)]
pub struct SharedSecret(Arc<str>);

impl SharedSecret {
    pub fn new(secret: String) -> Self {
        Self(Arc::from(secret))
    }

    /// Read the secret from the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(Self::new(value)),
            _ => bail!("missing {var} env var"),
        }
    }

    /// Constant-time comparison of `candidate` against the secret.
    pub fn verify(&self, candidate: &[u8]) -> bool {
        candidate.ct_eq(self.0.as_bytes()).into()
    }

    /// The raw value, for authenticating outbound requests.
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}
