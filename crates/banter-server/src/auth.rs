//! Authentication seam.
//!
//! Authentication policy is delegated: the pipeline only needs a function
//! from credentials to identity, invoked during the CONNECTING ->
//! AUTHENTICATED transition. Deployments inject their own implementation;
//! the default accepts anyone.

use async_trait::async_trait;
use banter_protocol::validate::validate_identity;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Authentication failure.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The peer's credentials were rejected.
    #[error("authentication rejected: {0}")]
    Rejected(String),
}

/// Maps connection credentials to an identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a connecting peer.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] when the credentials are refused;
    /// the connection is answered with an error frame and closed.
    async fn authenticate(&self, credentials: Option<&str>) -> Result<String, AuthError>;
}

/// Accepts every peer.
///
/// Credentials, when present, are taken as the requested identity and must
/// pass identity validation. Anonymous peers get a generated guest name.
#[derive(Debug, Default)]
pub struct AnonymousAuthenticator {
    counter: AtomicU64,
}

impl AnonymousAuthenticator {
    /// Create a new anonymous authenticator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, credentials: Option<&str>) -> Result<String, AuthError> {
        match credentials {
            Some(identity) => {
                validate_identity(identity).map_err(|e| AuthError::Rejected(e.to_string()))?;
                Ok(identity.to_string())
            }
            None => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                Ok(format!("guest{}", n))
            }
        }
    }
}
