//! Credential provider trait.

use async_trait::async_trait;

use super::Credential;
use crate::Result;

/// Backend that issues database credentials.
///
/// Calling `fetch` repeatedly is safe but may issue a new token each time; callers
/// go through [`TokenCache`](super::TokenCache) to collapse concurrent fetches.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Obtain a fresh credential.
    async fn fetch(&self) -> Result<Credential>;

    /// Whether credentials from this provider expire and need scheduled refresh.
    fn is_rotating(&self) -> bool {
        true
    }
}
