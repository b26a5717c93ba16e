//! Credential caching layer.
//!
//! Reads of a still-valid credential take only a shared read lock. A miss takes the
//! fetch lock, re-checks, and performs exactly one provider fetch; concurrent callers
//! queue on the lock and pick up the stored result.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::{Credential, CredentialProvider};
use crate::config::settings::DEFAULT_REFRESH_BUFFER;
use crate::{Error, Result};

/// A credential together with the instant it stops being served.
#[derive(Clone)]
pub struct CachedCredential {
    credential: Credential,
    refresh_deadline: Option<Instant>,
}

impl CachedCredential {
    pub fn new(credential: Credential, buffer: Duration) -> Self {
        let refresh_deadline = credential.remaining().map(|remaining| {
            let remaining = remaining.to_std().unwrap_or_default();
            Instant::now() + remaining.saturating_sub(buffer)
        });
        Self {
            credential,
            refresh_deadline,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// `None` for credentials that never go stale.
    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.refresh_deadline
    }

    /// Still servable `horizon` from now.
    ///
    /// Fallback credentials only satisfy immediate reads so that any lookahead
    /// (the scheduled refresh) retries the primary backend.
    pub fn is_fresh_for(&self, horizon: Duration) -> bool {
        if self.credential.is_fallback() && !horizon.is_zero() {
            return false;
        }
        match self.refresh_deadline {
            Some(deadline) => Instant::now() + horizon < deadline,
            None => true,
        }
    }
}

impl fmt::Debug for CachedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCredential")
            .field("credential", &self.credential)
            .field("refresh_deadline", &self.refresh_deadline)
            .finish()
    }
}

/// Single-flight cache in front of a [`CredentialProvider`].
pub struct TokenCache {
    provider: Arc<dyn CredentialProvider>,
    buffer: Duration,
    entry: RwLock<Option<CachedCredential>>,
    fetch_lock: Mutex<()>,
    fetches: AtomicU64,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            buffer: DEFAULT_REFRESH_BUFFER,
            entry: RwLock::new(None),
            fetch_lock: Mutex::new(()),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn is_rotating(&self) -> bool {
        self.provider.is_rotating()
    }

    /// Current database password.
    pub async fn get_token(&self) -> Result<SecretString> {
        Ok(self.get_credential().await?.secret().clone())
    }

    /// Password that stays servable for at least `horizon`.
    pub async fn get_token_valid_for(&self, horizon: Duration) -> Result<SecretString> {
        Ok(self.get_credential_valid_for(horizon).await?.secret().clone())
    }

    pub async fn get_credential(&self) -> Result<Credential> {
        self.get_credential_valid_for(Duration::ZERO).await
    }

    /// A credential that will still be servable `horizon` from now.
    ///
    /// If even a freshly fetched credential cannot cover the horizon it is returned
    /// anyway; it is the newest one available.
    pub async fn get_credential_valid_for(&self, horizon: Duration) -> Result<Credential> {
        if let Some(credential) = self.fresh(horizon).await {
            return Ok(credential);
        }

        let _guard = self.fetch_lock.lock().await;

        // Another caller may have completed the fetch while we waited.
        if let Some(credential) = self.fresh(horizon).await {
            return Ok(credential);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let credential = self.provider.fetch().await?;

        if let Some(remaining) = credential.remaining() {
            let remaining = remaining.to_std().unwrap_or_default();
            if remaining <= self.buffer {
                return Err(Error::invalid_credential(format!(
                    "{} issued a credential valid for {}s, inside the {}s refresh buffer",
                    self.provider.name(),
                    remaining.as_secs(),
                    self.buffer.as_secs()
                )));
            }
        }

        tracing::debug!(
            provider = self.provider.name(),
            expires_in_secs = credential.remaining().map(|r| r.num_seconds()),
            fallback = credential.is_fallback(),
            "Credential cached"
        );
        *self.entry.write().await = Some(CachedCredential::new(credential.clone(), self.buffer));
        Ok(credential)
    }

    /// Drop the cached credential so the next read fetches.
    pub async fn clear(&self) {
        *self.entry.write().await = None;
        tracing::debug!(provider = self.provider.name(), "Credential cache cleared");
    }

    /// Cached entry without triggering a fetch.
    pub async fn peek(&self) -> Option<CachedCredential> {
        self.entry.read().await.clone()
    }

    /// Number of provider fetches performed.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn fresh(&self, horizon: Duration) -> Option<Credential> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|cached| cached.is_fresh_for(horizon))
            .map(|cached| cached.credential.clone())
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("provider", &self.provider.name())
            .field("buffer", &self.buffer)
            .field("fetches", &self.fetch_count())
            .finish()
    }
}
