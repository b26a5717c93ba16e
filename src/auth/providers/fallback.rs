//! Static password fallback around a rotating provider.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::auth::{Credential, CredentialProvider, Mode};
use crate::Result;

/// When a configured fallback password may stand in for a failed fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Fetch failures always propagate.
    Never,
    /// Only managed-identity deployments fall back.
    #[default]
    ManagedIdentityOnly,
    /// Every rotating mode falls back.
    Always,
}

impl FallbackPolicy {
    pub fn allows(&self, mode: Mode) -> bool {
        match self {
            FallbackPolicy::Never => false,
            FallbackPolicy::ManagedIdentityOnly => mode == Mode::ManagedIdentity,
            FallbackPolicy::Always => mode.is_rotating(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackPolicy::Never => "never",
            FallbackPolicy::ManagedIdentityOnly => "managed_identity",
            FallbackPolicy::Always => "always",
        }
    }
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "never" | "none" => Ok(FallbackPolicy::Never),
            "managed_identity" | "managed_identity_only" => Ok(FallbackPolicy::ManagedIdentityOnly),
            "always" => Ok(FallbackPolicy::Always),
            other => Err(format!(
                "unknown fallback policy {:?} (expected never, managed_identity or always)",
                other
            )),
        }
    }
}

impl fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serves a static password when the wrapped provider fails.
///
/// Configuration errors are never masked; they indicate a broken deployment rather
/// than an unavailable backend.
pub struct FallbackProvider<P> {
    inner: P,
    password: SecretString,
}

impl<P: CredentialProvider> FallbackProvider<P> {
    pub fn new(inner: P, password: SecretString) -> Self {
        Self { inner, password }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P> fmt::Debug for FallbackProvider<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackProvider")
            .field("password", &"[redacted]")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<P: CredentialProvider> CredentialProvider for FallbackProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self) -> Result<Credential> {
        match self.inner.fetch().await {
            Ok(credential) => Ok(credential),
            Err(e) if e.is_configuration_error() => Err(e),
            Err(e) => {
                tracing::warn!(
                    provider = self.inner.name(),
                    category = ?e.category(),
                    "Credential fetch failed, using fallback password: {}",
                    e
                );
                Ok(Credential::fallback(self.password.expose_secret()))
            }
        }
    }

    fn is_rotating(&self) -> bool {
        self.inner.is_rotating()
    }
}
