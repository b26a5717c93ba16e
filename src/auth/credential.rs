//! Credential types.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

/// How a credential came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialOrigin {
    /// Issued by the credential-issuing API; time-bounded.
    Issued,
    /// Operator-supplied token or connection-string password.
    Static,
    /// Fallback password used because the primary backend failed.
    Fallback,
}

/// Database credential: the password presented to Postgres plus its expiry.
///
/// Immutable once created; rotation always produces a new value.
#[derive(Clone)]
pub struct Credential {
    token: SecretString,
    expires_at: Option<DateTime<Utc>>,
    origin: CredentialOrigin,
}

impl Credential {
    /// Create a time-bounded credential.
    ///
    /// Fails when the token is blank or the expiry is not strictly in the future.
    pub fn issued(token: impl Into<String>, expires_at: DateTime<Utc>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::invalid_credential("issued token is empty"));
        }
        if expires_at <= Utc::now() {
            return Err(Error::invalid_credential(format!(
                "issued token already expired at {}",
                expires_at.to_rfc3339()
            )));
        }
        Ok(Self {
            token: SecretString::from(token),
            expires_at: Some(expires_at),
            origin: CredentialOrigin::Issued,
        })
    }

    /// Create a non-expiring operator-supplied credential.
    pub fn unbounded(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at: None,
            origin: CredentialOrigin::Static,
        }
    }

    /// Create a non-expiring fallback credential.
    pub fn fallback(password: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(password.into()),
            expires_at: None,
            origin: CredentialOrigin::Fallback,
        }
    }

    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn secret(&self) -> &SecretString {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn origin(&self) -> CredentialOrigin {
        self.origin
    }

    pub fn is_fallback(&self) -> bool {
        self.origin == CredentialOrigin::Fallback
    }

    /// Time left before expiry; `None` for unbounded credentials.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at.map(|exp| exp - Utc::now())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Utc::now() >= exp)
    }

    /// Same secret and expiry.
    pub fn same_as(&self, other: &Credential) -> bool {
        self.expires_at == other.expires_at && self.token() == other.token()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("origin", &self.origin)
            .finish()
    }
}
