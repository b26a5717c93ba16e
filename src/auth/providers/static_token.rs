//! Non-rotating credential provider.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::auth::{Credential, CredentialProvider};
use crate::{Error, Result};

/// Serves one operator-supplied credential forever.
pub struct StaticTokenProvider {
    credential: Credential,
    name: &'static str,
}

impl StaticTokenProvider {
    /// Already-issued database token.
    pub fn token(token: &SecretString) -> Self {
        Self {
            credential: Credential::unbounded(token.expose_secret()),
            name: "static_token",
        }
    }

    /// Password embedded in a `postgres://` URL. A URL without a password yields an
    /// empty one, for trust or peer authentication.
    pub fn from_connection_string(url: &SecretString) -> Result<Self> {
        let parsed = url::Url::parse(url.expose_secret())
            .map_err(|e| Error::configuration(format!("invalid DATABASE_URL: {}", e)))?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(Error::configuration(format!(
                "DATABASE_URL must use the postgres scheme, got {}",
                parsed.scheme()
            )));
        }

        let password = parsed
            .password()
            .map(|raw| {
                urlencoding::decode(raw)
                    .map(|decoded| decoded.into_owned())
                    .map_err(|_| Error::configuration("DATABASE_URL password is not valid UTF-8"))
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            credential: Credential::unbounded(password),
            name: "connection_string",
        })
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }

    fn is_rotating(&self) -> bool {
        false
    }
}
