//! Secret stores for service-principal client secrets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::http;
use super::identity::IdentityTokenSource;
use crate::{Error, Result};

pub const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const KEY_VAULT_API_VERSION: &str = "7.4";

/// Read access to named secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get_secret(&self, name: &str) -> Result<SecretString>;
}

/// Key Vault REST client authenticated by an identity source.
pub struct KeyVaultSecretStore {
    http: reqwest::Client,
    vault_url: String,
    identity: Arc<dyn IdentityTokenSource>,
}

impl KeyVaultSecretStore {
    pub fn new(
        vault_url: impl Into<String>,
        identity: Arc<dyn IdentityTokenSource>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self::with_client(vault_url, identity, http::client(timeout)?))
    }

    pub fn with_client(
        vault_url: impl Into<String>,
        identity: Arc<dyn IdentityTokenSource>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            http,
            vault_url: vault_url.into().trim_end_matches('/').to_string(),
            identity,
        }
    }
}

impl fmt::Debug for KeyVaultSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVaultSecretStore")
            .field("vault_url", &self.vault_url)
            .field("identity", &self.identity.name())
            .finish()
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

#[async_trait]
impl SecretStore for KeyVaultSecretStore {
    fn name(&self) -> &str {
        "key_vault"
    }

    async fn get_secret(&self, name: &str) -> Result<SecretString> {
        let bearer = self.identity.identity_token(KEY_VAULT_SCOPE).await?;
        let url = format!(
            "{}/secrets/{}?api-version={}",
            self.vault_url, name, KEY_VAULT_API_VERSION
        );

        let response = self
            .http
            .get(url)
            .bearer_auth(bearer.token.expose_secret())
            .send()
            .await?;
        let response = http::error_for_status(response, "key vault").await?;
        let bundle: SecretBundle = response.json().await.map_err(|e| {
            Error::invalid_credential(format!("unreadable key vault response: {}", e.without_url()))
        })?;

        bundle
            .value
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| Error::invalid_credential(format!("vault secret {} has no value", name)))
    }
}

/// Secrets read from environment variables, keyed by secret name.
///
/// `sp-client-secret` is looked up as `SP_CLIENT_SECRET`.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore {
    prefix: Option<String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    pub fn env_key(&self, name: &str) -> String {
        let key: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key,
        }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    fn name(&self) -> &str {
        "environment"
    }

    async fn get_secret(&self, name: &str) -> Result<SecretString> {
        let key = self.env_key(name);
        std::env::var(&key)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| Error::configuration(format!("{} not set", key)))
    }
}
