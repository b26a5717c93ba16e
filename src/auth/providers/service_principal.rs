//! Service principal credential providers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::auth::exchange::WORKSPACE_RESOURCE_SCOPE;
use crate::auth::http;
use crate::auth::identity::DEFAULT_AUTHORITY_HOST;
use crate::auth::{
    ClientSecretSource, Credential, CredentialExchange, CredentialProvider, IdentityTokenSource,
    SecretStore,
};
use crate::{Error, Result};

/// Local development: a personal access token is the exchange bearer.
pub struct PersonalAccessTokenProvider {
    token: SecretString,
    exchange: CredentialExchange,
}

impl PersonalAccessTokenProvider {
    pub fn new(token: SecretString, exchange: CredentialExchange) -> Self {
        Self { token, exchange }
    }
}

impl fmt::Debug for PersonalAccessTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonalAccessTokenProvider")
            .field("token", &"[redacted]")
            .field("endpoint", &self.exchange.endpoint())
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for PersonalAccessTokenProvider {
    fn name(&self) -> &str {
        "service_principal_local"
    }

    async fn fetch(&self) -> Result<Credential> {
        self.exchange.exchange(&self.token).await
    }
}

/// Named secret held in a [`SecretStore`].
pub struct VaultSecret {
    store: Arc<dyn SecretStore>,
    name: String,
}

impl VaultSecret {
    pub fn new(store: Arc<dyn SecretStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

/// Cloud deployment: client secret to directory token to database credential.
///
/// The client secret is read on every fetch so a rotated vault secret is picked up
/// without a restart. When the vault read fails the environment secret, if any, is
/// used instead.
pub struct ServicePrincipalProvider {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    vault: Option<VaultSecret>,
    env_secret: Option<SecretString>,
    exchange: CredentialExchange,
    scope: String,
}

impl ServicePrincipalProvider {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        exchange: CredentialExchange,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: http::client(timeout)?,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            vault: None,
            env_secret: None,
            exchange,
            scope: WORKSPACE_RESOURCE_SCOPE.to_string(),
        })
    }

    pub fn with_vault(mut self, vault: VaultSecret) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_env_secret(mut self, secret: SecretString) -> Self {
        self.env_secret = Some(secret);
        self
    }

    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    async fn client_secret(&self) -> Result<SecretString> {
        if let Some(ref vault) = self.vault {
            match vault.store.get_secret(&vault.name).await {
                Ok(secret) => return Ok(secret),
                Err(e) if self.env_secret.is_some() => {
                    tracing::warn!(
                        store = vault.store.name(),
                        secret = %vault.name,
                        "Vault read failed, using environment client secret: {}",
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
        self.env_secret
            .clone()
            .ok_or_else(|| Error::configuration("no client secret source configured"))
    }
}

impl fmt::Debug for ServicePrincipalProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePrincipalProvider")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("vault", &self.vault.as_ref().map(|v| v.name.as_str()))
            .field("has_env_secret", &self.env_secret.is_some())
            .field("endpoint", &self.exchange.endpoint())
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for ServicePrincipalProvider {
    fn name(&self) -> &str {
        "service_principal_cloud"
    }

    async fn fetch(&self) -> Result<Credential> {
        let secret = self.client_secret().await?;
        let source = ClientSecretSource::new(
            self.tenant_id.clone(),
            self.client_id.clone(),
            secret,
            self.http.clone(),
        )
        .with_authority_host(self.authority_host.clone());

        let identity = source.identity_token(&self.scope).await?;
        self.exchange.exchange(&identity.token).await
    }
}
