//! Credential provider implementations.

mod fallback;
mod managed_identity;
mod service_principal;
mod static_token;

pub use fallback::{FallbackPolicy, FallbackProvider};
pub use managed_identity::ManagedIdentityProvider;
pub use service_principal::{PersonalAccessTokenProvider, ServicePrincipalProvider, VaultSecret};
pub use static_token::StaticTokenProvider;

use std::sync::Arc;

use crate::auth::{
    CredentialExchange, CredentialProvider, IdentityTokenSource, KeyVaultSecretStore,
    ManagedIdentitySource, Mode, ServicePrincipalKind,
};
use crate::config::{ConfigError, ConnectorConfig};
use crate::Result;

/// Build the provider for a resolved mode, wrapped in a password fallback when the
/// configured policy allows it.
pub fn build_provider(mode: Mode, config: &ConnectorConfig) -> Result<Arc<dyn CredentialProvider>> {
    let timeout = config.rotation.fetch_timeout;
    let identity = &config.identity;

    let provider: Arc<dyn CredentialProvider> = match mode {
        Mode::ManagedIdentity => {
            let source = ManagedIdentitySource::from_config(identity, timeout)?;
            wrap_fallback(
                ManagedIdentityProvider::new(Arc::new(source), exchange(config)?),
                mode,
                config,
            )
        }
        Mode::ServicePrincipal(ServicePrincipalKind::Local) => {
            let token = identity
                .personal_access_token
                .clone()
                .ok_or_else(|| ConfigError::missing("DATABRICKS_TOKEN"))?;
            wrap_fallback(
                PersonalAccessTokenProvider::new(token, exchange(config)?),
                mode,
                config,
            )
        }
        Mode::ServicePrincipal(ServicePrincipalKind::Cloud) => {
            let tenant = identity
                .tenant_id
                .clone()
                .ok_or_else(|| ConfigError::missing("AZURE_TENANT_ID"))?;
            let client = identity
                .client_id
                .clone()
                .ok_or_else(|| ConfigError::missing("AZURE_CLIENT_ID"))?;

            let mut sp = ServicePrincipalProvider::new(tenant, client, exchange(config)?, timeout)?;
            if let Some(ref host) = identity.authority_host {
                sp = sp.with_authority_host(host.clone());
            }
            if let Some(ref secret) = identity.client_secret {
                sp = sp.with_env_secret(secret.clone());
            }
            if let (Some(vault_url), Some(name)) =
                (&identity.key_vault_url, &identity.client_secret_name)
                && let Some(vault_identity) = vault_identity(config)?
            {
                let store = KeyVaultSecretStore::new(vault_url.clone(), vault_identity, timeout)?;
                sp = sp.with_vault(VaultSecret::new(Arc::new(store), name.clone()));
            }
            wrap_fallback(sp, mode, config)
        }
        Mode::StaticToken => {
            let token = identity
                .static_token
                .as_ref()
                .ok_or_else(|| ConfigError::missing("DATABASE_TOKEN"))?;
            Arc::new(StaticTokenProvider::token(token))
        }
        Mode::ConnectionString => {
            let url = config
                .database
                .connection_string
                .as_ref()
                .ok_or_else(|| ConfigError::missing("DATABASE_URL"))?;
            Arc::new(StaticTokenProvider::from_connection_string(url)?)
        }
    };

    tracing::debug!(mode = %mode, provider = provider.name(), "Credential provider built");
    Ok(provider)
}

fn exchange(config: &ConnectorConfig) -> Result<CredentialExchange> {
    let workspace = config
        .identity
        .workspace_url
        .as_deref()
        .ok_or_else(|| ConfigError::missing("DATABRICKS_HOST"))?;
    let instance = config
        .database
        .instance_name
        .clone()
        .ok_or_else(|| ConfigError::missing("DATABASE_INSTANCE_NAME"))?;
    CredentialExchange::new(workspace, instance, config.rotation.fetch_timeout)
}

fn wrap_fallback<P>(provider: P, mode: Mode, config: &ConnectorConfig) -> Arc<dyn CredentialProvider>
where
    P: CredentialProvider + 'static,
{
    let policy = config.rotation.fallback_policy;
    match config.rotation.fallback_password {
        Some(ref password) if policy.allows(mode) => {
            tracing::debug!(mode = %mode, policy = %policy, "Fallback password enabled");
            Arc::new(FallbackProvider::new(provider, password.clone()))
        }
        Some(_) => {
            tracing::debug!(mode = %mode, policy = %policy, "Fallback password ignored for this mode");
            Arc::new(provider)
        }
        None => Arc::new(provider),
    }
}

/// Identity used to read the vault: the platform identity when one is present,
/// developer tooling when the `azure` feature is enabled.
fn vault_identity(config: &ConnectorConfig) -> Result<Option<Arc<dyn IdentityTokenSource>>> {
    if config.identity.managed_identity_available {
        let source =
            ManagedIdentitySource::from_config(&config.identity, config.rotation.fetch_timeout)?;
        return Ok(Some(Arc::new(source)));
    }

    #[cfg(feature = "azure")]
    {
        match crate::auth::AzureCredentialSource::developer_tools() {
            Ok(source) => return Ok(Some(Arc::new(source))),
            Err(e) => tracing::debug!("Developer tool credential unavailable: {}", e),
        }
    }

    if config.identity.client_secret.is_none() {
        return Err(ConfigError::conflict(
            "key vault configured but no identity can read it and AZURE_CLIENT_SECRET is unset",
        )
        .into());
    }
    tracing::debug!("No vault identity available, using environment client secret");
    Ok(None)
}
