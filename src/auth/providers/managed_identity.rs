//! Managed identity credential provider.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::auth::exchange::WORKSPACE_RESOURCE_SCOPE;
use crate::auth::{Credential, CredentialExchange, CredentialProvider, IdentityTokenSource};

/// Platform identity token exchanged for a database credential.
pub struct ManagedIdentityProvider {
    source: Arc<dyn IdentityTokenSource>,
    exchange: CredentialExchange,
    scope: String,
}

impl ManagedIdentityProvider {
    pub fn new(source: Arc<dyn IdentityTokenSource>, exchange: CredentialExchange) -> Self {
        Self {
            source,
            exchange,
            scope: WORKSPACE_RESOURCE_SCOPE.to_string(),
        }
    }

    /// Directory scope requested from the identity source.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}

impl std::fmt::Debug for ManagedIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIdentityProvider")
            .field("source", &self.source.name())
            .field("endpoint", &self.exchange.endpoint())
            .field("scope", &self.scope)
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for ManagedIdentityProvider {
    fn name(&self) -> &str {
        "managed_identity"
    }

    async fn fetch(&self) -> Result<Credential> {
        let identity = self.source.identity_token(&self.scope).await?;
        tracing::debug!(
            source = self.source.name(),
            identity_expires_at = %identity.expires_at,
            "Platform identity token acquired"
        );
        self.exchange.exchange(&identity.token).await
    }
}
