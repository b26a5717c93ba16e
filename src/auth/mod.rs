//! Database credential acquisition.
//!
//! Provides multiple identity backends behind one [`CredentialProvider`] trait:
//! - **Managed identity**: platform identity token exchanged for a database credential
//! - **Service principal (local)**: personal access token presented to the exchange
//! - **Service principal (cloud)**: vault-held client secret, directory token, exchange
//! - **Static token / connection string**: operator-supplied, never rotated
//!
//! [`Mode::resolve`] picks exactly one backend from configuration and
//! [`TokenCache`] sits in front of it.

mod cache;
mod credential;
pub mod exchange;
mod http;
pub mod identity;
mod mode;
mod provider;
mod providers;
pub mod secrets;

pub use cache::{CachedCredential, TokenCache};
pub use credential::{Credential, CredentialOrigin};
pub use exchange::CredentialExchange;
#[cfg(feature = "azure")]
pub use identity::AzureCredentialSource;
pub use identity::{ClientSecretSource, IdentityToken, IdentityTokenSource, ManagedIdentitySource};
pub use mode::{Mode, ServicePrincipalKind};
pub use provider::CredentialProvider;
pub use providers::{
    FallbackPolicy, FallbackProvider, ManagedIdentityProvider, PersonalAccessTokenProvider,
    ServicePrincipalProvider, StaticTokenProvider, VaultSecret, build_provider,
};
pub use secrets::{EnvSecretStore, KeyVaultSecretStore, SecretStore};
