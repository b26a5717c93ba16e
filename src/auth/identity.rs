//! Cloud identity token sources.
//!
//! Provides:
//! - **Managed identity**: App Service identity endpoint or the instance metadata service
//! - **Client secret**: OAuth2 client-credentials grant against the directory
//! - **Azure SDK** (`azure` feature): any `azure_core` `TokenCredential`

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::http;
use crate::config::IdentityConfig;
use crate::{Error, Result};

pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Directory token proving the workload's identity.
#[derive(Clone)]
pub struct IdentityToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl IdentityToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityToken")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of directory identity tokens.
#[async_trait]
pub trait IdentityTokenSource: Send + Sync {
    fn name(&self) -> &str;

    /// Obtain a token for `scope` (e.g. `<resource>/.default`).
    async fn identity_token(&self, scope: &str) -> Result<IdentityToken>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_on: Option<serde_json::Value>,
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    /// A body that is not a token response is a malformed answer, not a transient failure.
    async fn read(response: reqwest::Response, source: &str) -> Result<Self> {
        response.json().await.map_err(|e| {
            Error::invalid_credential(format!(
                "unreadable {} response: {}",
                source,
                e.without_url()
            ))
        })
    }

    fn into_identity_token(self, source: &str) -> Result<IdentityToken> {
        let token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::invalid_credential(format!("{} returned no access_token", source)))?;

        let expires_on = self
            .expires_on
            .as_ref()
            .and_then(as_seconds)
            .and_then(|on| DateTime::from_timestamp(on, 0));
        let expires_at = expires_on
            .or_else(|| {
                self.expires_in
                    .as_ref()
                    .and_then(as_seconds)
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            })
            .ok_or_else(|| Error::invalid_credential(format!("{} returned no expiry", source)))?;

        Ok(IdentityToken::new(token, expires_at))
    }
}

/// Identity endpoints report times as either JSON numbers or numeric strings.
fn as_seconds(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Platform managed identity.
pub struct ManagedIdentitySource {
    http: reqwest::Client,
    endpoint: String,
    identity_header: Option<SecretString>,
    client_id: Option<String>,
}

impl ManagedIdentitySource {
    /// Use the App Service endpoint when configured, IMDS otherwise.
    pub fn from_config(config: &IdentityConfig, timeout: Duration) -> Result<Self> {
        let mut source = Self::new(
            config
                .managed_identity_endpoint
                .clone()
                .unwrap_or_else(|| IMDS_ENDPOINT.to_string()),
            http::client(timeout)?,
        );
        source.identity_header = config.managed_identity_header.clone();
        source.client_id = config.managed_identity_client_id.clone();
        Ok(source)
    }

    pub fn new(endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            identity_header: None,
            client_id: None,
        }
    }

    /// Header secret required by App Service style endpoints.
    pub fn with_identity_header(mut self, header: impl Into<String>) -> Self {
        self.identity_header = Some(SecretString::from(header.into()));
        self
    }

    /// Select a user-assigned identity.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

impl fmt::Debug for ManagedIdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedIdentitySource")
            .field("endpoint", &self.endpoint)
            .field("has_identity_header", &self.identity_header.is_some())
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[async_trait]
impl IdentityTokenSource for ManagedIdentitySource {
    fn name(&self) -> &str {
        "managed_identity"
    }

    async fn identity_token(&self, scope: &str) -> Result<IdentityToken> {
        let resource = scope.trim_end_matches("/.default");
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| Error::configuration(format!("invalid identity endpoint: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            let api_version = if self.identity_header.is_some() {
                APP_SERVICE_API_VERSION
            } else {
                IMDS_API_VERSION
            };
            query.append_pair("api-version", api_version);
            query.append_pair("resource", resource);
            if let Some(ref client_id) = self.client_id {
                query.append_pair("client_id", client_id);
            }
        }

        let mut request = self.http.get(url);
        request = match self.identity_header {
            Some(ref header) => request.header("X-IDENTITY-HEADER", header.expose_secret()),
            None => request.header("Metadata", "true"),
        };

        let response = request.send().await?;
        let response = http::error_for_status(response, "managed identity endpoint").await?;
        TokenResponse::read(response, "managed identity endpoint")
            .await?
            .into_identity_token("managed identity endpoint")
    }
}

/// Service principal authenticating with a client secret.
pub struct ClientSecretSource {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: SecretString,
}

impl ClientSecretSource {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        http: reqwest::Client,
    ) -> Self {
        Self {
            http,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Sovereign cloud or test authority.
    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into().trim_end_matches('/').to_string();
        self
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        )
    }
}

impl fmt::Debug for ClientSecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretSource")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .finish()
    }
}

#[async_trait]
impl IdentityTokenSource for ClientSecretSource {
    fn name(&self) -> &str {
        "client_secret"
    }

    async fn identity_token(&self, scope: &str) -> Result<IdentityToken> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", self.client_secret.expose_secret())
            .append_pair("scope", scope)
            .finish();

        let response = self
            .http
            .post(self.token_endpoint())
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(form)
            .send()
            .await?;
        let response = http::error_for_status(response, "directory token endpoint").await?;
        TokenResponse::read(response, "directory token endpoint")
            .await?
            .into_identity_token("directory token endpoint")
    }
}

/// Adapter over any Azure SDK credential.
#[cfg(feature = "azure")]
pub struct AzureCredentialSource {
    credential: std::sync::Arc<dyn azure_core::credentials::TokenCredential>,
}

#[cfg(feature = "azure")]
impl AzureCredentialSource {
    pub fn new(credential: std::sync::Arc<dyn azure_core::credentials::TokenCredential>) -> Self {
        Self { credential }
    }

    /// Azure CLI / developer tool login, for local development.
    pub fn developer_tools() -> Result<Self> {
        let credential = azure_identity::DeveloperToolsCredential::new(None)
            .map_err(|e| Error::configuration(format!("Failed to create Azure credential: {}", e)))?;
        Ok(Self::new(credential))
    }
}

#[cfg(feature = "azure")]
impl fmt::Debug for AzureCredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentialSource").finish_non_exhaustive()
    }
}

#[cfg(feature = "azure")]
#[async_trait]
impl IdentityTokenSource for AzureCredentialSource {
    fn name(&self) -> &str {
        "azure_sdk"
    }

    async fn identity_token(&self, scope: &str) -> Result<IdentityToken> {
        let token = self
            .credential
            .get_token(&[scope], None)
            .await
            .map_err(|e| Error::fetch(format!("Failed to get Azure token: {}", e)))?;
        let expires_at = DateTime::from_timestamp(token.expires_on.unix_timestamp(), 0)
            .ok_or_else(|| Error::invalid_credential("Azure token expiry out of range"))?;
        Ok(IdentityToken::new(token.token.secret().to_string(), expires_at))
    }
}
