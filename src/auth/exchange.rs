//! Database credential exchange against the workspace API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Credential;
use super::http;
use crate::config::{ConfigError, ConfigResult};
use crate::{Error, Result};

pub const DATABASE_CREDENTIALS_PATH: &str = "/api/2.0/database/credentials";

/// Directory scope for tokens the workspace API accepts.
pub const WORKSPACE_RESOURCE_SCOPE: &str = "2ff814a6-3304-4ab8-85cb-cd0e6f879c1d/.default";

#[derive(Serialize)]
struct CredentialRequest<'a> {
    request_id: String,
    instance_names: &'a [String],
}

#[derive(Deserialize)]
struct CredentialResponse {
    token: Option<String>,
    expiration_time: Option<String>,
}

/// Exchanges a bearer identity for a short-lived database credential.
#[derive(Clone, Debug)]
pub struct CredentialExchange {
    http: reqwest::Client,
    endpoint: String,
    instance_names: Vec<String>,
}

impl CredentialExchange {
    pub fn new(
        workspace_url: &str,
        instance_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Self::with_client(http::client(timeout)?, workspace_url, instance_name)
    }

    pub fn with_client(
        http: reqwest::Client,
        workspace_url: &str,
        instance_name: impl Into<String>,
    ) -> Result<Self> {
        let base = normalize_workspace_url(workspace_url)?;
        Ok(Self {
            http,
            endpoint: format!("{}{}", base, DATABASE_CREDENTIALS_PATH),
            instance_names: vec![instance_name.into()],
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Present `bearer` and receive a database credential.
    pub async fn exchange(&self, bearer: &SecretString) -> Result<Credential> {
        let request = CredentialRequest {
            request_id: Uuid::new_v4().to_string(),
            instance_names: &self.instance_names,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(bearer.expose_secret())
            .json(&request)
            .send()
            .await?;
        let response = http::error_for_status(response, "credential exchange").await?;

        let body: CredentialResponse = response.json().await.map_err(|e| {
            Error::invalid_credential(format!(
                "unreadable credential response: {}",
                e.without_url()
            ))
        })?;

        let token = body
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::invalid_credential("credential response has no token"))?;
        let expiration = body
            .expiration_time
            .ok_or_else(|| Error::invalid_credential("credential response has no expiry"))?;
        let expires_at = DateTime::parse_from_rfc3339(&expiration)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                Error::invalid_credential(format!("unparseable expiry {:?}: {}", expiration, e))
            })?;

        let credential = Credential::issued(token, expires_at)?;
        tracing::debug!(
            instances = ?self.instance_names,
            expires_at = %expires_at,
            "Database credential issued"
        );
        Ok(credential)
    }
}

/// Accept `host`, `host/` or `https://host/` and return `https://host`.
pub fn normalize_workspace_url(raw: &str) -> ConfigResult<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = url::Url::parse(&candidate).map_err(|e| ConfigError::InvalidValue {
        key: "DATABRICKS_HOST".to_string(),
        message: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ConfigError::InvalidValue {
            key: "DATABRICKS_HOST".to_string(),
            message: format!("expected an http(s) URL, got {}", parsed.scheme()),
        });
    }
    Ok(candidate)
}
