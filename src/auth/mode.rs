//! Connectivity mode resolution.

use std::fmt;

use crate::config::{ConfigError, ConfigResult, ConnectorConfig};

/// How a service principal authenticates against the credential-issuing API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServicePrincipalKind {
    /// A personal access token is presented directly.
    Local,
    /// Client secret (vault or environment) exchanged for a directory token.
    Cloud,
}

/// Active connectivity mode, decided once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    ManagedIdentity,
    ServicePrincipal(ServicePrincipalKind),
    StaticToken,
    ConnectionString,
}

impl Mode {
    /// Resolve the mode from configuration.
    ///
    /// Pure: no I/O, same input gives the same answer. Inconsistent combinations are
    /// rejected instead of falling through to a weaker mode.
    pub fn resolve(config: &ConnectorConfig) -> ConfigResult<Self> {
        let identity = &config.identity;

        let mode = if identity.use_managed_identity {
            if !identity.managed_identity_available {
                return Err(ConfigError::conflict(
                    "managed identity requested but no platform identity endpoint is available",
                ));
            }
            Mode::ManagedIdentity
        } else if identity.use_rotating_credentials {
            if identity.personal_access_token.is_some() {
                Mode::ServicePrincipal(ServicePrincipalKind::Local)
            } else if identity.has_service_principal() {
                Mode::ServicePrincipal(ServicePrincipalKind::Cloud)
            } else if identity.static_token.is_some() {
                Mode::StaticToken
            } else {
                return Err(ConfigError::conflict(
                    "rotating credentials enabled but no personal access token, \
                     service principal or static token is configured",
                ));
            }
        } else if config.database.connection_string.is_some() {
            Mode::ConnectionString
        } else {
            return Err(ConfigError::conflict(
                "no database connectivity configured: set a connection string \
                 or enable rotating credentials",
            ));
        };

        mode.validate(config)?;
        Ok(mode)
    }

    fn validate(&self, config: &ConnectorConfig) -> ConfigResult<()> {
        match self {
            Mode::ManagedIdentity | Mode::ServicePrincipal(_) => {
                let workspace = config
                    .identity
                    .workspace_url
                    .as_deref()
                    .ok_or_else(|| ConfigError::missing("DATABRICKS_HOST"))?;
                super::exchange::normalize_workspace_url(workspace)?;
                if config.database.instance_name.is_none() {
                    return Err(ConfigError::missing("DATABASE_INSTANCE_NAME"));
                }
                require_host(config)?;
                if self.database_user(config).is_none() {
                    return Err(ConfigError::missing("PGUSER"));
                }
            }
            Mode::StaticToken => {
                require_host(config)?;
                if config.database.username.is_none() {
                    return Err(ConfigError::missing("PGUSER"));
                }
            }
            Mode::ConnectionString => {
                // Presence is guaranteed by resolve(); shape is checked when the pool is built.
            }
        }
        Ok(())
    }

    /// Role the pool logs in as.
    ///
    /// A cloud service principal logs in under its client id unless a user is set.
    pub fn database_user(&self, config: &ConnectorConfig) -> Option<String> {
        match self {
            Mode::ServicePrincipal(ServicePrincipalKind::Cloud) => config
                .database
                .username
                .clone()
                .or_else(|| config.identity.client_id.clone()),
            _ => config.database.username.clone(),
        }
    }

    /// Whether credentials in this mode expire and are refreshed on a schedule.
    pub fn is_rotating(&self) -> bool {
        matches!(self, Mode::ManagedIdentity | Mode::ServicePrincipal(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ManagedIdentity => "managed_identity",
            Mode::ServicePrincipal(ServicePrincipalKind::Local) => "service_principal_local",
            Mode::ServicePrincipal(ServicePrincipalKind::Cloud) => "service_principal_cloud",
            Mode::StaticToken => "static_token",
            Mode::ConnectionString => "connection_string",
        }
    }
}

fn require_host(config: &ConnectorConfig) -> ConfigResult<()> {
    if config.database.host.is_none() {
        return Err(ConfigError::missing("PGHOST"));
    }
    Ok(())
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ConnectorConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConnectorConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    const TARGET: &[(&str, &str)] = &[
        ("DATABRICKS_HOST", "https://adb-123.azuredatabricks.net"),
        ("DATABASE_INSTANCE_NAME", "orders-db"),
        ("PGHOST", "instance-1.database.example.net"),
        ("PGUSER", "app@example.com"),
    ];

    fn with_target(extra: &[(&'static str, &'static str)]) -> ConnectorConfig {
        let mut pairs = TARGET.to_vec();
        pairs.extend_from_slice(extra);
        config(&pairs)
    }

    #[test]
    fn test_managed_identity() {
        let cfg = with_target(&[
            ("DATABASE_USE_MANAGED_IDENTITY", "1"),
            ("IDENTITY_ENDPOINT", "http://127.0.0.1:41000/msi/token"),
        ]);
        assert_eq!(Mode::resolve(&cfg).unwrap(), Mode::ManagedIdentity);
    }

    #[test]
    fn test_managed_identity_without_platform_identity_fails() {
        let cfg = with_target(&[("DATABASE_USE_MANAGED_IDENTITY", "1")]);
        assert!(matches!(Mode::resolve(&cfg), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_managed_identity_with_static_token_but_no_workspace_fails() {
        let cfg = config(&[
            ("DATABASE_USE_MANAGED_IDENTITY", "1"),
            ("AZURE_MANAGED_IDENTITY_AVAILABLE", "1"),
            ("DATABASE_TOKEN", "tok"),
            ("DATABASE_INSTANCE_NAME", "orders-db"),
            ("PGHOST", "h"),
            ("PGUSER", "u"),
        ]);
        assert_eq!(
            Mode::resolve(&cfg),
            Err(ConfigError::missing("DATABRICKS_HOST"))
        );
    }

    #[test]
    fn test_service_principal_local_prefers_pat() {
        let cfg = with_target(&[
            ("DATABASE_USE_ROTATING_CREDENTIALS", "true"),
            ("DATABRICKS_TOKEN", "dapi123"),
            ("AZURE_TENANT_ID", "t"),
            ("AZURE_CLIENT_ID", "c"),
            ("AZURE_CLIENT_SECRET", "s"),
        ]);
        assert_eq!(
            Mode::resolve(&cfg).unwrap(),
            Mode::ServicePrincipal(ServicePrincipalKind::Local)
        );
    }

    #[test]
    fn test_service_principal_cloud() {
        let cfg = config(&[
            ("DATABRICKS_HOST", "adb-123.azuredatabricks.net"),
            ("DATABASE_INSTANCE_NAME", "orders-db"),
            ("PGHOST", "h"),
            ("DATABASE_USE_ROTATING_CREDENTIALS", "true"),
            ("AZURE_TENANT_ID", "t"),
            ("AZURE_CLIENT_ID", "client-guid"),
            ("AZURE_KEY_VAULT_URL", "https://vault.example"),
            ("DATABASE_CLIENT_SECRET_NAME", "sp-secret"),
        ]);
        let mode = Mode::resolve(&cfg).unwrap();
        assert_eq!(mode, Mode::ServicePrincipal(ServicePrincipalKind::Cloud));
        assert_eq!(mode.database_user(&cfg).as_deref(), Some("client-guid"));
    }

    #[test]
    fn test_static_token() {
        let cfg = config(&[
            ("DATABASE_USE_ROTATING_CREDENTIALS", "true"),
            ("DATABASE_TOKEN", "tok"),
            ("PGHOST", "h"),
            ("PGUSER", "u"),
        ]);
        let mode = Mode::resolve(&cfg).unwrap();
        assert_eq!(mode, Mode::StaticToken);
        assert!(!mode.is_rotating());
    }

    #[test]
    fn test_rotating_without_any_credential_fails() {
        let cfg = with_target(&[("DATABASE_USE_ROTATING_CREDENTIALS", "true")]);
        assert!(matches!(Mode::resolve(&cfg), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_connection_string_fallback() {
        let cfg = config(&[("DATABASE_URL", "postgres://u:p@localhost/db")]);
        assert_eq!(Mode::resolve(&cfg).unwrap(), Mode::ConnectionString);
    }

    #[test]
    fn test_nothing_configured_fails() {
        assert!(Mode::resolve(&config(&[])).is_err());
    }

    #[test]
    fn test_rotating_ignores_connection_string() {
        let cfg = with_target(&[
            ("DATABASE_USE_ROTATING_CREDENTIALS", "true"),
            ("DATABRICKS_TOKEN", "dapi123"),
            ("DATABASE_URL", "postgres://u:p@localhost/db"),
        ]);
        assert_eq!(
            Mode::resolve(&cfg).unwrap(),
            Mode::ServicePrincipal(ServicePrincipalKind::Local)
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let cfg = with_target(&[
            ("DATABASE_USE_ROTATING_CREDENTIALS", "true"),
            ("DATABRICKS_TOKEN", "dapi123"),
        ]);
        let first = Mode::resolve(&cfg);
        for _ in 0..10 {
            assert_eq!(Mode::resolve(&cfg), first);
        }
        assert_eq!(
            Mode::resolve(&config(&[])).unwrap_err(),
            Mode::resolve(&config(&[])).unwrap_err()
        );
    }
}
