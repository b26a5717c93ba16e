//! Connector settings.

use std::time::Duration;

use secrecy::SecretString;

use super::env::EnvReader;
use super::ConfigResult;
use crate::auth::FallbackPolicy;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "databricks_postgres";
pub const DEFAULT_APPLICATION_NAME: &str = "rotating-pg";
pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_SCHEMA_PREFIX: &str = "app_";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(50 * 60);
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_ATTEMPTS: u32 = 3;

/// Which identity backends are configured.
#[derive(Clone, Debug, Default)]
pub struct IdentityConfig {
    pub use_managed_identity: bool,
    /// A platform identity endpoint was detected (or asserted by the operator).
    pub managed_identity_available: bool,
    /// App Service style identity endpoint. IMDS is used when unset.
    pub managed_identity_endpoint: Option<String>,
    pub managed_identity_header: Option<SecretString>,
    /// User-assigned identity client id.
    pub managed_identity_client_id: Option<String>,
    pub use_rotating_credentials: bool,
    /// Workspace URL hosting the credential-issuing API.
    pub workspace_url: Option<String>,
    pub personal_access_token: Option<SecretString>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub key_vault_url: Option<String>,
    pub client_secret_name: Option<String>,
    /// Already-issued database token.
    pub static_token: Option<SecretString>,
    /// Token authority override, e.g. a sovereign cloud login host.
    pub authority_host: Option<String>,
}

impl IdentityConfig {
    /// Tenant, client id and a way to obtain the client secret are all present.
    pub fn has_service_principal(&self) -> bool {
        let secret_source = self.client_secret.is_some()
            || (self.key_vault_url.is_some() && self.client_secret_name.is_some());
        self.tenant_id.is_some() && self.client_id.is_some() && secret_source
    }

    fn from_reader<F: Fn(&str) -> Option<String>>(env: &EnvReader<F>) -> Self {
        let managed_identity_endpoint = env.first(&["IDENTITY_ENDPOINT", "MSI_ENDPOINT"]);
        Self {
            use_managed_identity: env.flag("DATABASE_USE_MANAGED_IDENTITY"),
            managed_identity_available: managed_identity_endpoint.is_some()
                || env.flag("AZURE_MANAGED_IDENTITY_AVAILABLE"),
            managed_identity_endpoint,
            managed_identity_header: env.first_secret(&["IDENTITY_HEADER", "MSI_SECRET"]),
            managed_identity_client_id: env.opt("AZURE_MANAGED_IDENTITY_CLIENT_ID"),
            use_rotating_credentials: env.flag("DATABASE_USE_ROTATING_CREDENTIALS"),
            workspace_url: env.first(&["DATABRICKS_HOST", "DATABASE_WORKSPACE_URL"]),
            personal_access_token: env.secret("DATABRICKS_TOKEN"),
            tenant_id: env.first(&["AZURE_TENANT_ID", "ARM_TENANT_ID"]),
            client_id: env.first(&["AZURE_CLIENT_ID", "ARM_CLIENT_ID"]),
            client_secret: env.first_secret(&["AZURE_CLIENT_SECRET", "ARM_CLIENT_SECRET"]),
            key_vault_url: env.opt("AZURE_KEY_VAULT_URL"),
            client_secret_name: env.opt("DATABASE_CLIENT_SECRET_NAME"),
            static_token: env.secret("DATABASE_TOKEN"),
            authority_host: env.opt("AZURE_AUTHORITY_HOST"),
        }
    }
}

/// Where the pool connects to.
#[derive(Clone, Debug)]
pub struct DatabaseTarget {
    pub host: Option<String>,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    /// Database instance the credential-issuing API scopes tokens to.
    pub instance_name: Option<String>,
    pub connection_string: Option<SecretString>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub application_name: String,
    pub require_tls: bool,
}

impl Default for DatabaseTarget {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            username: None,
            instance_name: None,
            connection_string: None,
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            require_tls: true,
        }
    }
}

impl DatabaseTarget {
    fn from_reader<F: Fn(&str) -> Option<String>>(env: &EnvReader<F>) -> ConfigResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env.first(&["PGHOST", "DATABASE_HOST"]),
            port: env.parse("PGPORT")?.unwrap_or(defaults.port),
            database: env
                .first(&["PGDATABASE", "DATABASE_NAME"])
                .unwrap_or(defaults.database),
            username: env.first(&["PGUSER", "DATABASE_USER"]),
            instance_name: env.opt("DATABASE_INSTANCE_NAME"),
            connection_string: env.secret("DATABASE_URL"),
            max_connections: env
                .parse("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            min_connections: env
                .parse("DATABASE_MIN_CONNECTIONS")?
                .unwrap_or(defaults.min_connections),
            acquire_timeout: env
                .seconds("DATABASE_ACQUIRE_TIMEOUT_SECS")?
                .unwrap_or(defaults.acquire_timeout),
            application_name: env
                .opt("DATABASE_APPLICATION_NAME")
                .unwrap_or(defaults.application_name),
            require_tls: !env.flag("DATABASE_DISABLE_TLS"),
        })
    }
}

/// Inputs to session `search_path` resolution.
#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub schema_override: Option<String>,
    pub rotating_schema: Option<String>,
    /// Local or development deployment.
    pub local_dev: bool,
    pub namespace_prefix: String,
    pub default_schema: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            schema_override: None,
            rotating_schema: None,
            local_dev: false,
            namespace_prefix: DEFAULT_SCHEMA_PREFIX.to_string(),
            default_schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}

impl SchemaConfig {
    fn from_reader<F: Fn(&str) -> Option<String>>(env: &EnvReader<F>) -> Self {
        let defaults = Self::default();
        let local_dev = env
            .first(&["APP_ENV", "ENVIRONMENT"])
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "local" | "dev" | "development"))
            .unwrap_or(false);
        Self {
            schema_override: env.opt("DATABASE_SCHEMA"),
            rotating_schema: env.opt("DATABASE_ROTATING_SCHEMA"),
            local_dev,
            namespace_prefix: env
                .opt("DATABASE_SCHEMA_PREFIX")
                .unwrap_or(defaults.namespace_prefix),
            default_schema: env
                .opt("DATABASE_DEFAULT_SCHEMA")
                .unwrap_or(defaults.default_schema),
        }
    }
}

/// Credential refresh and pool rotation tuning.
#[derive(Clone, Debug)]
pub struct RotationConfig {
    pub refresh_interval: Duration,
    /// A cached credential is refetched this long before it expires.
    pub refresh_buffer: Duration,
    /// Upper bound on every credential-issuing HTTP call.
    pub fetch_timeout: Duration,
    /// How long a retired pool may take to drain before it is force-closed.
    pub drain_grace: Duration,
    pub startup_attempts: u32,
    pub fallback_password: Option<SecretString>,
    pub fallback_policy: FallbackPolicy,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
            startup_attempts: DEFAULT_STARTUP_ATTEMPTS,
            fallback_password: None,
            fallback_policy: FallbackPolicy::default(),
        }
    }
}

impl RotationConfig {
    fn from_reader<F: Fn(&str) -> Option<String>>(env: &EnvReader<F>) -> ConfigResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            refresh_interval: env
                .seconds("DATABASE_REFRESH_INTERVAL_SECS")?
                .unwrap_or(defaults.refresh_interval),
            refresh_buffer: env
                .seconds("DATABASE_REFRESH_BUFFER_SECS")?
                .unwrap_or(defaults.refresh_buffer),
            fetch_timeout: env
                .seconds("DATABASE_FETCH_TIMEOUT_SECS")?
                .unwrap_or(defaults.fetch_timeout),
            drain_grace: env
                .seconds("DATABASE_DRAIN_GRACE_SECS")?
                .unwrap_or(defaults.drain_grace),
            startup_attempts: env
                .parse("DATABASE_STARTUP_ATTEMPTS")?
                .unwrap_or(defaults.startup_attempts),
            fallback_password: env.first_secret(&["DATABASE_FALLBACK_PASSWORD", "PGPASSWORD"]),
            fallback_policy: env
                .parse("DATABASE_FALLBACK_POLICY")?
                .unwrap_or(defaults.fallback_policy),
        })
    }
}

/// Complete connector configuration.
#[derive(Clone, Debug, Default)]
pub struct ConnectorConfig {
    pub identity: IdentityConfig,
    pub database: DatabaseTarget,
    pub schema: SchemaConfig,
    pub rotation: RotationConfig,
}

impl ConnectorConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_reader(&EnvReader::process())
    }

    /// Read configuration from an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_reader(&EnvReader::new(lookup))
    }

    fn from_reader<F: Fn(&str) -> Option<String>>(env: &EnvReader<F>) -> ConfigResult<Self> {
        Ok(Self {
            identity: IdentityConfig::from_reader(env),
            database: DatabaseTarget::from_reader(env)?,
            schema: SchemaConfig::from_reader(env),
            rotation: RotationConfig::from_reader(env)?,
        })
    }

    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_database(mut self, database: DatabaseTarget) -> Self {
        self.database = database;
        self
    }

    pub fn with_rotation(mut self, rotation: RotationConfig) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_schema_override(mut self, schema: impl Into<String>) -> Self {
        self.schema.schema_override = Some(schema.into());
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.database.max_connections = max;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.rotation.refresh_interval = interval;
        self
    }

    pub fn with_fallback_password(mut self, password: impl Into<String>) -> Self {
        self.rotation.fallback_password = Some(SecretString::from(password.into()));
        self
    }

    /// Schema the per-connection `search_path` hook selects.
    pub fn resolved_schema(&self) -> String {
        super::schema::resolve_schema(
            &self.schema,
            self.database.username.as_deref(),
            self.identity.use_rotating_credentials || self.identity.use_managed_identity,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ConfigResult<ConnectorConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConnectorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.database.port, DEFAULT_PORT);
        assert_eq!(cfg.database.database, DEFAULT_DATABASE);
        assert!(cfg.database.require_tls);
        assert_eq!(cfg.rotation.refresh_interval, DEFAULT_REFRESH_INTERVAL);
        assert_eq!(cfg.rotation.refresh_buffer, DEFAULT_REFRESH_BUFFER);
        assert_eq!(cfg.rotation.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
        assert_eq!(cfg.rotation.fallback_policy, FallbackPolicy::ManagedIdentityOnly);
        assert!(!cfg.identity.managed_identity_available);
    }

    #[test]
    fn test_identity_detection() {
        let cfg = config(&[
            ("DATABASE_USE_MANAGED_IDENTITY", "true"),
            ("IDENTITY_ENDPOINT", "http://localhost:42356/msi/token"),
            ("IDENTITY_HEADER", "header-secret"),
        ])
        .unwrap();
        assert!(cfg.identity.use_managed_identity);
        assert!(cfg.identity.managed_identity_available);
        assert_eq!(
            cfg.identity
                .managed_identity_header
                .as_ref()
                .map(|h| h.expose_secret().to_string())
                .as_deref(),
            Some("header-secret")
        );
    }

    #[test]
    fn test_service_principal_completeness() {
        let partial = config(&[("AZURE_TENANT_ID", "t"), ("AZURE_CLIENT_ID", "c")]).unwrap();
        assert!(!partial.identity.has_service_principal());

        let with_secret = config(&[
            ("AZURE_TENANT_ID", "t"),
            ("AZURE_CLIENT_ID", "c"),
            ("AZURE_CLIENT_SECRET", "s"),
        ])
        .unwrap();
        assert!(with_secret.identity.has_service_principal());

        let with_vault = config(&[
            ("AZURE_TENANT_ID", "t"),
            ("AZURE_CLIENT_ID", "c"),
            ("AZURE_KEY_VAULT_URL", "https://vault.example"),
            ("DATABASE_CLIENT_SECRET_NAME", "sp-secret"),
        ])
        .unwrap();
        assert!(with_vault.identity.has_service_principal());
    }

    #[test]
    fn test_tuning_overrides() {
        let cfg = config(&[
            ("PGPORT", "6543"),
            ("DATABASE_REFRESH_INTERVAL_SECS", "600"),
            ("DATABASE_FALLBACK_POLICY", "never"),
            ("DATABASE_DISABLE_TLS", "1"),
        ])
        .unwrap();
        assert_eq!(cfg.database.port, 6543);
        assert_eq!(cfg.rotation.refresh_interval, Duration::from_secs(600));
        assert_eq!(cfg.rotation.fallback_policy, FallbackPolicy::Never);
        assert!(!cfg.database.require_tls);
    }

    #[test]
    fn test_invalid_number_fails() {
        assert!(config(&[("DATABASE_MAX_CONNECTIONS", "lots")]).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cfg = config(&[
            ("DATABRICKS_TOKEN", "dapi-very-secret"),
            ("DATABASE_FALLBACK_PASSWORD", "hunter2"),
        ])
        .unwrap();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("dapi-very-secret"));
        assert!(!rendered.contains("hunter2"));
    }
}
