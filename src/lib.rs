//! # rotating-pg
//!
//! Postgres connection pools whose password is a short-lived OAuth-issued token.
//!
//! The crate resolves which identity backend is configured, fetches database
//! credentials through it, caches them with a pre-expiry refresh buffer, and keeps a
//! live pool that is rebuilt and swapped (make-before-break) whenever the credential
//! rotates or a query reports that the credential went stale.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rotating_pg::{ConnectorConfig, DatabaseConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rotating_pg::Error> {
//!     let connector = DatabaseConnector::from_config(ConnectorConfig::from_env()?)?;
//!     connector.start().await?;
//!
//!     let pool = connector.current_pool().await?;
//!     let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&*pool).await?;
//!     println!("{}", row.0);
//!
//!     connector.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Recovering from stale credentials
//!
//! ```rust,no_run
//! # async fn run(connector: rotating_pg::DatabaseConnector) -> rotating_pg::Result<()> {
//! let count: i64 = connector
//!     .run_with_auth_retry(|pool| async move {
//!         let row: (i64,) = sqlx::query_as("SELECT count(*) FROM items")
//!             .fetch_one(&*pool)
//!             .await?;
//!         Ok::<_, rotating_pg::Error>(row.0)
//!     })
//!     .await?;
//! # let _ = count;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod config;
pub mod connector;
pub mod observability;
pub mod pool;
pub mod refresh;

pub use auth::{
    CachedCredential, ClientSecretSource, Credential, CredentialExchange, CredentialOrigin,
    CredentialProvider, EnvSecretStore, FallbackPolicy, FallbackProvider, IdentityToken,
    IdentityTokenSource, KeyVaultSecretStore, ManagedIdentityProvider, ManagedIdentitySource,
    Mode, PersonalAccessTokenProvider, SecretStore, ServicePrincipalKind,
    ServicePrincipalProvider, StaticTokenProvider, TokenCache,
};
#[cfg(feature = "azure")]
pub use auth::AzureCredentialSource;
pub use config::{
    ConfigError, ConnectorConfig, DatabaseTarget, IdentityConfig, RotationConfig, SchemaConfig,
};
pub use connector::{DatabaseConnector, DatabaseConnectorBuilder, HealthStatus};
pub use observability::{RotationStats, StatsSnapshot};
pub use pool::{
    InMemoryPool, ManagedPool, MemoryPoolFactory, PgPoolFactory, PoolFactory, PoolHandle,
    PoolSupervisor, ReadinessGate,
};
pub use refresh::{RefreshOutcome, RefreshScheduler, Refreshable, StartupRetry};

/// SQLSTATE codes Postgres reports when a login credential is rejected.
const AUTH_FAILURE_SQLSTATES: &[&str] = &["28000", "28P01"];

/// Error type for connector operations.
///
/// Messages never carry token or password material.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Settings are missing or contradictory; the connector cannot run safely.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The credential-issuing backend could not be reached or failed transiently.
    #[error("Credential fetch failed: {message}")]
    CredentialFetch { message: String },

    /// The credential-issuing backend rejected the presented identity.
    #[error("Authentication failed{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Authentication {
        message: String,
        status: Option<u16>,
    },

    /// The backend answered, but the credential it returned is unusable.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// No pool has been installed yet.
    #[error("Connection pool is not ready yet")]
    PoolNotReady,

    /// The connector has been shut down.
    #[error("Connector has been shut down")]
    ShutDown,

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation exceeded timeout.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(std::time::Duration),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fatal at startup.
    Configuration,
    /// Credential rejected, either by the issuer or by the database.
    Authentication,
    /// Network or backend hiccups that may succeed on retry.
    Transient,
    /// Pool not installed yet, or already shut down.
    Unavailable,
    /// Malformed data and unexpected driver errors.
    Internal,
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Error::CredentialFetch {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Authentication {
            message: message.into(),
            status,
        }
    }

    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Error::InvalidCredential(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Configuration(_) => ErrorCategory::Configuration,
            Error::Authentication { .. } => ErrorCategory::Authentication,
            Error::Database(e) if is_auth_sqlstate(e) => ErrorCategory::Authentication,
            Error::CredentialFetch { .. } | Error::Timeout(_) => ErrorCategory::Transient,
            Error::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_),
            ) => ErrorCategory::Transient,
            Error::PoolNotReady | Error::ShutDown => ErrorCategory::Unavailable,
            Error::Database(sqlx::Error::PoolClosed) => ErrorCategory::Unavailable,
            Error::InvalidCredential(_) | Error::Database(_) | Error::Json(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// True when the failure means the presented credential is stale or rejected.
    pub fn is_authentication_failure(&self) -> bool {
        self.category() == ErrorCategory::Authentication
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::Unavailable
        ) && !matches!(self, Error::ShutDown)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Authentication { status, .. } => *status,
            _ => None,
        }
    }
}

fn is_auth_sqlstate(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| AUTH_FAILURE_SQLSTATES.iter().any(|s| code == *s)),
        _ => false,
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            Error::fetch(format!("request timed out: {}", err))
        } else {
            Error::fetch(err.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
