//! Connector configuration.
//!
//! ```rust,no_run
//! use rotating_pg::config::ConnectorConfig;
//!
//! # fn example() -> Result<(), rotating_pg::config::ConfigError> {
//! let config = ConnectorConfig::from_env()?
//!     .with_max_connections(20)
//!     .with_schema_override("reporting");
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod schema;
pub mod settings;

pub use env::EnvReader;
pub use settings::{ConnectorConfig, DatabaseTarget, IdentityConfig, RotationConfig, SchemaConfig};

use thiserror::Error;

/// Errors that can occur while reading or validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required setting is absent.
    #[error("Missing required setting: {key}")]
    Missing {
        /// The setting that was not found
        key: String,
    },

    /// Setting is present but cannot be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The offending setting
        key: String,
        /// Parse failure
        message: String,
    },

    /// Settings contradict each other or select no usable mode.
    #[error("{0}")]
    Conflict(String),
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        ConfigError::Missing { key: key.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ConfigError::Conflict(message.into())
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
