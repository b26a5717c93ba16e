//! sqlx Postgres pools.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Executor, PgPool};

use super::{ManagedPool, PoolFactory};
use crate::auth::{Credential, Mode};
use crate::config::{ConfigError, ConnectorConfig};
use crate::{Error, Result};

#[async_trait]
impl ManagedPool for PgPool {
    async fn close(&self) {
        PgPool::close(self).await;
    }

    fn is_closed(&self) -> bool {
        PgPool::is_closed(self)
    }
}

/// Quote a Postgres identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds TLS-required Postgres pools whose password is the credential token.
///
/// Every new physical connection runs `SET search_path` for the resolved schema
/// before it is handed out.
#[derive(Clone, Debug)]
pub struct PgPoolFactory {
    options: PgConnectOptions,
    schema: String,
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
}

impl PgPoolFactory {
    pub fn new(options: PgConnectOptions, schema: impl Into<String>) -> Self {
        Self {
            options,
            schema: schema.into(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Connection options for `mode` from static configuration.
    pub fn from_config(config: &ConnectorConfig, mode: Mode) -> Result<Self> {
        let target = &config.database;

        let options = match mode {
            Mode::ConnectionString => {
                let url = target
                    .connection_string
                    .as_ref()
                    .ok_or_else(|| ConfigError::missing("DATABASE_URL"))?;
                PgConnectOptions::from_str(url.expose_secret()).map_err(|_| {
                    Error::configuration("DATABASE_URL is not a valid Postgres connection string")
                })?
            }
            _ => {
                let host = target
                    .host
                    .as_deref()
                    .ok_or_else(|| ConfigError::missing("PGHOST"))?;
                let user = mode
                    .database_user(config)
                    .ok_or_else(|| ConfigError::missing("PGUSER"))?;
                let ssl_mode = if target.require_tls {
                    PgSslMode::Require
                } else {
                    PgSslMode::Prefer
                };
                PgConnectOptions::new()
                    .host(host)
                    .port(target.port)
                    .database(&target.database)
                    .username(&user)
                    .ssl_mode(ssl_mode)
            }
        };

        let mut factory = Self::new(
            options.application_name(&target.application_name),
            config.resolved_schema(),
        );
        factory.max_connections = target.max_connections;
        factory.min_connections = target.min_connections;
        factory.acquire_timeout = target.acquire_timeout;
        Ok(factory)
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn search_path_statement(&self) -> String {
        format!("SET search_path TO {}", quote_ident(&self.schema))
    }
}

#[async_trait]
impl PoolFactory for PgPoolFactory {
    type Pool = PgPool;

    async fn build(&self, credential: &Credential) -> Result<PgPool> {
        let mut options = self.options.clone();
        if !credential.token().is_empty() {
            options = options.password(credential.token());
        }

        let statement = self.search_path_statement();
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .after_connect(move |conn, _meta| {
                let statement = statement.clone();
                Box::pin(async move {
                    conn.execute(statement.as_str()).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        tracing::debug!(
            schema = %self.schema,
            max_connections = self.max_connections,
            "Postgres pool connected"
        );
        Ok(pool)
    }
}
