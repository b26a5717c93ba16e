//! Connector facade: startup, scheduled refresh, recovery and shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::auth::{CredentialProvider, Mode, TokenCache, build_provider};
use crate::config::{ConfigError, ConnectorConfig};
use crate::observability::{RotationStats, StatsSnapshot};
use crate::pool::{PgPoolFactory, PoolFactory, PoolHandle, PoolSupervisor};
use crate::refresh::{RefreshOutcome, RefreshScheduler, Refreshable, StartupRetry};
use crate::{Error, Result};

/// Connector health as reported to readiness probes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    /// No pool installed yet.
    NotReady,
    Ready { generation: u64 },
    /// A pool is installed but the last refresh failed, or the connector is shut down.
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Ready { .. })
    }
}

struct Inner<F: PoolFactory> {
    mode: Mode,
    cache: TokenCache,
    supervisor: PoolSupervisor<F>,
    stats: RotationStats,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_interval: Duration,
    retry: StartupRetry,
    scheduler: Mutex<Option<RefreshScheduler>>,
    shut_down: AtomicBool,
}

impl<F: PoolFactory> Inner<F> {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Make sure the installed pool's credential stays valid for `horizon`, rotating
    /// the pool if the cache hands back a different credential.
    async fn refresh(&self, horizon: Duration) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;
        self.ensure_running()?;

        let started = Instant::now();
        let result = self.refresh_locked(horizon).await;
        match &result {
            Ok(_) => self.stats.record_refresh(started.elapsed()),
            Err(e) => self.stats.record_failure(e),
        }
        result
    }

    async fn refresh_locked(&self, horizon: Duration) -> Result<RefreshOutcome> {
        let credential = self.cache.get_credential_valid_for(horizon).await?;
        if credential.is_fallback() {
            self.stats.record_fallback();
        }

        if let Some(installed) = self.supervisor.current_credential()
            && installed.same_as(&credential)
        {
            return Ok(RefreshOutcome::Unchanged);
        }

        let expires_at = credential.expires_at();
        let generation = self.supervisor.rotate(credential).await?;
        self.stats.record_rotation(generation, expires_at);
        Ok(RefreshOutcome::Rotated { generation })
    }

    /// Rebuild the pool after `failed_generation` reported an authentication error.
    ///
    /// Callers reporting a generation that has already been replaced get
    /// `AlreadyRecovered` without another rebuild.
    async fn recover(&self, failed_generation: u64) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;
        self.ensure_running()?;

        let current = self.supervisor.generation();
        if current != failed_generation {
            return Ok(RefreshOutcome::AlreadyRecovered {
                generation: current,
            });
        }

        let started = Instant::now();
        self.cache.clear().await;
        let result: Result<RefreshOutcome> = async {
            let credential = self.cache.get_credential().await?;
            let expires_at = credential.expires_at();
            let generation = self.supervisor.rotate(credential).await?;
            self.stats.record_rotation(generation, expires_at);
            self.stats.record_recovery();
            Ok(RefreshOutcome::Rotated { generation })
        }
        .await;

        match &result {
            Ok(_) => self.stats.record_refresh(started.elapsed()),
            Err(e) => self.stats.record_failure(e),
        }
        result
    }
}

/// Scheduler target that does not keep the connector alive.
struct ScheduledRefresh<F: PoolFactory>(Weak<Inner<F>>);

#[async_trait]
impl<F: PoolFactory> Refreshable for ScheduledRefresh<F> {
    async fn refresh(&self, horizon: Duration) -> Result<RefreshOutcome> {
        match self.0.upgrade() {
            Some(inner) => inner.refresh(horizon).await,
            None => Err(Error::ShutDown),
        }
    }
}

/// Owns the credential cache, the live pool and the refresh schedule.
///
/// Cheap to clone; clones share state.
pub struct DatabaseConnector<F: PoolFactory = PgPoolFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: PoolFactory> Clone for DatabaseConnector<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl DatabaseConnector<PgPoolFactory> {
    /// Resolve the mode and wire a Postgres connector from configuration.
    ///
    /// Performs no I/O; call [`start`](Self::start) to fetch the first credential.
    pub fn from_config(config: ConnectorConfig) -> Result<Self> {
        let mode = Mode::resolve(&config)?;
        let factory = PgPoolFactory::from_config(&config, mode)?;
        DatabaseConnector::builder(config, factory)
            .with_mode(mode)
            .build()
    }

    /// [`from_config`](Self::from_config) over the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_config(ConnectorConfig::from_env()?)
    }
}

impl<F: PoolFactory> DatabaseConnector<F> {
    pub fn builder(config: ConnectorConfig, factory: F) -> DatabaseConnectorBuilder<F> {
        DatabaseConnectorBuilder::new(config, factory)
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Fetch the first credential, install the first pool and start the refresh
    /// schedule for rotating modes.
    ///
    /// Transient failures are retried with backoff; authentication and configuration
    /// failures return immediately. On failure the readiness gate stays closed.
    pub async fn start(&self) -> Result<()> {
        self.inner.ensure_running()?;
        let mode = self.inner.mode;

        if !self.inner.supervisor.readiness().is_open() {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.inner.refresh(Duration::ZERO).await {
                    Ok(_) => break,
                    Err(e) => match self.inner.retry.delay_after(attempt, &e) {
                        Some(delay) => {
                            tracing::warn!(
                                mode = %mode,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Startup credential fetch failed, retrying: {}",
                                e
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(
                                mode = %mode,
                                attempt,
                                category = ?e.category(),
                                "Database connector failed to start: {}",
                                e
                            );
                            return Err(e);
                        }
                    },
                }
            }
        }

        if self.inner.cache.is_rotating() {
            let mut scheduler = self.inner.scheduler.lock().unwrap_or_else(|e| e.into_inner());
            if scheduler.is_none() {
                let target = Arc::new(ScheduledRefresh(Arc::downgrade(&self.inner)));
                *scheduler = Some(RefreshScheduler::spawn(target, self.inner.refresh_interval));
            }
        }

        tracing::info!(
            mode = %mode,
            provider = self.inner.cache.provider_name(),
            generation = self.inner.supervisor.generation(),
            rotating = self.inner.cache.is_rotating(),
            "Database connector ready"
        );
        Ok(())
    }

    /// Wait for the first pool, then return whichever pool is current.
    pub async fn current_pool(&self) -> Result<PoolHandle<F::Pool>> {
        self.inner.supervisor.current_pool().await
    }

    /// Current pool, or `PoolNotReady` before startup completes.
    pub fn try_current_pool(&self) -> Result<PoolHandle<F::Pool>> {
        self.inner.supervisor.try_current_pool()
    }

    /// Resolves once the first pool is installed. Never resolves if startup fails.
    pub async fn wait_until_ready(&self) {
        self.inner.supervisor.readiness().wait().await;
    }

    pub fn is_ready(&self) -> bool {
        self.inner.supervisor.is_ready()
    }

    /// Report that a query on `failed` was rejected for authentication reasons.
    ///
    /// Clears the cached credential, fetches a new one and swaps in a new pool.
    /// Returns whether a working pool is now installed.
    pub async fn on_authentication_error(&self, failed: &PoolHandle<F::Pool>) -> bool {
        match self.inner.recover(failed.generation()).await {
            Ok(outcome) => {
                tracing::info!(
                    failed_generation = failed.generation(),
                    ?outcome,
                    "Recovered from authentication failure"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    failed_generation = failed.generation(),
                    category = ?e.category(),
                    "Authentication recovery failed: {}",
                    e
                );
                false
            }
        }
    }

    /// Refresh now without waiting for the next tick.
    pub async fn force_refresh(&self) -> Result<RefreshOutcome> {
        self.inner.recover(self.inner.supervisor.generation()).await
    }

    /// Run `op` against the current pool, recovering and retrying once if it fails
    /// with an authentication error.
    pub async fn run_with_auth_retry<T, Op, Fut>(&self, op: Op) -> Result<T>
    where
        Op: Fn(PoolHandle<F::Pool>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.current_pool().await?;
        match op(handle.clone()).await {
            Err(e) if e.is_authentication_failure() => {
                tracing::debug!(
                    generation = handle.generation(),
                    "Query rejected credential, recovering: {}",
                    e
                );
                if !self.on_authentication_error(&handle).await {
                    return Err(e);
                }
                op(self.current_pool().await?).await
            }
            other => other,
        }
    }

    pub fn health(&self) -> HealthStatus {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return HealthStatus::Unhealthy {
                reason: "connector shut down".to_string(),
            };
        }
        if !self.inner.supervisor.readiness().is_open() {
            return HealthStatus::NotReady;
        }
        match self.inner.stats.last_failure() {
            Some(failure) => HealthStatus::Unhealthy {
                reason: format!("{:?}: {}", failure.category, failure.message),
            },
            None => HealthStatus::Ready {
                generation: self.inner.supervisor.generation(),
            },
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn supervisor(&self) -> &PoolSupervisor<F> {
        &self.inner.supervisor
    }

    pub fn cache(&self) -> &TokenCache {
        &self.inner.cache
    }

    /// Stop refreshing, close every pool and forget the credential. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            self.inner.supervisor.shutdown().await;
            return;
        }

        let scheduler = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        self.inner.supervisor.shutdown().await;
        self.inner.cache.clear().await;
        tracing::info!(mode = %self.inner.mode, "Database connector shut down");
    }
}

impl<F: PoolFactory> std::fmt::Debug for DatabaseConnector<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnector")
            .field("mode", &self.inner.mode)
            .field("cache", &self.inner.cache)
            .field("supervisor", &self.inner.supervisor)
            .finish()
    }
}

/// Builder for [`DatabaseConnector`] with injectable provider and pool factory.
pub struct DatabaseConnectorBuilder<F: PoolFactory> {
    config: ConnectorConfig,
    factory: F,
    mode: Option<Mode>,
    provider: Option<Arc<dyn CredentialProvider>>,
    retry: Option<StartupRetry>,
}

impl<F: PoolFactory> DatabaseConnectorBuilder<F> {
    pub fn new(config: ConnectorConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            mode: None,
            provider: None,
            retry: None,
        }
    }

    /// Skip mode resolution.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Use this provider instead of the one the mode implies.
    pub fn with_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Replace the startup retry policy built from `startup_attempts`.
    pub fn with_retry(mut self, retry: StartupRetry) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<DatabaseConnector<F>> {
        let rotation = &self.config.rotation;
        if rotation.refresh_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_REFRESH_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }

        let mode = match self.mode {
            Some(mode) => mode,
            None => Mode::resolve(&self.config)?,
        };
        let provider = match self.provider {
            Some(provider) => provider,
            None => build_provider(mode, &self.config)?,
        };

        tracing::info!(
            mode = %mode,
            provider = provider.name(),
            refresh_interval_secs = rotation.refresh_interval.as_secs(),
            "Database connector configured"
        );

        let inner = Inner {
            mode,
            cache: TokenCache::new(provider).with_buffer(rotation.refresh_buffer),
            supervisor: PoolSupervisor::new(self.factory).with_drain_grace(rotation.drain_grace),
            stats: RotationStats::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_interval: rotation.refresh_interval,
            retry: self
                .retry
                .unwrap_or_else(|| StartupRetry::new(rotation.startup_attempts)),
            scheduler: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        };
        Ok(DatabaseConnector {
            inner: Arc::new(inner),
        })
    }
}
