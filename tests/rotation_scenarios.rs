//! Connector lifecycle scenarios: startup, scheduled rotation, authentication recovery
//! and shutdown, driven through the in-memory pool.
//!
//! Run: cargo nextest run --test rotation_scenarios

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rotating_pg::auth::exchange::DATABASE_CREDENTIALS_PATH;
use rotating_pg::{
    ConnectorConfig, Credential, CredentialExchange, CredentialProvider, DatabaseConnector,
    CredentialOrigin, Error, FallbackProvider, HealthStatus, ManagedPool, MemoryPoolFactory, Mode,
    PersonalAccessTokenProvider, RefreshOutcome, ServicePrincipalKind, StartupRetry,
    StaticTokenProvider,
};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOCAL_SP: Mode = Mode::ServicePrincipal(ServicePrincipalKind::Local);

/// Issues `token-1`, `token-2`, ... each valid for `lifetime`.
struct IssuingProvider {
    calls: AtomicUsize,
    lifetime: chrono::Duration,
    failures_remaining: AtomicUsize,
}

impl IssuingProvider {
    fn hourly() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
            failures_remaining: AtomicUsize::new(0),
        }
    }

    fn failing_first(n: usize) -> Self {
        let provider = Self::hourly();
        provider.failures_remaining.store(n, Ordering::SeqCst);
        provider
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for IssuingProvider {
    fn name(&self) -> &str {
        "issuing"
    }

    async fn fetch(&self) -> rotating_pg::Result<Credential> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::fetch("issuer returned HTTP 503"));
        }
        Credential::issued(format!("token-{}", n), Utc::now() + self.lifetime)
    }
}

fn connector_with(
    mode: Mode,
    provider: Arc<dyn CredentialProvider>,
) -> DatabaseConnector<MemoryPoolFactory> {
    DatabaseConnector::builder(ConnectorConfig::default(), MemoryPoolFactory::new())
        .with_mode(mode)
        .with_provider(provider)
        .with_retry(
            StartupRetry::new(3)
                .with_delays(Duration::from_millis(10), Duration::from_millis(50))
                .without_jitter(),
        )
        .build()
        .unwrap()
}

// =============================================================================
// Startup
// =============================================================================

mod startup_tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_ready() {
        let provider = StaticTokenProvider::token(&SecretString::from("static".to_string()));
        let connector = connector_with(Mode::StaticToken, Arc::new(provider));

        connector.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), connector.wait_until_ready())
            .await
            .unwrap();

        let pool = connector.current_pool().await.unwrap();
        pool.execute().await.unwrap();
        assert_eq!(pool.credential().token(), "static");
        assert_eq!(connector.health(), HealthStatus::Ready { generation: 1 });
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiters_released_by_start() {
        let connector = connector_with(LOCAL_SP, Arc::new(IssuingProvider::hourly()));
        assert!(matches!(connector.try_current_pool(), Err(Error::PoolNotReady)));

        let waiter = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.current_pool().await.map(|p| p.generation()) })
        };
        connector.start().await.unwrap();

        let generation = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(generation, 1);
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_forbidden_exchange_fails_startup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DATABASE_CREDENTIALS_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error_code": "PERMISSION_DENIED",
                "message": "not allowed",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exchange =
            CredentialExchange::with_client(reqwest::Client::new(), &server.uri(), "orders-db")
                .unwrap();
        let provider = PersonalAccessTokenProvider::new(
            SecretString::from("dapi-local".to_string()),
            exchange,
        );
        let connector = connector_with(LOCAL_SP, Arc::new(provider));

        let err = connector.start().await.unwrap_err();
        assert!(err.is_authentication_failure());
        assert!(!err.is_retryable());

        assert!(
            tokio::time::timeout(Duration::from_millis(200), connector.wait_until_ready())
                .await
                .is_err()
        );
        assert_eq!(connector.health(), HealthStatus::NotReady);
        assert_eq!(connector.supervisor().factory().build_count(), 0);
    }

    #[tokio::test]
    async fn test_forbidden_exchange_with_fallback_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DATABASE_CREDENTIALS_PATH))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let exchange =
            CredentialExchange::with_client(reqwest::Client::new(), &server.uri(), "orders-db")
                .unwrap();
        let provider = FallbackProvider::new(
            PersonalAccessTokenProvider::new(SecretString::from("dapi".to_string()), exchange),
            SecretString::from("static-password".to_string()),
        );
        let connector = connector_with(Mode::ManagedIdentity, Arc::new(provider));

        connector.start().await.unwrap();
        let pool = connector.current_pool().await.unwrap();
        assert!(pool.credential().is_fallback());
        assert_eq!(connector.stats().fallbacks, 1);
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_startup_failures_retried() {
        let provider = Arc::new(IssuingProvider::failing_first(2));
        let connector = connector_with(LOCAL_SP, provider.clone());

        connector.start().await.unwrap();
        assert_eq!(provider.calls(), 3);
        assert_eq!(connector.stats().failures, 2);
        assert!(connector.health().is_ready());
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_gives_up_after_attempts() {
        let provider = Arc::new(IssuingProvider::failing_first(10));
        let connector = connector_with(LOCAL_SP, provider.clone());

        let err = connector.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(provider.calls(), 3);
        assert!(!connector.is_ready());
    }
}

// =============================================================================
// Scheduled rotation
// =============================================================================

mod rotation_tests {
    use super::*;

    const TICK: Duration = Duration::from_secs(50 * 60);

    #[tokio::test(start_paused = true)]
    async fn test_tick_rotates_without_interrupting_queries() {
        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();
        let old = connector.current_pool().await.unwrap();
        assert_eq!(old.credential().token(), "token-1");

        // A query starts one second before the tick and outlives it.
        tokio::time::sleep(TICK - Duration::from_secs(1)).await;
        let query = {
            let pool = old.pool().clone();
            tokio::spawn(async move { pool.query_for(Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        let new = connector.try_current_pool().unwrap();
        assert_eq!(new.generation(), 2);
        assert_eq!(new.credential().token(), "token-2");
        assert_eq!(provider.calls(), 2);
        assert!(old.is_closed());
        assert_eq!(old.in_flight(), 1);

        query.await.unwrap().unwrap();
        new.execute().await.unwrap();

        let stats = connector.stats();
        assert_eq!(stats.rotations, 2);
        assert_eq!(stats.generation, 2);
        connector.shutdown().await;
        assert_eq!(old.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_keeps_pool_and_reports_unhealthy() {
        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();

        provider.failures_remaining.store(1, Ordering::SeqCst);
        tokio::time::sleep(TICK + Duration::from_secs(1)).await;

        let current = connector.try_current_pool().unwrap();
        assert_eq!(current.generation(), 1);
        assert!(!current.is_closed());
        assert!(matches!(connector.health(), HealthStatus::Unhealthy { .. }));

        // The next tick succeeds and restores health.
        tokio::time::sleep(TICK).await;
        assert_eq!(connector.try_current_pool().unwrap().generation(), 2);
        assert!(connector.health().is_ready());
        connector.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_mode_never_refreshes() {
        let provider = StaticTokenProvider::token(&SecretString::from("static".to_string()));
        let connector = connector_with(Mode::StaticToken, Arc::new(provider));
        connector.start().await.unwrap();

        tokio::time::sleep(TICK * 4).await;
        assert_eq!(connector.stats().refreshes, 1);
        assert_eq!(connector.supervisor().factory().build_count(), 1);
        connector.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_replaces_fallback_once_primary_recovers() {
        let provider = Arc::new(FallbackProvider::new(
            IssuingProvider::failing_first(1),
            SecretString::from("static-password".to_string()),
        ));
        let connector = connector_with(Mode::ManagedIdentity, provider.clone());
        connector.start().await.unwrap();

        let fallback = connector.current_pool().await.unwrap();
        assert!(fallback.credential().is_fallback());
        assert_eq!(fallback.generation(), 1);

        tokio::time::sleep(TICK + Duration::from_secs(1)).await;

        let current = connector.try_current_pool().unwrap();
        assert_eq!(current.generation(), 2);
        assert_eq!(current.credential().origin(), CredentialOrigin::Issued);
        assert_eq!(current.credential().token(), "token-2");
        assert!(fallback.is_closed());
        assert_eq!(provider.inner().calls(), 2);
        assert_eq!(connector.stats().fallbacks, 1);
        assert!(connector.health().is_ready());
        connector.shutdown().await;
    }
}

// =============================================================================
// Authentication recovery
// =============================================================================

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_auth_error_rebuilds_with_fresh_credential() {
        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();

        let stale = connector.current_pool().await.unwrap();
        stale.revoke();
        let err = stale.execute().await.unwrap_err();
        assert!(err.is_authentication_failure());

        assert!(connector.on_authentication_error(&stale).await);
        assert_eq!(provider.calls(), 2);

        let token = connector.cache().get_token().await.unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(&token), "token-2");
        let fresh = connector.current_pool().await.unwrap();
        assert_eq!(fresh.generation(), 2);
        fresh.execute().await.unwrap();
        assert_eq!(connector.stats().recoveries, 1);
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_auth_errors_rebuild_once() {
        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();
        let stale = connector.current_pool().await.unwrap();

        let (a, b) = tokio::join!(
            connector.on_authentication_error(&stale),
            connector.on_authentication_error(&stale)
        );
        assert!(a && b);
        assert_eq!(connector.supervisor().factory().build_count(), 2);
        assert_eq!(provider.calls(), 2);
        assert_eq!(connector.try_current_pool().unwrap().generation(), 2);

        let outcome = connector.force_refresh().await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Rotated { generation: 3 }));
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_with_auth_retry_retries_once() {
        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();
        connector.current_pool().await.unwrap().revoke();

        let attempts = AtomicUsize::new(0);
        let generation = connector
            .run_with_auth_retry(|pool| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    pool.execute().await?;
                    Ok::<_, Error>(pool.generation())
                }
            })
            .await
            .unwrap();
        assert_eq!(generation, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_recovery_returns_false() {
        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();
        let stale = connector.current_pool().await.unwrap();

        connector.supervisor().factory().reject_token("token-2");
        assert!(!connector.on_authentication_error(&stale).await);
        assert_eq!(connector.try_current_pool().unwrap().generation(), 1);
        assert!(matches!(connector.health(), HealthStatus::Unhealthy { .. }));
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_auth_errors_not_retried() {
        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();

        let attempts = AtomicUsize::new(0);
        let err = connector
            .run_with_auth_retry(|_pool| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Database(sqlx::Error::RowNotFound)) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(sqlx::Error::RowNotFound)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        connector.shutdown().await;
    }
}

// =============================================================================
// Shutdown
// =============================================================================

mod shutdown_tests {
    use super::*;

    #[tokio::test]
    async fn test_double_shutdown_closes_once() {
        let connector = connector_with(LOCAL_SP, Arc::new(IssuingProvider::hourly()));
        connector.start().await.unwrap();
        let pool = connector.current_pool().await.unwrap();

        connector.shutdown().await;
        connector.shutdown().await;

        assert!(pool.is_closed());
        assert_eq!(pool.close_count(), 1);
        assert!(matches!(connector.current_pool().await, Err(Error::ShutDown)));
        assert!(!connector.on_authentication_error(&pool).await);
    }

    #[tokio::test]
    async fn test_shutdown_retires_rotated_pools_once() {
        let connector = connector_with(LOCAL_SP, Arc::new(IssuingProvider::hourly()));
        connector.start().await.unwrap();
        connector.force_refresh().await.unwrap();

        connector.shutdown().await;
        let pools = connector.supervisor().factory().pools();
        assert_eq!(pools.len(), 2);
        assert!(pools.iter().all(|p| p.is_closed() && p.close_count() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_started_connector_stops_refresh_task() {
        let metrics = tokio::runtime::Handle::current().metrics();
        let baseline = metrics.num_alive_tasks();

        let provider = Arc::new(IssuingProvider::hourly());
        let connector = connector_with(LOCAL_SP, provider.clone());
        connector.start().await.unwrap();
        assert_eq!(metrics.num_alive_tasks(), baseline + 1);

        drop(connector);
        tokio::time::sleep(Duration::from_secs(5 * 50 * 60)).await;

        assert_eq!(metrics.num_alive_tasks(), baseline);
        assert_eq!(provider.calls(), 1);
        assert_eq!(Arc::strong_count(&provider), 1);
    }
}
