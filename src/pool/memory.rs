//! In-memory pool for tests and dry runs.
//!
//! Connections are counted guards rather than sockets, so drain and make-before-break
//! behavior can be observed without a database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ManagedPool, PoolFactory};
use crate::auth::Credential;
use crate::{Error, Result};

struct PoolState {
    id: u64,
    credential: Credential,
    closed: AtomicBool,
    revoked: AtomicBool,
    in_flight: AtomicUsize,
    close_calls: AtomicUsize,
    idle: Notify,
}

/// Pool whose connections are in-process guards.
#[derive(Clone)]
pub struct InMemoryPool {
    state: Arc<PoolState>,
}

impl InMemoryPool {
    pub fn new(id: u64, credential: Credential) -> Self {
        Self {
            state: Arc::new(PoolState {
                id,
                credential,
                closed: AtomicBool::new(false),
                revoked: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Build order within the factory, starting at 1.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn credential(&self) -> &Credential {
        &self.state.credential
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Check out a connection. Fails once the pool is closed.
    pub fn acquire(&self) -> Result<InMemoryConnection> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            state: self.state.clone(),
        })
    }

    /// Times [`close`](ManagedPool::close) has been called.
    pub fn close_count(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Run a trivial query.
    pub async fn execute(&self) -> Result<()> {
        self.query_for(Duration::ZERO).await
    }

    /// Run a query that holds its connection for `work`. Fails with an authentication
    /// error once the credential has been revoked.
    pub async fn query_for(&self, work: Duration) -> Result<()> {
        let _conn = self.acquire()?;
        if work.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(work).await;
        }
        if self.state.revoked.load(Ordering::SeqCst) {
            return Err(Error::authentication(
                "password authentication failed",
                None,
            ));
        }
        Ok(())
    }

    /// Simulate the database no longer accepting this pool's credential.
    pub fn revoke(&self) {
        self.state.revoked.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for InMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPool")
            .field("id", &self.state.id)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[async_trait]
impl ManagedPool for InMemoryPool {
    async fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

/// Checked-out connection; returning it is dropping it.
pub struct InMemoryConnection {
    state: Arc<PoolState>,
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if self.state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// Factory producing [`InMemoryPool`]s, with knobs for failure injection.
#[derive(Default)]
pub struct MemoryPoolFactory {
    built: AtomicU64,
    failures_remaining: AtomicUsize,
    rejected: Mutex<HashSet<String>>,
    pools: Mutex<Vec<InMemoryPool>>,
}

impl MemoryPoolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` builds with a transient error.
    pub fn fail_next_builds(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Refuse to build pools for this password, as a database rejecting it would.
    pub fn reject_token(&self, token: impl Into<String>) {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.into());
    }

    /// Number of pools successfully built.
    pub fn build_count(&self) -> u64 {
        self.built.load(Ordering::SeqCst)
    }

    /// Every pool built so far, oldest first.
    pub fn pools(&self) -> Vec<InMemoryPool> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PoolFactory for MemoryPoolFactory {
    type Pool = InMemoryPool;

    async fn build(&self, credential: &Credential) -> Result<InMemoryPool> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }

        let rejected = self
            .rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(credential.token());
        if rejected {
            return Err(Error::authentication(
                "password authentication failed",
                None,
            ));
        }

        let id = self.built.fetch_add(1, Ordering::SeqCst) + 1;
        let pool = InMemoryPool::new(id, credential.clone());
        self.pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pool.clone());
        Ok(pool)
    }
}
