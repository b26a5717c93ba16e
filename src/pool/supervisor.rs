//! Make-before-break pool ownership.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::task::TaskTracker;

use super::{ManagedPool, PoolFactory, PoolHandle, ReadinessGate};
use crate::auth::Credential;
use crate::config::settings::DEFAULT_DRAIN_GRACE;
use crate::{Error, Result};

struct Installed<P> {
    pool: P,
    generation: u64,
    credential: Credential,
}

/// Owns the live pool.
///
/// The slot lock is held only for the pointer swap. Retired pools are closed on a
/// background tracker so in-flight queries on them run to completion (bounded by the
/// drain grace period) while new acquisitions already see the replacement.
pub struct PoolSupervisor<F: PoolFactory> {
    factory: F,
    slot: RwLock<Option<Installed<F::Pool>>>,
    generation: AtomicU64,
    ready: ReadinessGate,
    drains: TaskTracker,
    drain_grace: Duration,
    closed: AtomicBool,
}

impl<F: PoolFactory> PoolSupervisor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
            ready: ReadinessGate::new(),
            drains: TaskTracker::new(),
            drain_grace: DEFAULT_DRAIN_GRACE,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn readiness(&self) -> &ReadinessGate {
        &self.ready
    }

    /// Build a pool for `credential` without installing it.
    pub async fn build_pool(&self, credential: &Credential) -> Result<F::Pool> {
        self.factory.build(credential).await
    }

    /// Build and install. On build failure the installed pool is untouched.
    pub async fn rotate(&self, credential: Credential) -> Result<u64> {
        let pool = self.build_pool(&credential).await?;
        self.install(pool, credential)
    }

    /// Install `pool` as current and retire the previous one.
    ///
    /// Returns the new generation. After shutdown the pool is closed instead.
    pub fn install(&self, pool: F::Pool, credential: Credential) -> Result<u64> {
        let (generation, previous) = {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            // `shutdown` sets the flag before it empties the slot, so checking under the
            // lock means any pool installed here is either taken by shutdown or closed now.
            if self.is_shut_down() {
                drop(slot);
                self.drains.spawn(async move { pool.close().await });
                return Err(Error::ShutDown);
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let previous = slot.replace(Installed {
                pool,
                generation,
                credential,
            });
            (generation, previous)
        };
        self.ready.open();

        if let Some(old) = previous {
            tracing::info!(
                generation,
                retired_generation = old.generation,
                "Connection pool swapped"
            );
            self.retire(old.pool, old.generation);
        } else {
            tracing::info!(generation, "Connection pool installed");
        }
        Ok(generation)
    }

    /// Installed pool, or `None` before the first install and after shutdown.
    pub fn current(&self) -> Option<PoolHandle<F::Pool>> {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .map(|installed| PoolHandle::new(installed.pool.clone(), installed.generation))
    }

    /// Credential the installed pool authenticates with.
    pub fn current_credential(&self) -> Option<Credential> {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|installed| installed.credential.clone())
    }

    /// Generation of the installed pool; 0 before the first install.
    pub fn generation(&self) -> u64 {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|installed| installed.generation).unwrap_or(0)
    }

    /// Wait for the first install, then return the current pool.
    pub async fn current_pool(&self) -> Result<PoolHandle<F::Pool>> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        self.ready.wait().await;
        self.try_current_pool()
    }

    /// Current pool without waiting.
    pub fn try_current_pool(&self) -> Result<PoolHandle<F::Pool>> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        self.current().ok_or(Error::PoolNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_open() && !self.is_shut_down()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pools retired but not yet fully closed.
    pub fn draining(&self) -> usize {
        self.drains.len()
    }

    /// Close the installed pool and wait for every drain. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.drains.wait().await;
            return;
        }

        let current = {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(installed) = current {
            self.retire(installed.pool, installed.generation);
        }

        self.drains.close();
        self.drains.wait().await;
        tracing::info!("Connection pools closed");
    }

    fn retire(&self, pool: F::Pool, generation: u64) {
        let grace = self.drain_grace;
        self.drains.spawn(async move {
            match tokio::time::timeout(grace, pool.close()).await {
                Ok(()) => tracing::debug!(generation, "Retired pool drained"),
                Err(_) => tracing::warn!(
                    generation,
                    grace_secs = grace.as_secs(),
                    "Retired pool did not drain within grace period, abandoning in-flight connections"
                ),
            }
        });
    }
}

impl<F: PoolFactory> std::fmt::Debug for PoolSupervisor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSupervisor")
            .field("generation", &self.generation())
            .field("ready", &self.ready.is_open())
            .field("draining", &self.draining())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pool::MemoryPoolFactory;

    fn supervisor() -> PoolSupervisor<MemoryPoolFactory> {
        PoolSupervisor::new(MemoryPoolFactory::new()).with_drain_grace(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_try_current_before_install() {
        let sup = supervisor();
        assert!(matches!(sup.try_current_pool(), Err(Error::PoolNotReady)));
        assert_eq!(sup.generation(), 0);
    }

    #[tokio::test]
    async fn test_rotate_installs_and_opens_gate() {
        let sup = supervisor();
        let generation = sup.rotate(Credential::unbounded("a")).await.unwrap();
        assert_eq!(generation, 1);
        assert!(sup.is_ready());
        let handle = sup.current_pool().await.unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.credential().token(), "a");
    }

    #[tokio::test]
    async fn test_make_before_break() {
        let sup = supervisor();
        sup.rotate(Credential::unbounded("a")).await.unwrap();
        let old = sup.current_pool().await.unwrap();
        let conn = old.acquire().unwrap();

        sup.rotate(Credential::unbounded("b")).await.unwrap();
        let new = sup.try_current_pool().unwrap();
        assert_eq!(new.generation(), 2);
        assert!(!new.is_closed());

        // The retired pool refuses new work but keeps the checked-out connection.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !old.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(old.in_flight(), 1);
        assert_eq!(sup.draining(), 1);

        drop(conn);
        tokio::time::timeout(Duration::from_secs(1), async {
            while sup.draining() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failed_build_keeps_current_pool() {
        let sup = supervisor();
        sup.rotate(Credential::unbounded("a")).await.unwrap();
        sup.factory().fail_next_builds(1);

        assert!(sup.rotate(Credential::unbounded("b")).await.is_err());
        let current = sup.try_current_pool().unwrap();
        assert_eq!(current.generation(), 1);
        assert!(!current.is_closed());
        assert_eq!(sup.current_credential().unwrap().token(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_grace_bounds_close() {
        let sup = PoolSupervisor::new(MemoryPoolFactory::new())
            .with_drain_grace(Duration::from_secs(2));
        sup.rotate(Credential::unbounded("a")).await.unwrap();
        let stuck = sup.try_current_pool().unwrap().acquire().unwrap();

        sup.shutdown().await;
        assert!(matches!(sup.try_current_pool(), Err(Error::ShutDown)));
        assert_eq!(sup.draining(), 0);
        drop(stuck);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_installs_racing_shutdown_never_leak_a_pool() {
        for _ in 0..20 {
            let sup = Arc::new(supervisor());
            sup.rotate(Credential::unbounded("first")).await.unwrap();

            let rotations: Vec<_> = (0..8)
                .map(|i| {
                    let sup = sup.clone();
                    tokio::spawn(async move {
                        let _ = sup.rotate(Credential::unbounded(format!("tok-{}", i))).await;
                    })
                })
                .collect();
            sup.shutdown().await;
            for rotation in rotations {
                rotation.await.unwrap();
            }

            assert!(sup.current().is_none());
            let pools = sup.factory().pools();
            tokio::time::timeout(Duration::from_secs(2), async {
                while !pools.iter().all(|p| p.is_closed()) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("every built pool is closed after shutdown");
        }
    }

    #[tokio::test]
    async fn test_shutdown_idempotent_and_rejects_late_install() {
        let sup = Arc::new(supervisor());
        sup.rotate(Credential::unbounded("a")).await.unwrap();
        let pool = sup.try_current_pool().unwrap().into_inner();

        sup.shutdown().await;
        sup.shutdown().await;
        assert!(pool.is_closed());
        assert!(matches!(sup.current_pool().await, Err(Error::ShutDown)));

        let late = sup.build_pool(&Credential::unbounded("b")).await.unwrap();
        assert!(matches!(
            sup.install(late.clone(), Credential::unbounded("b")),
            Err(Error::ShutDown)
        ));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !late.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
