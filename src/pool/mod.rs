//! Connection pool supervision.
//!
//! A [`PoolFactory`] turns a credential into a live pool. The [`PoolSupervisor`] owns
//! the currently installed pool, swaps in replacements make-before-break, and drains
//! retired pools in the background.

mod memory;
mod postgres;
mod readiness;
mod supervisor;

pub use memory::{InMemoryConnection, InMemoryPool, MemoryPoolFactory};
pub use postgres::{PgPoolFactory, quote_ident};
pub use readiness::ReadinessGate;
pub use supervisor::PoolSupervisor;

use std::ops::Deref;

use async_trait::async_trait;

use crate::Result;
use crate::auth::Credential;

/// A pool the supervisor can install and retire.
///
/// Clones share the same underlying pool.
#[async_trait]
pub trait ManagedPool: Clone + Send + Sync + 'static {
    /// Stop handing out connections and wait for checked-out ones to be returned.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Builds a pool that authenticates with a given credential.
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Pool: ManagedPool;

    /// Build and verify a pool. A failure must not affect any previously built pool.
    async fn build(&self, credential: &Credential) -> Result<Self::Pool>;
}

/// Installed pool plus the generation it was installed as.
///
/// Handing the handle back to
/// [`on_authentication_error`](crate::DatabaseConnector::on_authentication_error)
/// lets concurrent failures against the same generation trigger a single rebuild.
#[derive(Clone, Debug)]
pub struct PoolHandle<P> {
    pool: P,
    generation: u64,
}

impl<P> PoolHandle<P> {
    pub(crate) fn new(pool: P, generation: u64) -> Self {
        Self { pool, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn into_inner(self) -> P {
        self.pool
    }
}

impl<P> Deref for PoolHandle<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.pool
    }
}
