//! Rotation counters.

use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{Error, ErrorCategory};

/// Thread-safe atomic counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last refresh failure, kept for health reporting. Never carries secrets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Counters describing credential refresh and pool rotation.
#[derive(Default)]
pub struct RotationStats {
    refreshes: Counter,
    rotations: Counter,
    failures: Counter,
    recoveries: Counter,
    fallbacks: Counter,
    generation: Gauge,
    credential_expires_at: Gauge,
    last_refresh_ms: Gauge,
    last_failure: RwLock<Option<FailureRecord>>,
}

impl RotationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A refresh pass finished without error.
    pub fn record_refresh(&self, elapsed: Duration) {
        self.refreshes.inc();
        self.last_refresh_ms.set(elapsed.as_millis() as i64);
        *self.last_failure.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// A new pool was installed.
    pub fn record_rotation(&self, generation: u64, expires_at: Option<DateTime<Utc>>) {
        self.rotations.inc();
        self.generation.set(generation as i64);
        self.credential_expires_at
            .set(expires_at.map(|t| t.timestamp()).unwrap_or(0));
    }

    pub fn record_failure(&self, error: &Error) {
        self.failures.inc();
        *self.last_failure.write().unwrap_or_else(|e| e.into_inner()) = Some(FailureRecord {
            category: error.category(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    /// A pool was rebuilt in response to an authentication failure.
    pub fn record_recovery(&self) {
        self.recoveries.inc();
    }

    pub fn record_fallback(&self) {
        self.fallbacks.inc();
    }

    pub fn last_failure(&self) -> Option<FailureRecord> {
        self.last_failure
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            refreshes: self.refreshes.get(),
            rotations: self.rotations.get(),
            failures: self.failures.get(),
            recoveries: self.recoveries.get(),
            fallbacks: self.fallbacks.get(),
            generation: self.generation.get().max(0) as u64,
            credential_expires_at: match self.credential_expires_at.get() {
                0 => None,
                ts => DateTime::from_timestamp(ts, 0),
            },
            last_refresh: Duration::from_millis(self.last_refresh_ms.get().max(0) as u64),
            last_failure: self.last_failure(),
        }
    }
}

impl std::fmt::Debug for RotationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

/// Point-in-time copy of [`RotationStats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub refreshes: u64,
    pub rotations: u64,
    pub failures: u64,
    pub recoveries: u64,
    pub fallbacks: u64,
    pub generation: u64,
    pub credential_expires_at: Option<DateTime<Utc>>,
    pub last_refresh: Duration,
    pub last_failure: Option<FailureRecord>,
}
