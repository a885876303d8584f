// Store abstractions for the admission gate
// Defines the five keyed stores the gateway reads and writes on the hot path
// plus the bounded-timeout wrapper every store call goes through
//
// Numan Thabit 2025 Nov

pub mod memory;

use crate::errors::GateError;
use crate::metrics::{STORE_ERRORS, STORE_LATENCY};
use crate::model::{BlockEntry, Identity, ReputationRecord, UsageKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{
    MemoryBlocklistStore, MemoryBudgetStore, MemoryCounterStore, MemoryIdentityStore,
    MemoryReputationStore,
};

pub const COUNTER_STORE: &str = "counter";
pub const REPUTATION_STORE: &str = "reputation";
pub const BLOCKLIST_STORE: &str = "blocklist";
pub const IDENTITY_STORE: &str = "identity";
pub const BUDGET_STORE: &str = "budget";

/// Usage counters. The atomic increment is the only write.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `by` to the counter and return the new value as one indivisible step.
    /// A record expired at `now` is replaced by a fresh one carrying `expires_at`.
    async fn increment_and_get(
        &self,
        key: &UsageKey,
        by: u64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, GateError>;

    /// Read-only peek; expired or missing records read as zero.
    async fn current(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<u64, GateError>;
}

/// Last-writer-wins reputation records
#[async_trait]
pub trait ReputationStore: Send + Sync {
    async fn get(&self, identity: &str) -> Result<Option<ReputationRecord>, GateError>;
    async fn put(&self, identity: &str, record: ReputationRecord) -> Result<(), GateError>;
}

#[async_trait]
pub trait BlocklistStore: Send + Sync {
    async fn get(&self, identity: &str) -> Result<Option<BlockEntry>, GateError>;
    async fn put(&self, entry: BlockEntry) -> Result<(), GateError>;
    /// Returns true when an entry was removed
    async fn remove(&self, identity: &str) -> Result<bool, GateError>;
}

/// Allow-listed identities; written out of band
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn lookup(&self, subject: &str) -> Result<Option<Identity>, GateError>;
    async fn upsert(&self, identity: Identity) -> Result<(), GateError>;
}

/// Estimated spend per budget period
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Atomically add `delta` (may be negative) and return the new total, floored at zero
    async fn add_spend(&self, period_id: &str, delta: f64) -> Result<f64, GateError>;
    async fn period_spend(&self, period_id: &str) -> Result<f64, GateError>;
}

/// The full set of stores one gateway worker talks to
#[derive(Clone)]
pub struct Stores {
    pub counters: Arc<dyn CounterStore>,
    pub reputation: Arc<dyn ReputationStore>,
    pub blocklist: Arc<dyn BlocklistStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub budget: Arc<dyn BudgetStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            counters: Arc::new(MemoryCounterStore::default()),
            reputation: Arc::new(MemoryReputationStore::default()),
            blocklist: Arc::new(MemoryBlocklistStore::default()),
            identities: Arc::new(MemoryIdentityStore::default()),
            budget: Arc::new(MemoryBudgetStore::default()),
        }
    }
}

/// Run a store call under `timeout`, recording latency and failures.
/// A timeout surfaces as `StoreUnavailable` like any other transient failure.
pub async fn bounded<T, F>(
    store: &'static str,
    op: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, GateError>
where
    F: Future<Output = Result<T, GateError>>,
{
    let _timer = STORE_LATENCY.with_label_values(&[store, op]).start_timer();
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GateError::unavailable(
            store,
            format!("{op} timed out after {}ms", timeout.as_millis()),
        )),
    };
    if result.is_err() {
        STORE_ERRORS.with_label_values(&[store, op]).inc();
    }
    result
}
