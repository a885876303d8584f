#![allow(dead_code)]

use admission_gate::config::GateConfig;
use admission_gate::engine::AdmissionEngine;
use admission_gate::errors::GateError;
use admission_gate::model::{BlockEntry, Identity, ReputationRecord, Tier, UsageKey};
use admission_gate::reputation::{ScoringFunction, SignalScoring};
use admission_gate::store::{
    BlocklistStore, BudgetStore, CounterStore, IdentityStore, MemoryReputationStore,
    ReputationStore, Stores,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ALICE: &str = "+15550100";
pub const BOB: &str = "+15550101";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap()
}

pub async fn engine_with(cfg: GateConfig, stores: Stores) -> Arc<AdmissionEngine> {
    engine_scored(cfg, stores, Arc::new(SignalScoring::default())).await
}

pub async fn engine_scored(
    cfg: GateConfig,
    stores: Stores,
    scoring: Arc<dyn ScoringFunction>,
) -> Arc<AdmissionEngine> {
    let identities = stores.identities.clone();
    let engine = AdmissionEngine::new(cfg, stores, scoring).expect("valid test config");
    for (subject, tier) in [(ALICE, Tier::Standard), (BOB, Tier::Elevated)] {
        identities
            .upsert(Identity::active(subject, tier))
            .await
            .expect("seed identity");
    }
    Arc::new(engine)
}

pub async fn engine(cfg: GateConfig) -> Arc<AdmissionEngine> {
    engine_with(cfg, Stores::in_memory()).await
}

/// Store double that fails every call
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

fn down() -> GateError {
    GateError::unavailable("test", "connection refused")
}

#[async_trait]
impl CounterStore for Unavailable {
    async fn increment_and_get(
        &self,
        _key: &UsageKey,
        _by: u64,
        _expires_at: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<u64, GateError> {
        Err(down())
    }

    async fn current(&self, _key: &UsageKey, _now: DateTime<Utc>) -> Result<u64, GateError> {
        Err(down())
    }
}

#[async_trait]
impl ReputationStore for Unavailable {
    async fn get(&self, _identity: &str) -> Result<Option<ReputationRecord>, GateError> {
        Err(down())
    }

    async fn put(&self, _identity: &str, _record: ReputationRecord) -> Result<(), GateError> {
        Err(down())
    }
}

#[async_trait]
impl BlocklistStore for Unavailable {
    async fn get(&self, _identity: &str) -> Result<Option<BlockEntry>, GateError> {
        Err(down())
    }

    async fn put(&self, _entry: BlockEntry) -> Result<(), GateError> {
        Err(down())
    }

    async fn remove(&self, _identity: &str) -> Result<bool, GateError> {
        Err(down())
    }
}

#[async_trait]
impl IdentityStore for Unavailable {
    async fn lookup(&self, _subject: &str) -> Result<Option<Identity>, GateError> {
        Err(down())
    }

    async fn upsert(&self, _identity: Identity) -> Result<(), GateError> {
        Err(down())
    }
}

#[async_trait]
impl BudgetStore for Unavailable {
    async fn add_spend(&self, _period_id: &str, _delta: f64) -> Result<f64, GateError> {
        Err(down())
    }

    async fn period_spend(&self, _period_id: &str) -> Result<f64, GateError> {
        Err(down())
    }
}

/// Counter store that never answers
#[derive(Debug, Clone, Copy, Default)]
pub struct Stalled;

#[async_trait]
impl CounterStore for Stalled {
    async fn increment_and_get(
        &self,
        _key: &UsageKey,
        _by: u64,
        _expires_at: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<u64, GateError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(0)
    }

    async fn current(&self, _key: &UsageKey, _now: DateTime<Utc>) -> Result<u64, GateError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(0)
    }
}

/// Reputation store whose first `failures` writes fail
#[derive(Default)]
pub struct FlakyReputation {
    pub inner: MemoryReputationStore,
    failures: AtomicU32,
}

impl FlakyReputation {
    pub fn failing(failures: u32) -> Self {
        Self {
            inner: MemoryReputationStore::default(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ReputationStore for FlakyReputation {
    async fn get(&self, identity: &str) -> Result<Option<ReputationRecord>, GateError> {
        self.inner.get(identity).await
    }

    async fn put(&self, identity: &str, record: ReputationRecord) -> Result<(), GateError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(down());
        }
        self.inner.put(identity, record).await
    }
}
