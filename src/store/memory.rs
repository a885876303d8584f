// In-memory store implementations
// Shared-map backends for single-node deployments and tests. Each map sits
// behind an async RwLock; the counter increment holds the write lock for the
// whole read-modify-write so it is atomic with respect to other callers
//
// Numan Thabit 2025 Nov

use super::{BlocklistStore, BudgetStore, CounterStore, IdentityStore, ReputationStore};
use crate::errors::GateError;
use crate::model::{BlockEntry, Identity, ReputationRecord, UsageKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct UsageCounter {
    count: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Default, Clone)]
pub struct MemoryCounterStore {
    counters: Arc<RwLock<HashMap<UsageKey, UsageCounter>>>,
}

impl MemoryCounterStore {
    /// Drop records whose TTL has passed. Returns the number removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, counter| counter.expires_at > now);
        before - counters.len()
    }

    pub async fn len(&self) -> usize {
        self.counters.read().await.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(
        &self,
        key: &UsageKey,
        by: u64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, GateError> {
        let mut counters = self.counters.write().await;
        let counter = counters.entry(key.clone()).or_insert(UsageCounter {
            count: 0,
            expires_at,
        });
        if counter.expires_at <= now {
            debug!(key = %key, "usage counter expired; starting fresh record");
            *counter = UsageCounter {
                count: 0,
                expires_at,
            };
        }
        counter.count = counter.count.saturating_add(by);
        Ok(counter.count)
    }

    async fn current(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<u64, GateError> {
        let counters = self.counters.read().await;
        Ok(counters
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map_or(0, |counter| counter.count))
    }
}

#[derive(Default, Clone)]
pub struct MemoryReputationStore {
    records: Arc<RwLock<HashMap<String, ReputationRecord>>>,
}

impl MemoryReputationStore {
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }
}

#[async_trait]
impl ReputationStore for MemoryReputationStore {
    async fn get(&self, identity: &str) -> Result<Option<ReputationRecord>, GateError> {
        Ok(self.records.read().await.get(identity).cloned())
    }

    async fn put(&self, identity: &str, record: ReputationRecord) -> Result<(), GateError> {
        self.records
            .write()
            .await
            .insert(identity.to_string(), record);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryBlocklistStore {
    entries: Arc<RwLock<HashMap<String, BlockEntry>>>,
}

impl MemoryBlocklistStore {
    /// Permanent entries are never purged
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_active(now));
        before - entries.len()
    }
}

#[async_trait]
impl BlocklistStore for MemoryBlocklistStore {
    async fn get(&self, identity: &str) -> Result<Option<BlockEntry>, GateError> {
        Ok(self.entries.read().await.get(identity).cloned())
    }

    async fn put(&self, entry: BlockEntry) -> Result<(), GateError> {
        self.entries
            .write()
            .await
            .insert(entry.identity.clone(), entry);
        Ok(())
    }

    async fn remove(&self, identity: &str) -> Result<bool, GateError> {
        Ok(self.entries.write().await.remove(identity).is_some())
    }
}

#[derive(Default, Clone)]
pub struct MemoryIdentityStore {
    identities: Arc<RwLock<HashMap<String, Identity>>>,
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn lookup(&self, subject: &str) -> Result<Option<Identity>, GateError> {
        Ok(self.identities.read().await.get(subject).cloned())
    }

    async fn upsert(&self, identity: Identity) -> Result<(), GateError> {
        self.identities
            .write()
            .await
            .insert(identity.subject.clone(), identity);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryBudgetStore {
    spend: Arc<RwLock<HashMap<String, f64>>>,
}

#[async_trait]
impl BudgetStore for MemoryBudgetStore {
    async fn add_spend(&self, period_id: &str, delta: f64) -> Result<f64, GateError> {
        let mut spend = self.spend.write().await;
        let total = spend.entry(period_id.to_string()).or_insert(0.0);
        *total = (*total + delta).max(0.0);
        Ok(*total)
    }

    async fn period_spend(&self, period_id: &str) -> Result<f64, GateError> {
        Ok(self
            .spend
            .read()
            .await
            .get(period_id)
            .copied()
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockReason;
    use crate::window::WindowKind;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn counter_increments_and_peeks() {
        let store = MemoryCounterStore::default();
        let key = UsageKey::new("+15550100", WindowKind::Day, t0());
        let expires = t0() + Duration::days(2);

        assert_eq!(store.current(&key, t0()).await.unwrap(), 0);
        assert_eq!(store.increment_and_get(&key, 1, expires, t0()).await.unwrap(), 1);
        assert_eq!(store.increment_and_get(&key, 1, expires, t0()).await.unwrap(), 2);
        assert_eq!(store.current(&key, t0()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_counter_is_replaced_not_reset_in_place() {
        let store = MemoryCounterStore::default();
        let key = UsageKey::new("+15550100", WindowKind::Day, t0());
        let first_expiry = t0() + Duration::hours(1);
        store.increment_and_get(&key, 5, first_expiry, t0()).await.unwrap();

        let later = t0() + Duration::hours(2);
        assert_eq!(store.current(&key, later).await.unwrap(), 0);
        let next_expiry = later + Duration::days(1);
        assert_eq!(
            store.increment_and_get(&key, 1, next_expiry, later).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn purge_drops_only_expired_counters() {
        let store = MemoryCounterStore::default();
        let day = UsageKey::new("a", WindowKind::Day, t0());
        let month = UsageKey::new("a", WindowKind::Month, t0());
        store
            .increment_and_get(&day, 1, t0() + Duration::hours(1), t0())
            .await
            .unwrap();
        store
            .increment_and_get(&month, 1, t0() + Duration::days(30), t0())
            .await
            .unwrap();

        assert_eq!(store.purge_expired(t0() + Duration::hours(3)).await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn blocklist_purge_keeps_permanent_entries() {
        let store = MemoryBlocklistStore::default();
        store
            .put(BlockEntry {
                identity: "temp".into(),
                reason: BlockReason::Spam,
                blocked_at: t0(),
                expires_at: Some(t0() + Duration::days(1)),
            })
            .await
            .unwrap();
        store
            .put(BlockEntry {
                identity: "perm".into(),
                reason: BlockReason::Manual,
                blocked_at: t0(),
                expires_at: None,
            })
            .await
            .unwrap();

        assert_eq!(store.purge_expired(t0() + Duration::days(2)).await, 1);
        assert!(store.get("temp").await.unwrap().is_none());
        assert!(store.get("perm").await.unwrap().is_some());
        assert!(store.remove("perm").await.unwrap());
        assert!(!store.remove("perm").await.unwrap());
    }

    #[tokio::test]
    async fn budget_spend_is_floored_at_zero() {
        let store = MemoryBudgetStore::default();
        assert_eq!(store.add_spend("2026-10", 12.5).await.unwrap(), 12.5);
        assert_eq!(store.add_spend("2026-10", -20.0).await.unwrap(), 0.0);
        assert_eq!(store.period_spend("2026-11").await.unwrap(), 0.0);
    }
}
