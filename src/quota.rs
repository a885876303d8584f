// Quota tracker
// Enforces per-identity daily and monthly request limits on top of the
// counter store's atomic increment. Counters are keyed by calendar window
// label and expire at the end of the window plus a grace margin
//
// Numan Thabit 2025 Nov

use crate::config::GateConfig;
use crate::errors::GateError;
use crate::model::{Tier, UsageKey};
use crate::store::{bounded, CounterStore, COUNTER_STORE};
use crate::window::{saturating_add, WindowKind};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Usage of one window after a peek or reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub kind: WindowKind,
    pub current: u64,
    pub limit: u64,
    pub exceeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaOutcome {
    pub windows: Vec<WindowUsage>,
}

impl QuotaOutcome {
    pub fn ok(&self) -> bool {
        self.exceeded().is_none()
    }

    /// First exceeded window, day before month
    pub fn exceeded(&self) -> Option<WindowUsage> {
        self.windows.iter().copied().find(|usage| usage.exceeded)
    }

    pub fn usage(&self, kind: WindowKind) -> Option<WindowUsage> {
        self.windows.iter().copied().find(|usage| usage.kind == kind)
    }
}

pub struct QuotaTracker {
    counters: Arc<dyn CounterStore>,
    config: Arc<GateConfig>,
    timeout: Duration,
}

impl QuotaTracker {
    pub fn new(counters: Arc<dyn CounterStore>, config: Arc<GateConfig>) -> Self {
        let timeout = config.store_timeout();
        Self {
            counters,
            config,
            timeout,
        }
    }

    pub fn limit(&self, kind: WindowKind, tier: Tier) -> u64 {
        match kind {
            WindowKind::Day => self.config.daily_limit(tier),
            WindowKind::Month => self.config.monthly_limit(tier),
        }
    }

    fn expires_at(&self, kind: WindowKind, now: DateTime<Utc>) -> DateTime<Utc> {
        saturating_add(kind.window_end(now), self.config.quota_grace())
    }

    /// Read-only check: would one more request fit in every window?
    pub async fn peek(
        &self,
        identity: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<QuotaOutcome, GateError> {
        // Windows are independent keys, so read them concurrently
        let reads = WindowKind::ALL.map(|kind| async move {
            let key = UsageKey::new(identity, kind, now);
            let current = bounded(
                COUNTER_STORE,
                "current",
                self.timeout,
                self.counters.current(&key, now),
            )
            .await?;
            let limit = self.limit(kind, tier);
            Ok::<_, GateError>(WindowUsage {
                kind,
                current,
                limit,
                exceeded: current >= limit,
            })
        });
        let windows = try_join_all(reads).await?;
        Ok(QuotaOutcome { windows })
    }

    /// Atomically count this request against every window and compare the
    /// returned totals with the limits. The increment stands even when it
    /// tips a window over, so the counter reflects attempted volume.
    pub async fn check_and_reserve(
        &self,
        identity: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<QuotaOutcome, GateError> {
        let mut windows = Vec::with_capacity(WindowKind::ALL.len());
        for kind in WindowKind::ALL {
            let key = UsageKey::new(identity, kind, now);
            let current = bounded(
                COUNTER_STORE,
                "increment",
                self.timeout,
                self.counters
                    .increment_and_get(&key, 1, self.expires_at(kind, now), now),
            )
            .await?;
            let limit = self.limit(kind, tier);
            let exceeded = current > limit;
            if exceeded {
                debug!(key = %key, current, limit, "quota window exceeded on reserve");
            }
            windows.push(WindowUsage {
                kind,
                current,
                limit,
                exceeded,
            });
        }
        Ok(QuotaOutcome { windows })
    }
}
