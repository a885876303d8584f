// Reputation and spam detection
// Scores identities with a pluggable scoring function, keeps a rolling count
// of negative events and promotes repeat offenders onto the blocklist
//
// Numan Thabit 2025 Nov

use crate::blocklist::Blocklist;
use crate::config::GateConfig;
use crate::errors::GateError;
use crate::metrics::AUTO_BLOCKS;
use crate::model::{BlockEntry, ReputationRecord, RequestMetadata, SCORE_MAX, SCORE_MIN};
use crate::store::{bounded, ReputationStore, REPUTATION_STORE};
use crate::window::saturating_add;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Produces the score adjustment for one request. Content and velocity
/// heuristics live behind this trait.
pub trait ScoringFunction: Send + Sync {
    fn delta(&self, identity: &str, request: &RequestMetadata, record: &ReputationRecord) -> i32;
}

/// Leaves every score where it is
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralScoring;

impl ScoringFunction for NeutralScoring {
    fn delta(&self, _identity: &str, _request: &RequestMetadata, _record: &ReputationRecord) -> i32 {
        0
    }
}

/// Maps the upstream classifier's `suspicion` signal onto a delta:
/// at or above `flag_at` the penalty scales with suspicion, otherwise the
/// identity slowly earns trust back.
#[derive(Debug, Clone, Copy)]
pub struct SignalScoring {
    pub flag_at: f64,
    pub max_penalty: i32,
    pub recovery: i32,
}

impl Default for SignalScoring {
    fn default() -> Self {
        Self {
            flag_at: 0.7,
            max_penalty: 20,
            recovery: 1,
        }
    }
}

impl ScoringFunction for SignalScoring {
    fn delta(&self, _identity: &str, request: &RequestMetadata, _record: &ReputationRecord) -> i32 {
        match request.suspicion {
            Some(suspicion) if suspicion.is_finite() && suspicion >= self.flag_at => {
                let penalty = (suspicion.min(1.0) * self.max_penalty as f64).round() as i32;
                -penalty.max(1)
            }
            _ => self.recovery,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationHint {
    Proceed,
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReputationScore {
    /// Score after applying this request's delta
    pub score: u8,
    pub delta: i32,
    pub hint: ReputationHint,
    /// True when the stored record could not be read and a neutral default was used
    pub degraded: bool,
}

/// Result of a scored request, fed back through `record_activity`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityOutcome {
    pub delta: i32,
    pub at: DateTime<Utc>,
}

/// Fully computed write set for one activity. Applying it twice has the
/// same effect as applying it once.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityUpdate {
    pub identity: String,
    pub record: ReputationRecord,
    pub promote: bool,
    pub at: DateTime<Utc>,
}

pub struct ReputationDetector {
    store: Arc<dyn ReputationStore>,
    blocklist: Blocklist,
    scoring: Arc<dyn ScoringFunction>,
    config: Arc<GateConfig>,
    timeout: Duration,
}

pub fn clamp_score(score: u8, delta: i32) -> u8 {
    (score as i32 + delta).clamp(SCORE_MIN as i32, SCORE_MAX as i32) as u8
}

impl ReputationDetector {
    pub fn new(
        store: Arc<dyn ReputationStore>,
        blocklist: Blocklist,
        scoring: Arc<dyn ScoringFunction>,
        config: Arc<GateConfig>,
    ) -> Self {
        let timeout = config.store_timeout();
        Self {
            store,
            blocklist,
            scoring,
            config,
            timeout,
        }
    }

    pub fn neutral_record(&self, now: DateTime<Utc>) -> ReputationRecord {
        ReputationRecord::neutral(
            self.config.reputation_default_score,
            now,
            saturating_add(now, self.config.reputation_ttl()),
        )
    }

    /// Stored record, or a neutral one for unseen or expired identities
    pub async fn load(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<ReputationRecord, GateError> {
        let stored = bounded(REPUTATION_STORE, "get", self.timeout, self.store.get(identity)).await?;
        Ok(stored
            .filter(|record| !record.is_expired(now))
            .unwrap_or_else(|| self.neutral_record(now)))
    }

    /// Pure scoring against a known record
    pub fn assess(
        &self,
        identity: &str,
        request: &RequestMetadata,
        record: &ReputationRecord,
    ) -> ReputationScore {
        let delta = self.scoring.delta(identity, request, record);
        let score = clamp_score(record.score, delta);
        let hint = if score < self.config.reputation_min_score {
            ReputationHint::Reject
        } else {
            ReputationHint::Proceed
        };
        ReputationScore {
            score,
            delta,
            hint,
            degraded: false,
        }
    }

    pub async fn score(
        &self,
        identity: &str,
        request: &RequestMetadata,
    ) -> Result<ReputationScore, GateError> {
        let record = self.load(identity, request.timestamp).await?;
        Ok(self.assess(identity, request, &record))
    }

    /// Scoring with a neutral record, used when the store cannot be read
    pub fn score_neutral(&self, identity: &str, request: &RequestMetadata) -> ReputationScore {
        let record = self.neutral_record(request.timestamp);
        ReputationScore {
            degraded: true,
            ..self.assess(identity, request, &record)
        }
    }

    /// Read the current record and compute the write set for `outcome`
    pub async fn prepare_activity(
        &self,
        identity: &str,
        outcome: ActivityOutcome,
    ) -> Result<ActivityUpdate, GateError> {
        let mut record = self.load(identity, outcome.at).await?;
        record.score = clamp_score(record.score, outcome.delta);
        record.last_activity_at = outcome.at;
        record.expires_at = saturating_add(outcome.at, self.config.reputation_ttl());

        let mut promote = false;
        if outcome.delta < 0 {
            match record.flag_window_started_at {
                Some(started) if outcome.at - started < self.config.flag_window() => {
                    record.flag_count += 1;
                }
                _ => {
                    record.flag_window_started_at = Some(outcome.at);
                    record.flag_count = 1;
                }
            }
            if record.flag_count >= self.config.reputation_flag_threshold {
                promote = true;
                record.flag_count = 0;
                record.flag_window_started_at = None;
            }
        }

        Ok(ActivityUpdate {
            identity: identity.to_string(),
            record,
            promote,
            at: outcome.at,
        })
    }

    /// Persist a prepared update; returns the block entry when the identity
    /// was promoted to the blocklist
    pub async fn apply(&self, update: &ActivityUpdate) -> Result<Option<BlockEntry>, GateError> {
        let promoted = if update.promote {
            let (entry, created) = self
                .blocklist
                .promote_spam(&update.identity, update.at, self.config.block_auto_expiry())
                .await?;
            if created {
                AUTO_BLOCKS.inc();
                warn!(
                    identity = %update.identity,
                    threshold = self.config.reputation_flag_threshold,
                    expires_at = ?entry.expires_at,
                    "flag threshold reached; identity auto-blocked for spam"
                );
            }
            Some(entry)
        } else {
            None
        };

        bounded(
            REPUTATION_STORE,
            "put",
            self.timeout,
            self.store.put(&update.identity, update.record.clone()),
        )
        .await?;
        debug!(
            identity = %update.identity,
            score = update.record.score,
            flag_count = update.record.flag_count,
            "reputation activity recorded"
        );
        Ok(promoted)
    }

    pub async fn record_activity(
        &self,
        identity: &str,
        outcome: ActivityOutcome,
    ) -> Result<Option<BlockEntry>, GateError> {
        let update = self.prepare_activity(identity, outcome).await?;
        self.apply(&update).await
    }
}
