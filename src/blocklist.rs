// Blocklist access
// Engine-side view of the blocklist store (active-entry lookup), the operator
// add/remove interface, and the spam promotion path used by the detector
//
// Numan Thabit 2025 Nov

use crate::errors::GateError;
use crate::model::{BlockEntry, BlockReason};
use crate::store::{bounded, BlocklistStore, BLOCKLIST_STORE};
use crate::window::saturating_add;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Blocklist {
    store: Arc<dyn BlocklistStore>,
    timeout: Duration,
}

impl Blocklist {
    pub fn new(store: Arc<dyn BlocklistStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Entry for `identity` if one exists and has not expired at `now`
    pub async fn active_block(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockEntry>, GateError> {
        let entry = self.entry(identity).await?;
        Ok(entry.filter(|entry| entry.is_active(now)))
    }

    /// Raw entry, expired or not
    pub async fn entry(&self, identity: &str) -> Result<Option<BlockEntry>, GateError> {
        bounded(BLOCKLIST_STORE, "get", self.timeout, self.store.get(identity)).await
    }

    /// Operator interface: block `identity`. `expires_at = None` is permanent.
    pub async fn block(
        &self,
        identity: &str,
        reason: BlockReason,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<BlockEntry, GateError> {
        let entry = BlockEntry {
            identity: identity.to_string(),
            reason,
            blocked_at: now,
            expires_at,
        };
        bounded(
            BLOCKLIST_STORE,
            "put",
            self.timeout,
            self.store.put(entry.clone()),
        )
        .await?;
        info!(
            identity = %identity,
            reason = reason.as_str(),
            expires_at = ?expires_at,
            "identity blocked"
        );
        Ok(entry)
    }

    /// Operator interface: lift a block
    pub async fn unblock(&self, identity: &str) -> Result<bool, GateError> {
        let removed =
            bounded(BLOCKLIST_STORE, "remove", self.timeout, self.store.remove(identity)).await?;
        if removed {
            info!(identity = %identity, "identity unblocked");
        }
        Ok(removed)
    }

    /// Automatic spam block with a bounded lifetime. An already-active entry
    /// (e.g. a permanent manual block) is left in place. The flag is true
    /// only when this call wrote the entry.
    pub(crate) async fn promote_spam(
        &self,
        identity: &str,
        now: DateTime<Utc>,
        lifetime: ChronoDuration,
    ) -> Result<(BlockEntry, bool), GateError> {
        if let Some(existing) = self.active_block(identity, now).await? {
            debug!(
                identity = %identity,
                reason = existing.reason.as_str(),
                "spam promotion skipped; identity already blocked"
            );
            return Ok((existing, false));
        }
        let entry = self
            .block(
                identity,
                BlockReason::Spam,
                Some(saturating_add(now, lifetime)),
                now,
            )
            .await?;
        Ok((entry, true))
    }
}
