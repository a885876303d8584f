// Admission decision engine
// Runs the fixed check pipeline (blocklist, budget, authorization, quota,
// reputation), short-circuits on the first deny, and performs the allow-path
// side effects: quota reservation, then reputation write-back
//
// Numan Thabit 2025 Nov

use crate::blocklist::Blocklist;
use crate::budget::BudgetCircuitBreaker;
use crate::config::GateConfig;
use crate::errors::GateError;
use crate::metrics::{DECISIONS, QUOTA_UNENFORCED};
use crate::model::{
    AdmissionDecision, BudgetLevel, DecisionContext, DenyReason, Identity, RequestClass,
    RequestMetadata,
};
use crate::quota::{QuotaOutcome, QuotaTracker};
use crate::reputation::{
    ActivityOutcome, ReputationDetector, ReputationHint, ReputationScore, ScoringFunction,
};
use crate::store::{bounded, IdentityStore, Stores, IDENTITY_STORE};
use crate::window::{budget_period_id, WindowKind};
use backoff::{future::retry, ExponentialBackoff};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Advisory hints attached to an allowed decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// Budget is in Warning: downstream should take cheaper processing paths
    PreferLowCost,
}

impl Hint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hint::PreferLowCost => "prefer_low_cost",
        }
    }
}

/// Result of one pipeline check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Proceed,
    ProceedWithHint(Hint),
    Deny(DenyReason),
}

/// Pipeline steps in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Blocklist,
    Budget,
    Authorization,
    Quota,
    Reputation,
}

impl Check {
    pub const ORDER: [Check; 5] = [
        Check::Blocklist,
        Check::Budget,
        Check::Authorization,
        Check::Quota,
        Check::Reputation,
    ];
}

pub mod context_keys {
    pub const BLOCKLIST_CHECKED: &str = "blocklist_checked";
    pub const BUDGET_STATE: &str = "budget_state";
    pub const BUDGET_DEGRADED: &str = "budget_degraded";
    pub const PROCESSING_HINT: &str = "processing_hint";
    pub const REQUEST_CLASS: &str = "request_class";
    pub const TIER: &str = "tier";
    pub const USER_ID: &str = "user_id";
    pub const QUOTA_ENFORCED: &str = "quota_enforced";
    pub const QUOTA_DAY: &str = "quota_day";
    pub const QUOTA_MONTH: &str = "quota_month";
    pub const REPUTATION_SCORE: &str = "reputation_score";
    pub const REPUTATION_DEGRADED: &str = "reputation_degraded";
    pub const CHANNEL: &str = "channel";
}

use context_keys as keys;

/// Per-decision scratch state threaded through the checks
struct Evaluation<'a> {
    subject: &'a str,
    request: &'a RequestMetadata,
    context: DecisionContext,
    identity: Option<Identity>,
    reputation: Option<ReputationScore>,
}

impl Evaluation<'_> {
    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.context.insert(key.to_string(), value.into());
    }
}

pub struct AdmissionEngine {
    config: Arc<GateConfig>,
    identities: Arc<dyn IdentityStore>,
    blocklist: Blocklist,
    budget: BudgetCircuitBreaker,
    quota: QuotaTracker,
    reputation: Arc<ReputationDetector>,
    timeout: Duration,
}

impl AdmissionEngine {
    /// Build an engine from a validated configuration
    pub fn new(
        config: GateConfig,
        stores: Stores,
        scoring: Arc<dyn ScoringFunction>,
    ) -> Result<Self, GateError> {
        config.validate()?;
        let config = Arc::new(config);
        let timeout = config.store_timeout();
        let blocklist = Blocklist::new(stores.blocklist.clone(), timeout);
        let reputation = Arc::new(ReputationDetector::new(
            stores.reputation.clone(),
            blocklist.clone(),
            scoring,
            config.clone(),
        ));
        Ok(Self {
            budget: BudgetCircuitBreaker::new(stores.budget.clone(), &config),
            quota: QuotaTracker::new(stores.counters.clone(), config.clone()),
            identities: stores.identities,
            blocklist,
            reputation,
            config,
            timeout,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn budget(&self) -> &BudgetCircuitBreaker {
        &self.budget
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn reputation(&self) -> &ReputationDetector {
        &self.reputation
    }

    /// Out-of-band allow-listing
    pub async fn register_identity(&self, identity: Identity) -> Result<(), GateError> {
        let subject = identity.subject.clone();
        bounded(
            IDENTITY_STORE,
            "upsert",
            self.timeout,
            self.identities.upsert(identity),
        )
        .await?;
        info!(identity = %subject, "identity registered");
        Ok(())
    }

    /// Decide whether one logical request may proceed. Call exactly once per
    /// request: an allow consumes quota.
    pub async fn decide(&self, subject: &str, request: &RequestMetadata) -> AdmissionDecision {
        let decision = self.evaluate(subject, request).await;
        let verdict = if decision.is_allowed() { "allow" } else { "deny" };
        DECISIONS
            .with_label_values(&[verdict, decision.reason_code()])
            .inc();
        debug!(
            identity = %subject,
            verdict,
            reason = decision.reason_code(),
            "admission decision"
        );
        decision
    }

    async fn evaluate(&self, subject: &str, request: &RequestMetadata) -> AdmissionDecision {
        let mut eval = Evaluation {
            subject,
            request,
            context: DecisionContext::new(),
            identity: None,
            reputation: None,
        };
        eval.set(
            keys::REQUEST_CLASS,
            match request.class {
                RequestClass::User => "user",
                RequestClass::Critical => "critical",
            },
        );
        if let Some(channel) = &request.channel {
            eval.set(keys::CHANNEL, channel.as_str());
        }

        for check in Check::ORDER {
            let outcome = match check {
                Check::Blocklist => self.check_blocklist(&mut eval).await,
                Check::Budget => self.check_budget(&mut eval).await,
                Check::Authorization => self.check_authorization(&mut eval).await,
                Check::Quota => self.check_quota(&mut eval).await,
                Check::Reputation => self.check_reputation(&mut eval).await,
            };
            match outcome {
                CheckOutcome::Proceed => {}
                CheckOutcome::ProceedWithHint(hint) => eval.set(keys::PROCESSING_HINT, hint.as_str()),
                CheckOutcome::Deny(reason) => {
                    return AdmissionDecision::deny(subject, reason, eval.context);
                }
            }
        }

        self.commit(eval).await
    }

    async fn check_blocklist(&self, eval: &mut Evaluation<'_>) -> CheckOutcome {
        match self
            .blocklist
            .active_block(eval.subject, eval.request.timestamp)
            .await
        {
            Ok(Some(entry)) => {
                eval.set(keys::BLOCKLIST_CHECKED, "true");
                CheckOutcome::Deny(DenyReason::Blocked(entry.reason))
            }
            Ok(None) => {
                eval.set(keys::BLOCKLIST_CHECKED, "true");
                CheckOutcome::Proceed
            }
            Err(err) => {
                error!(
                    identity = %eval.subject,
                    error = %err,
                    "blocklist unavailable; treating identity as not blocked"
                );
                eval.set(keys::BLOCKLIST_CHECKED, "false");
                CheckOutcome::Proceed
            }
        }
    }

    async fn check_budget(&self, eval: &mut Evaluation<'_>) -> CheckOutcome {
        let period_id = budget_period_id(eval.request.timestamp);
        let state = self.budget.current_state(&period_id).await;
        eval.set(keys::BUDGET_STATE, state.state.as_str());
        if state.degraded {
            eval.set(keys::BUDGET_DEGRADED, "true");
        }
        match (state.state, eval.request.class) {
            (BudgetLevel::Emergency, RequestClass::User) => {
                CheckOutcome::Deny(DenyReason::BudgetEmergency)
            }
            (BudgetLevel::Emergency, RequestClass::Critical) | (BudgetLevel::Warning, _) => {
                CheckOutcome::ProceedWithHint(Hint::PreferLowCost)
            }
            (BudgetLevel::Normal, _) => CheckOutcome::Proceed,
        }
    }

    async fn check_authorization(&self, eval: &mut Evaluation<'_>) -> CheckOutcome {
        let lookup = bounded(
            IDENTITY_STORE,
            "lookup",
            self.timeout,
            self.identities.lookup(eval.subject),
        )
        .await;
        match lookup {
            Ok(Some(identity)) if identity.is_active() => {
                eval.set(keys::TIER, identity.tier.as_str());
                if let Some(user_id) = &identity.user_id {
                    eval.set(keys::USER_ID, user_id.as_str());
                }
                eval.identity = Some(identity);
                CheckOutcome::Proceed
            }
            Ok(_) => CheckOutcome::Deny(DenyReason::Unauthorized),
            Err(err) => {
                error!(
                    identity = %eval.subject,
                    error = %err,
                    "identity store unavailable; denying as unauthorized"
                );
                CheckOutcome::Deny(DenyReason::Unauthorized)
            }
        }
    }

    async fn check_quota(&self, eval: &mut Evaluation<'_>) -> CheckOutcome {
        let tier = eval.identity.as_ref().map(|identity| identity.tier).unwrap_or_default();
        match self.quota.peek(eval.subject, tier, eval.request.timestamp).await {
            Ok(outcome) => {
                record_quota(eval, &outcome);
                match outcome.exceeded() {
                    Some(window) => CheckOutcome::Deny(DenyReason::QuotaExceeded(window.kind)),
                    None => CheckOutcome::Proceed,
                }
            }
            Err(err) => {
                warn!(
                    identity = %eval.subject,
                    error = %err,
                    "counter store unavailable; quota not enforced"
                );
                eval.set(keys::QUOTA_ENFORCED, "false");
                CheckOutcome::Proceed
            }
        }
    }

    async fn check_reputation(&self, eval: &mut Evaluation<'_>) -> CheckOutcome {
        let score = match self.reputation.score(eval.subject, eval.request).await {
            Ok(score) => score,
            Err(err) => {
                warn!(
                    identity = %eval.subject,
                    error = %err,
                    "reputation store unavailable; using neutral score"
                );
                eval.set(keys::REPUTATION_DEGRADED, "true");
                self.reputation.score_neutral(eval.subject, eval.request)
            }
        };
        eval.set(keys::REPUTATION_SCORE, score.score.to_string());
        let (hint, delta) = (score.hint, score.delta);
        eval.reputation = Some(score);
        match hint {
            ReputationHint::Proceed => CheckOutcome::Proceed,
            ReputationHint::Reject => {
                // Rejected negative events still count toward the flag
                // threshold; quota is not touched
                if delta < 0 {
                    let outcome = ActivityOutcome {
                        delta,
                        at: eval.request.timestamp,
                    };
                    self.record_reputation(eval.subject, outcome).await;
                }
                CheckOutcome::Deny(DenyReason::LowReputation)
            }
        }
    }

    /// Allow-path side effects. Quota is reserved first; the verdict is final
    /// once the reservation returns, and the reputation write-back can no
    /// longer change it.
    async fn commit(&self, mut eval: Evaluation<'_>) -> AdmissionDecision {
        let now = eval.request.timestamp;
        let subject = eval.subject;

        if eval.context.get(keys::QUOTA_ENFORCED).map(String::as_str) != Some("false") {
            let tier = eval.identity.as_ref().map(|identity| identity.tier).unwrap_or_default();
            match self.quota.check_and_reserve(subject, tier, now).await {
                Ok(outcome) => {
                    record_quota(&mut eval, &outcome);
                    if let Some(window) = outcome.exceeded() {
                        debug!(
                            identity = %subject,
                            window = %window.kind,
                            current = window.current,
                            limit = window.limit,
                            "quota reservation lost to a concurrent request"
                        );
                        return AdmissionDecision::deny(
                            subject,
                            DenyReason::QuotaExceeded(window.kind),
                            eval.context,
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        identity = %subject,
                        error = %err,
                        "quota reservation failed; allowing without enforcement"
                    );
                    eval.set(keys::QUOTA_ENFORCED, "false");
                }
            }
        }
        if eval.context.get(keys::QUOTA_ENFORCED).map(String::as_str) == Some("false") {
            QUOTA_UNENFORCED.inc();
        }

        let delta = eval.reputation.as_ref().map_or(0, |score| score.delta);
        self.record_reputation(subject, ActivityOutcome { delta, at: now })
            .await;

        AdmissionDecision::allow(subject, eval.context)
    }

    async fn record_reputation(&self, subject: &str, outcome: ActivityOutcome) {
        let update = match self.reputation.prepare_activity(subject, outcome).await {
            Ok(update) => update,
            Err(err) => {
                warn!(
                    identity = %subject,
                    error = %err,
                    "reputation read for write-back failed; retrying in background"
                );
                let detector = self.reputation.clone();
                let identity = subject.to_string();
                spawn_writeback("reputation_record", subject.to_string(), move || {
                    let detector = detector.clone();
                    let identity = identity.clone();
                    async move {
                        detector
                            .record_activity(&identity, outcome)
                            .await
                            .map(|_| ())
                    }
                });
                return;
            }
        };

        if let Err(err) = self.reputation.apply(&update).await {
            warn!(
                identity = %subject,
                error = %err,
                "reputation write-back failed; retrying in background"
            );
            let detector = self.reputation.clone();
            spawn_writeback("reputation_apply", subject.to_string(), move || {
                let detector = detector.clone();
                let update = update.clone();
                async move { detector.apply(&update).await.map(|_| ()) }
            });
        }
    }
}

fn record_quota(eval: &mut Evaluation<'_>, outcome: &QuotaOutcome) {
    eval.set(keys::QUOTA_ENFORCED, "true");
    for usage in &outcome.windows {
        let key = match usage.kind {
            WindowKind::Day => keys::QUOTA_DAY,
            WindowKind::Month => keys::QUOTA_MONTH,
        };
        eval.set(key, format!("{}/{}", usage.current, usage.limit));
    }
}

fn writeback_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(2),
        max_elapsed_time: Some(Duration::from_secs(30)),
        multiplier: 2.0,
        ..Default::default()
    }
}

/// Retry a best-effort write off the request path
fn spawn_writeback<F, Fut>(label: &'static str, identity: String, mut op: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), GateError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = retry(writeback_backoff(), || {
            let attempt = op();
            async move {
                attempt.await.map_err(|err| {
                    if err.is_transient() {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        })
        .await;
        match result {
            Ok(()) => info!(identity = %identity, op = label, "write-back succeeded on retry"),
            Err(err) => error!(
                identity = %identity,
                op = label,
                error = %err,
                "write-back abandoned"
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockReason, Tier};
    use crate::reputation::{NeutralScoring, SignalScoring};
    use crate::window::WindowKind;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    async fn engine(cfg: GateConfig) -> AdmissionEngine {
        let engine = AdmissionEngine::new(cfg, Stores::in_memory(), Arc::new(SignalScoring::default()))
            .unwrap();
        engine
            .register_identity(Identity::active("+15550100", Tier::Standard))
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn earlier_checks_decide_the_reason() {
        let engine = engine(GateConfig {
            daily_limit_standard: 1,
            reputation_default_score: 20,
            ..GateConfig::default()
        })
        .await;
        let spammy = RequestMetadata::user(t0()).with_suspicion(1.0);

        // Quota before reputation: exhaust the day, then send a request that
        // would also fail the reputation check
        assert!(engine
            .decide("+15550100", &RequestMetadata::user(t0()))
            .await
            .is_allowed());
        let decision = engine.decide("+15550100", &spammy).await;
        assert_eq!(decision.reason, Some(DenyReason::QuotaExceeded(WindowKind::Day)));

        // Budget before authorization: an unknown identity under Emergency
        engine.budget().observe("2026-10", 960.0).await.unwrap();
        let stranger = engine.decide("+15559999", &RequestMetadata::user(t0())).await;
        assert_eq!(stranger.reason, Some(DenyReason::BudgetEmergency));

        // Authorization before quota: critical traffic skips the budget deny
        let stranger = engine
            .decide("+15559999", &RequestMetadata::critical(t0()))
            .await;
        assert_eq!(stranger.reason, Some(DenyReason::Unauthorized));

        // Blocklist before budget
        engine
            .blocklist()
            .block("+15559999", BlockReason::Abuse, None, t0())
            .await
            .unwrap();
        let blocked = engine.decide("+15559999", &RequestMetadata::user(t0())).await;
        assert_eq!(blocked.reason, Some(DenyReason::Blocked(BlockReason::Abuse)));
    }

    #[tokio::test]
    async fn rejected_suspicious_requests_still_count_as_flags() {
        let engine = engine(GateConfig {
            reputation_default_score: 30,
            ..GateConfig::default()
        })
        .await;
        let spammy = RequestMetadata::user(t0()).with_suspicion(1.0);
        let decision = engine.decide("+15550100", &spammy).await;
        assert_eq!(decision.reason, Some(DenyReason::LowReputation));

        let record = engine.reputation().load("+15550100", t0()).await.unwrap();
        assert_eq!(record.flag_count, 1);
        assert_eq!(record.score, 10);
    }

    #[test]
    fn invalid_config_is_refused() {
        let cfg = GateConfig {
            budget_soft_pct: 99.0,
            ..GateConfig::default()
        };
        let result = AdmissionEngine::new(cfg, Stores::in_memory(), Arc::new(NeutralScoring));
        assert!(matches!(result, Err(GateError::ConfigInvalid(_))));

        let cfg = GateConfig {
            reputation_ttl_days: 1_000_000_000,
            ..GateConfig::default()
        };
        let result = AdmissionEngine::new(cfg, Stores::in_memory(), Arc::new(NeutralScoring));
        assert!(matches!(result, Err(GateError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn far_future_timestamps_do_not_overflow_expiries() {
        let engine = engine(GateConfig::default()).await;
        let late = DateTime::<Utc>::MAX_UTC - chrono::Duration::hours(1);
        let decision = engine.decide("+15550100", &RequestMetadata::user(late)).await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn allowed_request_carries_context() {
        let engine = engine(GateConfig::default()).await;
        let decision = engine
            .decide("+15550100", &RequestMetadata::user(t0()).with_channel("sms"))
            .await;
        assert!(decision.is_allowed());
        assert_eq!(decision.context[keys::BUDGET_STATE], "normal");
        assert_eq!(decision.context[keys::TIER], "standard");
        assert_eq!(decision.context[keys::QUOTA_ENFORCED], "true");
        assert_eq!(decision.context[keys::QUOTA_DAY], "1/20");
        assert_eq!(decision.context[keys::CHANNEL], "sms");
        assert!(!decision.context.contains_key(keys::PROCESSING_HINT));
    }

    #[tokio::test]
    async fn unknown_identity_is_unauthorized() {
        let engine = engine(GateConfig::default()).await;
        let decision = engine.decide("+15559999", &RequestMetadata::user(t0())).await;
        assert_eq!(decision.reason, Some(DenyReason::Unauthorized));
    }

    #[tokio::test]
    async fn inactive_identity_is_unauthorized() {
        let engine = engine(GateConfig::default()).await;
        let mut identity = Identity::active("+15550101", Tier::Elevated);
        identity.authorization_status = crate::model::AuthorizationStatus::Inactive;
        engine.register_identity(identity).await.unwrap();
        let decision = engine.decide("+15550101", &RequestMetadata::user(t0())).await;
        assert_eq!(decision.reason, Some(DenyReason::Unauthorized));
    }

    #[tokio::test]
    async fn warning_budget_attaches_a_hint() {
        let engine = engine(GateConfig::default()).await;
        engine.budget().observe("2026-10", 850.0).await.unwrap();
        let decision = engine.decide("+15550100", &RequestMetadata::user(t0())).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.context[keys::PROCESSING_HINT], "prefer_low_cost");
        assert_eq!(decision.context[keys::BUDGET_STATE], "warning");
    }

    #[tokio::test]
    async fn blocked_identity_is_denied_before_authorization() {
        let engine = engine(GateConfig::default()).await;
        engine
            .blocklist()
            .block("+15559999", BlockReason::Abuse, None, t0())
            .await
            .unwrap();
        let decision = engine.decide("+15559999", &RequestMetadata::user(t0())).await;
        assert_eq!(decision.reason, Some(DenyReason::Blocked(BlockReason::Abuse)));
        assert_eq!(decision.reason_code(), "abuse");
    }

    #[tokio::test]
    async fn low_reputation_denial_does_not_consume_quota() {
        let cfg = GateConfig {
            reputation_default_score: 30,
            ..GateConfig::default()
        };
        let engine = engine(cfg).await;
        let spammy = RequestMetadata::user(t0()).with_suspicion(1.0);
        let decision = engine.decide("+15550100", &spammy).await;
        assert_eq!(decision.reason, Some(DenyReason::LowReputation));

        let usage = engine
            .quota()
            .peek("+15550100", Tier::Standard, t0())
            .await
            .unwrap();
        assert_eq!(usage.usage(WindowKind::Day).unwrap().current, 0);
    }

    #[tokio::test]
    async fn allow_records_reputation_activity() {
        let engine = engine(GateConfig::default()).await;
        let decision = engine
            .decide("+15550100", &RequestMetadata::user(t0()).with_suspicion(0.8))
            .await;
        assert!(decision.is_allowed());
        let record = engine.reputation().load("+15550100", t0()).await.unwrap();
        assert_eq!(record.score, 34);
        assert_eq!(record.flag_count, 1);
    }
}
