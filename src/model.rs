// Core data model for the admission gate
// Identities, usage keys, reputation and block records, budget state and
// the transient admission decision handed back to callers
//
// Numan Thabit 2025 Nov

use crate::window::WindowKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const SCORE_MIN: u8 = 0;
pub const SCORE_MAX: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Active,
    Inactive,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Standard,
    Elevated,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Elevated => "elevated",
        }
    }
}

/// Authorization subject, allow-listed out of band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub authorization_status: AuthorizationStatus,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Identity {
    pub fn active(subject: impl Into<String>, tier: Tier) -> Self {
        Self {
            subject: subject.into(),
            authorization_status: AuthorizationStatus::Active,
            tier,
            user_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.authorization_status == AuthorizationStatus::Active
    }
}

/// Critical traffic (health checks, operator tooling) keeps flowing
/// while the budget breaker is in Emergency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestClass {
    #[default]
    User,
    Critical,
}

/// Per-request metadata supplied by the inbound channel
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetadata {
    pub class: RequestClass,
    pub timestamp: DateTime<Utc>,
    pub channel: Option<String>,
    /// Upstream content classifier output in [0, 1]
    pub suspicion: Option<f64>,
}

impl RequestMetadata {
    pub fn new(class: RequestClass, timestamp: DateTime<Utc>) -> Self {
        Self {
            class,
            timestamp,
            channel: None,
            suspicion: None,
        }
    }

    pub fn user(timestamp: DateTime<Utc>) -> Self {
        Self::new(RequestClass::User, timestamp)
    }

    pub fn critical(timestamp: DateTime<Utc>) -> Self {
        Self::new(RequestClass::Critical, timestamp)
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_suspicion(mut self, suspicion: f64) -> Self {
        self.suspicion = Some(suspicion);
        self
    }
}

/// Counter key: (identity, window kind, window label)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub identity: String,
    pub kind: WindowKind,
    pub window_key: String,
}

impl UsageKey {
    pub fn new(identity: &str, kind: WindowKind, ts: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            kind,
            window_key: kind.window_key(ts),
        }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "usage:{}:{}:{}", self.identity, self.kind, self.window_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub score: u8,
    pub last_activity_at: DateTime<Utc>,
    /// Negative events inside the current flag window
    pub flag_count: u32,
    pub flag_window_started_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl ReputationRecord {
    pub fn neutral(score: u8, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            score,
            last_activity_at: now,
            flag_count: 0,
            flag_window_started_at: None,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Abuse,
    Spam,
    Manual,
    CostViolation,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Abuse => "abuse",
            BlockReason::Spam => "spam",
            BlockReason::Manual => "manual",
            BlockReason::CostViolation => "cost_violation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub identity: String,
    pub reason: BlockReason,
    pub blocked_at: DateTime<Utc>,
    /// None = permanent
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlockEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Normal,
    Warning,
    Emergency,
}

impl BudgetLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetLevel::Normal => "normal",
            BudgetLevel::Warning => "warning",
            BudgetLevel::Emergency => "emergency",
        }
    }

    pub fn gauge_value(&self) -> i64 {
        match self {
            BudgetLevel::Normal => 0,
            BudgetLevel::Warning => 1,
            BudgetLevel::Emergency => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetState {
    pub period_id: String,
    pub period_estimated_spend: f64,
    pub soft_threshold: f64,
    pub hard_threshold: f64,
    pub state: BudgetLevel,
    /// Set when the spend could not be read and the state is a fail-closed default
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

/// Stable, user-facing deny codes; raw store errors never leak through here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blocked(BlockReason),
    BudgetEmergency,
    Unauthorized,
    QuotaExceeded(WindowKind),
    LowReputation,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Blocked(reason) => reason.as_str(),
            DenyReason::BudgetEmergency => "budget_emergency",
            DenyReason::Unauthorized => "unauthorized",
            DenyReason::QuotaExceeded(_) => "quota_exceeded",
            DenyReason::LowReputation => "low_reputation",
        }
    }

    pub fn window_kind(&self) -> Option<WindowKind> {
        match self {
            DenyReason::QuotaExceeded(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.window_kind() {
            Some(kind) => write!(f, "{} ({})", self.code(), kind),
            None => f.write_str(self.code()),
        }
    }
}

/// Context bag forwarded downstream with every decision
pub type DecisionContext = BTreeMap<String, String>;

/// Outcome of one `decide` call; never persisted
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    pub verdict: Verdict,
    pub reason: Option<DenyReason>,
    pub identity: String,
    pub context: DecisionContext,
}

impl AdmissionDecision {
    pub fn allow(identity: &str, context: DecisionContext) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: None,
            identity: identity.to_string(),
            context,
        }
    }

    pub fn deny(identity: &str, reason: DenyReason, context: DecisionContext) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason: Some(reason),
            identity: identity.to_string(),
            context,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    pub fn reason_code(&self) -> &'static str {
        self.reason.map_or("allowed", |reason| reason.code())
    }
}
