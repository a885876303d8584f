// Configuration management module
// This file handles loading, defaulting and validation of gateway settings
// from an optional config file and GATE_* environment variables
//
// Numan Thabit 2025 Nov

use crate::errors::GateError;
use crate::model::Tier;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Upper bound for every day-denominated setting (about a century)
pub const MAX_DAYS: u64 = 36_500;

/// Gateway configuration. Every threshold the engine uses lives here so the
/// engine itself carries no ambient state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub daily_limit_standard: u64,
    pub daily_limit_elevated: u64,
    pub monthly_limit_standard: u64,
    pub monthly_limit_elevated: u64,
    /// Requests whose projected score falls below this are denied
    pub reputation_min_score: u8,
    /// Starting score for unseen identities
    pub reputation_default_score: u8,
    /// Negative events inside one flag window before auto-block
    pub reputation_flag_threshold: u32,
    pub reputation_flag_window_hours: u64,
    pub reputation_ttl_days: u64,
    /// Spend cap for one budget period (calendar month)
    pub budget_monthly_cap: f64,
    pub budget_soft_pct: f64,
    pub budget_hard_pct: f64,
    /// Lifetime of blocks written by the spam detector
    pub block_auto_expiry_days: u64,
    /// Retention margin past the end of a quota window
    pub quota_grace_days: u64,
    pub store_timeout_ms: u64,
    pub listen_addr: String,
    pub janitor_interval_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            daily_limit_standard: 20,
            daily_limit_elevated: 200,
            monthly_limit_standard: 300,
            monthly_limit_elevated: 3000,
            reputation_min_score: 20,
            reputation_default_score: 50,
            reputation_flag_threshold: 5,
            reputation_flag_window_hours: 24,
            reputation_ttl_days: 90,
            budget_monthly_cap: 1000.0,
            budget_soft_pct: 80.0,
            budget_hard_pct: 95.0,
            block_auto_expiry_days: 7,
            quota_grace_days: 2,
            store_timeout_ms: 250,
            listen_addr: "0.0.0.0:8080".to_string(),
            janitor_interval_secs: 60,
        }
    }
}

impl GateConfig {
    /// Load defaults, then `GATE_CONFIG_FILE` (or ./admission-gate.*), then
    /// `GATE_*` environment variables, and validate the result.
    pub fn load() -> Result<Self> {
        let file = std::env::var("GATE_CONFIG_FILE").unwrap_or_else(|_| "admission-gate".to_string());
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("GATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("assemble configuration sources")?;
        let cfg: GateConfig = cfg
            .try_deserialize()
            .context("deserialize gateway configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Collects every problem rather than stopping at the first
    pub fn validate(&self) -> Result<(), GateError> {
        let mut problems = Vec::new();

        for (name, value) in [
            ("daily_limit_standard", self.daily_limit_standard),
            ("daily_limit_elevated", self.daily_limit_elevated),
            ("monthly_limit_standard", self.monthly_limit_standard),
            ("monthly_limit_elevated", self.monthly_limit_elevated),
            ("reputation_flag_window_hours", self.reputation_flag_window_hours),
            ("reputation_ttl_days", self.reputation_ttl_days),
            ("block_auto_expiry_days", self.block_auto_expiry_days),
            ("store_timeout_ms", self.store_timeout_ms),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than zero"));
            }
        }
        for (name, days) in [
            ("reputation_ttl_days", self.reputation_ttl_days),
            ("block_auto_expiry_days", self.block_auto_expiry_days),
            ("quota_grace_days", self.quota_grace_days),
            ("reputation_flag_window_hours", self.reputation_flag_window_hours / 24),
        ] {
            if days > MAX_DAYS {
                problems.push(format!("{name} exceeds {MAX_DAYS} days"));
            }
        }
        if self.daily_limit_standard > self.monthly_limit_standard {
            problems.push("daily_limit_standard exceeds monthly_limit_standard".to_string());
        }
        if self.daily_limit_elevated > self.monthly_limit_elevated {
            problems.push("daily_limit_elevated exceeds monthly_limit_elevated".to_string());
        }
        if self.reputation_min_score > 100 {
            problems.push("reputation_min_score must be within 0..=100".to_string());
        }
        if self.reputation_default_score > 100 {
            problems.push("reputation_default_score must be within 0..=100".to_string());
        }
        if self.reputation_default_score < self.reputation_min_score {
            problems.push(
                "reputation_default_score below reputation_min_score denies every new identity"
                    .to_string(),
            );
        }
        if self.reputation_flag_threshold == 0 {
            problems.push("reputation_flag_threshold must be greater than zero".to_string());
        }
        if !(self.budget_monthly_cap.is_finite() && self.budget_monthly_cap > 0.0) {
            problems.push("budget_monthly_cap must be positive".to_string());
        }
        for (name, pct) in [
            ("budget_soft_pct", self.budget_soft_pct),
            ("budget_hard_pct", self.budget_hard_pct),
        ] {
            if !(pct > 0.0 && pct <= 100.0) {
                problems.push(format!("{name} must be within (0, 100]"));
            }
        }
        if self.budget_soft_pct >= self.budget_hard_pct {
            problems.push("budget_soft_pct must be below budget_hard_pct".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GateError::ConfigInvalid(problems.join("; ")))
        }
    }

    pub fn daily_limit(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Standard => self.daily_limit_standard,
            Tier::Elevated => self.daily_limit_elevated,
        }
    }

    pub fn monthly_limit(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Standard => self.monthly_limit_standard,
            Tier::Elevated => self.monthly_limit_elevated,
        }
    }

    pub fn soft_threshold(&self) -> f64 {
        self.budget_monthly_cap * self.budget_soft_pct / 100.0
    }

    pub fn hard_threshold(&self) -> f64 {
        self.budget_monthly_cap * self.budget_hard_pct / 100.0
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn quota_grace(&self) -> chrono::Duration {
        days(self.quota_grace_days)
    }

    pub fn flag_window(&self) -> chrono::Duration {
        i64::try_from(self.reputation_flag_window_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn block_auto_expiry(&self) -> chrono::Duration {
        days(self.block_auto_expiry_days)
    }

    pub fn reputation_ttl(&self) -> chrono::Duration {
        days(self.reputation_ttl_days)
    }
}

// Saturates instead of wrapping on out-of-range counts
fn days(count: u64) -> chrono::Duration {
    i64::try_from(count)
        .ok()
        .and_then(chrono::Duration::try_days)
        .unwrap_or(chrono::Duration::MAX)
}
