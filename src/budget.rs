// Budget circuit breaker
// Tracks estimated spend per budget period against soft and hard thresholds
// and exposes the global Normal / Warning / Emergency state. Every state
// change is broadcast as an auditable transition event
//
// Numan Thabit 2025 Nov

use crate::config::GateConfig;
use crate::errors::GateError;
use crate::metrics::{BUDGET_STATE, BUDGET_TRANSITIONS};
use crate::model::{BudgetLevel, BudgetState};
use crate::store::{bounded, BudgetStore, BUDGET_STORE};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Computed from a spend observation
    Observation,
    /// Noticed at query time (period rollover, revision by another worker)
    Query,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetTransition {
    pub period_id: String,
    pub from: BudgetLevel,
    pub to: BudgetLevel,
    pub spend: f64,
    pub cause: TransitionCause,
}

/// Levels this process last reported, per period. Only used to make
/// transitions visible; classification never reads it.
#[derive(Debug, Default)]
struct SeenLevels {
    latest: Option<String>,
    levels: HashMap<String, BudgetLevel>,
}

impl SeenLevels {
    /// Record `level` for `period_id` and return the level to compare it
    /// against. Moving to a newer period compares with the period before it,
    /// so a rollover is reported. Older periods only compare with themselves.
    fn record(&mut self, period_id: &str, level: BudgetLevel) -> Option<BudgetLevel> {
        let own = self.levels.insert(period_id.to_string(), level);
        match self.latest.as_deref() {
            Some(latest) if period_id > latest => {
                let carried = own.or_else(|| self.levels.get(latest).copied());
                let previous = latest.to_string();
                self.levels.retain(|period, _| *period >= previous);
                self.latest = Some(period_id.to_string());
                carried
            }
            Some(_) => own,
            None => {
                self.latest = Some(period_id.to_string());
                own
            }
        }
    }

    fn is_latest(&self, period_id: &str) -> bool {
        self.latest.as_deref() == Some(period_id)
    }
}

#[derive(Clone)]
pub struct BudgetCircuitBreaker {
    store: Arc<dyn BudgetStore>,
    soft_threshold: f64,
    hard_threshold: f64,
    timeout: Duration,
    seen: Arc<Mutex<SeenLevels>>,
    tx: broadcast::Sender<BudgetTransition>,
}

impl BudgetCircuitBreaker {
    pub fn new(store: Arc<dyn BudgetStore>, config: &GateConfig) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            store,
            soft_threshold: config.soft_threshold(),
            hard_threshold: config.hard_threshold(),
            timeout: config.store_timeout(),
            seen: Arc::new(Mutex::new(SeenLevels::default())),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BudgetTransition> {
        self.tx.subscribe()
    }

    /// State is a pure function of spend; never cached
    pub fn classify(&self, spend: f64) -> BudgetLevel {
        if spend >= self.hard_threshold {
            BudgetLevel::Emergency
        } else if spend >= self.soft_threshold {
            BudgetLevel::Warning
        } else {
            BudgetLevel::Normal
        }
    }

    fn state_for(&self, period_id: &str, spend: f64) -> BudgetState {
        BudgetState {
            period_id: period_id.to_string(),
            period_estimated_spend: spend,
            soft_threshold: self.soft_threshold,
            hard_threshold: self.hard_threshold,
            state: self.classify(spend),
            degraded: false,
        }
    }

    /// Current state for `period_id`. When the spend cannot be read the
    /// breaker reports Warning, never Normal.
    pub async fn current_state(&self, period_id: &str) -> BudgetState {
        match bounded(
            BUDGET_STORE,
            "read",
            self.timeout,
            self.store.period_spend(period_id),
        )
        .await
        {
            Ok(spend) => {
                let state = self.state_for(period_id, spend);
                self.note(&state, None, TransitionCause::Query).await;
                state
            }
            Err(err) => {
                warn!(
                    period_id = %period_id,
                    error = %err,
                    "budget state unavailable; assuming warning"
                );
                BudgetState {
                    period_id: period_id.to_string(),
                    period_estimated_spend: f64::NAN,
                    soft_threshold: self.soft_threshold,
                    hard_threshold: self.hard_threshold,
                    state: BudgetLevel::Warning,
                    degraded: true,
                }
            }
        }
    }

    /// Record a spend delta reported by the cost estimator. Negative deltas
    /// revise the estimate downward and may recover the breaker.
    pub async fn observe(&self, period_id: &str, spend_delta: f64) -> Result<BudgetState, GateError> {
        if !spend_delta.is_finite() {
            return Err(GateError::InvalidInput(format!(
                "spend delta must be finite, got {spend_delta}"
            )));
        }
        let total = bounded(
            BUDGET_STORE,
            "add",
            self.timeout,
            self.store.add_spend(period_id, spend_delta),
        )
        .await?;
        let previous = self.classify((total - spend_delta).max(0.0));
        let state = self.state_for(period_id, total);
        self.note(&state, Some(previous), TransitionCause::Observation)
            .await;
        Ok(state)
    }

    async fn note(&self, state: &BudgetState, previous: Option<BudgetLevel>, cause: TransitionCause) {
        let mut seen = self.seen.lock().await;
        let recorded = seen.record(&state.period_id, state.state);
        let from = previous.or(recorded);
        // The gauge follows the newest period only
        if seen.is_latest(&state.period_id) {
            BUDGET_STATE.set(state.state.gauge_value());
        }
        drop(seen);

        let Some(from) = from else {
            return;
        };
        if from == state.state {
            return;
        }

        let transition = BudgetTransition {
            period_id: state.period_id.clone(),
            from,
            to: state.state,
            spend: state.period_estimated_spend,
            cause,
        };
        BUDGET_TRANSITIONS
            .with_label_values(&[from.as_str(), state.state.as_str()])
            .inc();
        if state.state > from {
            warn!(
                period_id = %transition.period_id,
                from = from.as_str(),
                to = state.state.as_str(),
                spend = transition.spend,
                hard_threshold = self.hard_threshold,
                "budget breaker escalated"
            );
        } else {
            info!(
                period_id = %transition.period_id,
                from = from.as_str(),
                to = state.state.as_str(),
                spend = transition.spend,
                "budget breaker recovered"
            );
        }
        // No subscribers is fine
        let _ = self.tx.send(transition);
    }
}
