use admission_gate::api::create_api_router;
use admission_gate::config::GateConfig;
use admission_gate::engine::AdmissionEngine;
use admission_gate::reputation::SignalScoring;
use admission_gate::store::{
    MemoryBlocklistStore, MemoryBudgetStore, MemoryCounterStore, MemoryIdentityStore,
    MemoryReputationStore, Stores,
};
use admission_gate::window::budget_period_id;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("initialize tracing subscriber")?;

    if let Err(err) = run().await {
        tracing::error!(error = ?err, "fatal gateway error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config = GateConfig::load().context("load configuration")?;

    let counters = Arc::new(MemoryCounterStore::default());
    let reputation = Arc::new(MemoryReputationStore::default());
    let blocklist = Arc::new(MemoryBlocklistStore::default());
    let stores = Stores {
        counters: counters.clone(),
        reputation: reputation.clone(),
        blocklist: blocklist.clone(),
        identities: Arc::new(MemoryIdentityStore::default()),
        budget: Arc::new(MemoryBudgetStore::default()),
    };

    let engine = Arc::new(
        AdmissionEngine::new(config.clone(), stores, Arc::new(SignalScoring::default()))
            .context("construct admission engine")?,
    );

    let app = App {
        config: Arc::new(config),
        engine,
        counters,
        reputation,
        blocklist,
    };

    app.run().await
}

struct App {
    config: Arc<GateConfig>,
    engine: Arc<AdmissionEngine>,
    // Concrete handles kept for the TTL janitor
    counters: Arc<MemoryCounterStore>,
    reputation: Arc<MemoryReputationStore>,
    blocklist: Arc<MemoryBlocklistStore>,
}

impl App {
    async fn run(self) -> Result<()> {
        info!(
            listen = %self.config.listen_addr,
            daily_limit_standard = self.config.daily_limit_standard,
            monthly_limit_standard = self.config.monthly_limit_standard,
            budget_cap = self.config.budget_monthly_cap,
            "admission gateway online"
        );

        // Budget transitions are audited independently of the request path
        let mut transitions = self.engine.budget().subscribe();
        tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(t) => info!(
                        target: "audit",
                        period_id = %t.period_id,
                        from = t.from.as_str(),
                        to = t.to.as_str(),
                        spend = t.spend,
                        cause = ?t.cause,
                        "budget transition"
                    ),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "budget transition audit lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let api_addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {}", self.config.listen_addr))?;
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .with_context(|| format!("bind API server address {api_addr}"))?;
        let api_router = create_api_router(self.engine.clone());
        info!(address = %api_addr, "HTTP API server starting");
        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, api_router).await {
                warn!(error = %e, "API server error");
            }
        });

        let mut janitor =
            tokio::time::interval(Duration::from_secs(self.config.janitor_interval_secs.max(1)));
        let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = janitor.tick() => {
                    let now = Utc::now();
                    let counters = self.counters.purge_expired(now).await;
                    let reputation = self.reputation.purge_expired(now).await;
                    let blocks = self.blocklist.purge_expired(now).await;
                    debug!(counters, reputation, blocks, "expired records purged");
                }
                _ = heartbeat.tick() => {
                    let state = self
                        .engine
                        .budget()
                        .current_state(&budget_period_id(Utc::now()))
                        .await;
                    info!(
                        period_id = %state.period_id,
                        budget_state = state.state.as_str(),
                        spend = state.period_estimated_spend,
                        degraded = state.degraded,
                        "gateway heartbeat"
                    );
                }
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!(error = %err, "ctrl_c listener error");
                    }
                    info!("Shutdown signal received, exiting");
                    break;
                }
            }
        }
        api_handle.abort();
        Ok(())
    }
}

fn init_tracing() -> Result<()> {
    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,hyper=warn,tower_http=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber init: {err}"))
}
