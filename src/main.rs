//! Bot Supervisor - per-subscriber trading worker lifecycle service
//!
//! 1. Receives subscriber snapshots and control calls over HTTP
//! 2. Synthesizes a per-subscriber config artifact from the base template
//! 3. Spawns and supervises one worker process per subscriber
//! 4. Restarts crashed workers with capped exponential backoff
//! 5. Answers status/balance queries without blocking control operations

use std::sync::Arc;

use tracing::{info, Level};

use bot_supervisor::{
    AppState, BalanceGateway, HttpBalanceSource, InMemorySubscriberStore, ManagerConfig,
    ProcessLauncher, Supervisor, TierPolicyRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting Bot Supervisor...");

    let cfg = ManagerConfig::load()?;
    info!(
        "Template: {}, artifacts: {}, worker: {}",
        cfg.template_path.display(),
        cfg.artifact_dir.display(),
        cfg.worker_bin.display()
    );

    let launcher = Arc::new(ProcessLauncher::new(cfg.worker_bin.clone()));
    let supervisor = Supervisor::new(&cfg, TierPolicyRegistry::new(), launcher);

    let source = Arc::new(HttpBalanceSource::new(cfg.balance_timeout())?);
    let gateway = BalanceGateway::new(source, cfg.balance_timeout(), cfg.balance_cache_ttl());

    let store = Arc::new(InMemorySubscriberStore::new());

    let state = Arc::new(AppState {
        supervisor,
        store,
        gateway,
    });
    let app = bot_supervisor::app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cfg.listen_port)).await?;
    info!("✓ Supervisor listening on port {}", cfg.listen_port);

    axum::serve(listener, app).await?;

    Ok(())
}
