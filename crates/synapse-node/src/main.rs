//! Synapse contribution oracle entry point.
//!
//! Explicit construction of the service graph: storage, chain client, core
//! services, pipeline management and the HTTP edge, plus the periodic
//! tickers that drive reporting, distribution and liveness.

mod config;

use config::OracleConfig;
use std::sync::Arc;
use std::time::Duration;
use synapse_api::{ApiServer, AppState};
use synapse_chain::{parse_address, ChainClient, EvmChain};
use synapse_core::{
    ChainWatcher, ChallengeService, ContributionReporter, EpochDistributor, EpochScorer,
    NodeMonitor, ProofStore, ReplayGuard, TelemetryIngestor,
};
use synapse_pipeline::{Allocator, ClusterManager, ModelCatalog, TopologyBus};
use synapse_storage::Store;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const REPORT_TICK: Duration = Duration::from_secs(60);
const DISTRIBUTE_TICK: Duration = Duration::from_secs(60);
const REBALANCE_TICK: Duration = Duration::from_secs(60);
const SPONSORED_HEARTBEAT_TICK: Duration = Duration::from_secs(300);
const STALE_SWEEP_TICK: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OracleConfig::from_env()?;
    info!(
        production = config.production,
        api = %config.api_bind,
        "starting Synapse contribution oracle"
    );

    // Storage is the restart-recovery source of truth; bring it up first
    let store = Arc::new(Store::connect(&config.database_url).await?);
    store.run_migrations().await?;
    if config.production {
        store.verify_schema().await?;
    }

    let evm = Arc::new(
        EvmChain::connect(
            &config.ws_url,
            &config.oracle_private_key,
            config.chain_id,
            parse_address(&config.agent_registry_address)?,
            parse_address(&config.reward_pool_address)?,
            parse_address(&config.challenge_manager_address)?,
        )
        .await?,
    );
    let chain: Arc<dyn ChainClient> = evm.clone();

    // Pipeline management
    let bus = TopologyBus::new();
    let allocator = Arc::new(Allocator::new(
        store.clone(),
        ModelCatalog::new(),
        bus.clone(),
    ));
    let clusters = Arc::new(ClusterManager::new(
        store.clone(),
        ModelCatalog::new(),
        bus.clone(),
        allocator.clone(),
    ));
    clusters.bootstrap().await?;

    // Core services
    let replay = Arc::new(ReplayGuard::new());
    let scorer = Arc::new(EpochScorer::new(store.clone()));
    let proofs = Arc::new(ProofStore::new(store.clone()));
    let ingestor = Arc::new(TelemetryIngestor::new(
        store.clone(),
        chain.clone(),
        scorer.clone(),
        proofs.clone(),
        replay.clone(),
        config.oracle_api_key.clone(),
    ));
    ingestor.bootstrap().await?;

    let reporter = Arc::new(ContributionReporter::new(
        store.clone(),
        chain.clone(),
        scorer.clone(),
        config.report_interval_blocks,
    ));
    let distributor = Arc::new(EpochDistributor::new(store.clone(), chain.clone()));
    let monitor = Arc::new(NodeMonitor::new(
        store.clone(),
        chain.clone(),
        clusters.clone(),
        bus.clone(),
    ));
    let challenges = Arc::new(ChallengeService::new(
        store.clone(),
        chain.clone(),
        scorer.clone(),
    ));
    let watcher = Arc::new(ChainWatcher::new(evm.clone(), store.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // Periodic tickers; each carries its own non-reentrancy gate
    {
        let monitor = monitor.clone();
        let mut shutdown = shutdown_tx.subscribe();
        let interval = config.monitor_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.reconcile().await {
                            error!("monitor tick failed: {e}");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }

    {
        let reporter = reporter.clone();
        let mut shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPORT_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => reporter.tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }

    {
        let distributor = distributor.clone();
        let mut shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISTRIBUTE_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => distributor.tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }

    {
        let challenges = challenges.clone();
        let mut shutdown = shutdown_tx.subscribe();
        let interval = config.challenge_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => challenges.tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }

    {
        let monitor = monitor.clone();
        let mut shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SPONSORED_HEARTBEAT_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.sponsored_heartbeats().await {
                            error!("sponsored heartbeat tick failed: {e}");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }

    {
        let monitor = monitor.clone();
        let mut shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALE_SWEEP_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.sweep_stale().await {
                            error!("stale sweep failed: {e}");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }

    {
        let clusters = clusters.clone();
        let store = store.clone();
        let mut shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REBALANCE_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.list_models().await {
                            Ok(models) => {
                                for model in models {
                                    if let Err(e) = clusters.rebalance_model(&model).await {
                                        warn!(model = %model, "rebalance failed: {e}");
                                    }
                                }
                            }
                            Err(e) => error!("model enumeration failed: {e}"),
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }

    // Block-stream watcher
    {
        let watcher = watcher.clone();
        let shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            watcher.run(shutdown).await;
        }));
    }

    // HTTP edge
    let api = ApiServer::new(
        AppState {
            store: store.clone(),
            chain: chain.clone(),
            ingestor,
            scorer,
            proofs,
            allocator,
            clusters,
            replay,
            bus,
        },
        &config.api_bind,
    );
    {
        let shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = api.run(shutdown).await {
                error!("API server error: {e}");
            }
        }));
    }

    info!("oracle running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }

    info!("oracle stopped");
    Ok(())
}
