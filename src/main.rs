use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kontra::application::actors::engine_actor::{EngineActor, EngineMessage};
use kontra::application::actors::liquidation_feed::LiquidationFeed;
use kontra::config::{EngineConfig, FeedConfig};
use kontra::domain::entities::position::Position;
use kontra::domain::entities::trade::ClosedTrade;
use kontra::domain::repositories::indicator_provider::IndicatorProvider;
use kontra::domain::repositories::instrument_registry::InstrumentRegistry;
use kontra::domain::repositories::venue_client::VenueClient;
use kontra::domain::services::execution::ExecutionEngine;
use kontra::domain::services::ledger::PositionLedger;
use kontra::domain::services::protection::ProtectionManager;
use kontra::domain::services::reconciliation::ReconciliationEngine;
use kontra::domain::services::stats::{StatsSnapshot, TradingStats};
use kontra::infrastructure::bybit_client::{BybitClient, BybitConfig};
use kontra::infrastructure::indicator_service::{IndicatorConfig, KlineIndicatorService};
use kontra::infrastructure::instrument_registry::{BybitInstrumentRegistry, RegistryConfig};
use kontra::infrastructure::rate_limit::{create_limiter, RequestBudget};
use kontra::persistence::models::StateSnapshot;
use kontra::persistence::store::FileStateStore;
use kontra::secrets::VenueCredentials;
use kontra::task_runner::{run_interval_loop, LoopConfig};

#[derive(Clone)]
struct AppState {
    ledger: Arc<PositionLedger>,
    stats: Arc<TradingStats>,
    engine_tx: mpsc::Sender<EngineMessage>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kontra=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("kontra liquidation counter-trading engine starting");

    let cfg = EngineConfig::from_env();
    let feed_cfg = FeedConfig::from_env();

    let credentials = match VenueCredentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("cannot start without venue credentials: {e}");
            return Err(e.into());
        }
    };

    // Collaborators.
    let limiter = create_limiter(RequestBudget::default());
    let venue: Arc<dyn VenueClient> =
        Arc::new(BybitClient::new(credentials, BybitConfig::default(), limiter)?);
    let indicators: Arc<dyn IndicatorProvider> =
        Arc::new(KlineIndicatorService::new(IndicatorConfig::default()));
    let instruments: Arc<dyn InstrumentRegistry> =
        Arc::new(BybitInstrumentRegistry::new(RegistryConfig::default()));

    // State, restored from the last snapshot if one exists.
    let ledger = Arc::new(PositionLedger::new());
    let store = FileStateStore::new(&cfg.snapshot_path);
    match store.load().await {
        Ok(Some(snapshot)) => snapshot.restore_into(&ledger),
        Ok(None) => info!("no prior state snapshot; starting fresh"),
        Err(e) => warn!("state snapshot unreadable, starting fresh: {e}"),
    }

    let stats = Arc::new(TradingStats::new());
    let protection = Arc::new(ProtectionManager::new(
        cfg.clone(),
        Arc::clone(&venue),
        Arc::clone(&indicators),
        Arc::clone(&instruments),
        Arc::clone(&ledger),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        cfg.clone(),
        Arc::clone(&ledger),
        Arc::clone(&venue),
        Arc::clone(&indicators),
        Arc::clone(&instruments),
        Arc::clone(&protection),
        Arc::clone(&stats),
    ));
    let reconciliation = Arc::new(ReconciliationEngine::new(
        cfg.clone(),
        Arc::clone(&ledger),
        Arc::clone(&venue),
        Arc::clone(&protection),
    ));

    // Actors and background loops.
    let engine_tx = EngineActor::spawn(engine, Arc::clone(&ledger), Arc::clone(&stats));
    let _feed = LiquidationFeed::spawn(feed_cfg, cfg.qualify_threshold_usd, engine_tx.clone());

    {
        let reconciliation = Arc::clone(&reconciliation);
        let interval = Duration::from_secs(cfg.reconcile_interval_secs);
        tokio::spawn(async move {
            run_interval_loop("reconcile_tick", interval, LoopConfig::default(), || {
                let reconciliation = Arc::clone(&reconciliation);
                async move { reconciliation.tick().await.map(|_| ()) }
            })
            .await;
        });
    }
    {
        let reconciliation = Arc::clone(&reconciliation);
        let interval = Duration::from_secs(cfg.backfill_interval_secs);
        tokio::spawn(async move {
            run_interval_loop("backfill_sweep", interval, LoopConfig::default(), || {
                let reconciliation = Arc::clone(&reconciliation);
                async move { reconciliation.backfill_sweep().await.map(|_| ()) }
            })
            .await;
        });
    }
    {
        let ledger = Arc::clone(&ledger);
        let store = store.clone();
        let interval = Duration::from_secs(cfg.snapshot_interval_secs);
        tokio::spawn(async move {
            run_interval_loop("snapshot_save", interval, LoopConfig::default(), || {
                let ledger = Arc::clone(&ledger);
                let store = store.clone();
                async move { store.save(&StateSnapshot::capture(&ledger)).await }
            })
            .await;
        });
    }

    // Read-only surface.
    let state = AppState {
        ledger: Arc::clone(&ledger),
        stats: Arc::clone(&stats),
        engine_tx: engine_tx.clone(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/positions", get(get_positions))
        .route("/history", get(get_history))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("read surface listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final snapshot so a clean shutdown resumes exactly.
    if let Err(e) = store.save(&StateSnapshot::capture(&ledger)).await {
        warn!("final state snapshot failed: {e}");
    }
    let _ = engine_tx.send(EngineMessage::Shutdown).await;
    info!("kontra stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutdown signal received");
}

async fn health() -> &'static str {
    "ok"
}

async fn get_positions(State(state): State<AppState>) -> Json<Vec<Position>> {
    Json(state.ledger.positions_snapshot())
}

async fn get_history(State(state): State<AppState>) -> Json<Vec<ClosedTrade>> {
    Json(state.ledger.history_snapshot())
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    if state.engine_tx.send(EngineMessage::GetStats { reply: reply_tx }).await.is_ok() {
        if let Some(snapshot) = reply_rx.recv().await {
            return Json(snapshot);
        }
    }
    // Actor unavailable (shutdown in progress): read directly.
    Json(state.stats.snapshot(&state.ledger))
}
