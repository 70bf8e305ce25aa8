//! # Gridpilot — Grid Trading Engine
//!
//! ```text
//!  ┌─────────────┐  GET  /market/ticker        ┌─────────────────────────────┐
//!  │  Exchange   │ ◀────────────────────────── │ Scheduler (1 task)          │
//!  │  Bridge     │  GET  /market/candles       │ └─ Engine::tick             │
//!  │  (REST)     │  GET  /account/balance      │    volatility → grid / S1   │
//!  └─────────────┘  POST /order/send           │    → risk → throttle → fill │
//!                                              └──────────────┬──────────────┘
//!                                                             │ EngineHandle
//!  ┌─────────────┐  ws://host/ws/monitor  ◀────  AppState ◀───┘
//!  │  Dashboard  │  POST /api/engine/{pause,resume,stop}
//!  └─────────────┘  GET|PUT /api/engine/config · POST /api/backtest 📊
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gridpilot::{
    config::{ConfigStore, EngineConfig},
    engine::{
        backtest::{BacktestLedger, SimLedger},
        bridge::BridgeClient,
        gateway::{Collaborators, SystemClock},
        orchestrator::{Engine, EngineHandle},
        scheduler::Scheduler,
    },
    events::BroadcastNotifier,
    routes,
    state::{build_state, BROADCAST_CAPACITY},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("gridpilot=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║           GRIDPILOT — Grid Trading Engine             ║
  ║  Volatility · Grid · S1 · Risk · Throttle · Backtest  ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Config (fatal if invalid) ──────────────────────────────────────────
    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "❌ Refusing to start");
            return Err(e.into());
        }
    };
    info!(
        symbol   = %config.symbol,
        strategy = %config.strategy_mode,
        paper    = config.paper_trading,
        bridge   = %config.bridge_base_url,
        "⚙️ Config loaded"
    );

    // ── 4. Collaborators ──────────────────────────────────────────────────────
    let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    let notifier = Arc::new(BroadcastNotifier::new(broadcast_tx.clone()));

    let bridge = Arc::new(BridgeClient::new(reqwest::Client::new(), &config));
    let deps = if config.paper_trading {
        warn!(cash = config.paper_initial_cash, "📝 Paper trading: orders never reach the exchange");
        let paper = Arc::new(SimLedger::new(BacktestLedger::new(config.paper_initial_cash, 0.0), 0.0));
        Collaborators {
            feed:    bridge,
            orders:  paper.clone(),
            balance: paper,
            clock:   Arc::new(SystemClock::default()),
        }
    } else {
        Collaborators {
            feed:    bridge.clone(),
            orders:  bridge.clone(),
            balance: bridge,
            clock:   Arc::new(SystemClock::default()),
        }
    };

    // ── 5. Engine + scheduler ─────────────────────────────────────────────────
    let tick_interval = Duration::from_secs(config.tick_interval_secs);
    let handle = EngineHandle::new(ConfigStore::new(config)?, notifier);
    let engine = Engine::new(handle.clone(), deps).await;
    let scheduler = tokio::spawn(Scheduler::new(engine, tick_interval).run());

    // ── 6. Router ─────────────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(build_state(handle.clone(), broadcast_tx))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // ── 7. Bind & Serve ───────────────────────────────────────────────────────
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()?;

    info!(?addr, "🚀 Gridpilot server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_handle = handle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A stop from the API halts trading but keeps the monitor up
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Ctrl-C handler unavailable");
                std::future::pending::<()>().await;
            }
            info!("🛑 Ctrl-C received, stopping engine");
            shutdown_handle.stop();
        })
        .await?;

    // ── 8. Let the in-flight tick finish ──────────────────────────────────────
    handle.stop();
    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task panicked");
    }
    info!("👋 Gridpilot shut down");

    Ok(())
}
