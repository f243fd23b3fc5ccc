// =============================================================================
// VISS GATEWAY — Vehicle signal access server (Rust/Axum/Tokio)
// =============================================================================
// Wiring: transports -> router/access gate -> subscription manager, with the
// history manager and curve-logging workers behind the service side. Every
// component is its own task joined by bounded channels.
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use viss_gateway::access::{GatingTable, HttpVerifier, TokenVerifier, UnavailableVerifier};
use viss_gateway::config::Config;
use viss_gateway::error::Result;
use viss_gateway::history::{HistoryHandle, HistoryManager};
use viss_gateway::metrics::Metrics;
use viss_gateway::router::Router;
use viss_gateway::store::{MemoryStore, SignalStore};
use viss_gateway::subscription::SubscriptionManager;
use viss_gateway::transport::{app, AppState};
use viss_gateway::tree::{SignalTree, VssTree};

const REQUEST_QUEUE: usize = 10_000;
const SERVICE_QUEUE: usize = 10_000;
const TRANSPORT_QUEUE: usize = 10_000;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or("viss_gateway=info,tower_http=info".into()))
        .json().init();
    if let Err(e) = run().await {
        error!(error=%e, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cfg = Config::from_env()?;
    info!(version=env!("CARGO_PKG_VERSION"), port=cfg.port, "VISS gateway starting");

    let tree: Arc<dyn SignalTree> = Arc::new(match &cfg.tree_path {
        Some(p) => VssTree::from_file(p)?,
        None => VssTree::demo()?,
    });
    let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
    let verifier: Arc<dyn TokenVerifier> = match &cfg.ats_url {
        Some(url) => Arc::new(HttpVerifier::new(url.clone())?),
        None => {
            warn!("no token verifier configured, gated requests will be rejected");
            Arc::new(UnavailableVerifier)
        }
    };
    let m = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE);
    let (svc_tx, svc_rx) = mpsc::channel(SERVICE_QUEUE);
    let (out_tx, out_rx) = mpsc::channel(SERVICE_QUEUE);
    let (consent_tx, consent_rx) = mpsc::channel(1024);
    let (hist_tx, hist_rx) = mpsc::channel(1024);

    let history = HistoryHandle::new(hist_tx);
    let hist = HistoryManager::new(tree.leaf_paths(), store.clone(), cfg.ticker_slots);
    tokio::spawn(hist.run(hist_rx, shutdown.clone()));

    let svc = SubscriptionManager::new(store, Some(history.clone()), cfg.curvelog(), cfg.service(), out_tx, m.clone());
    tokio::spawn(svc.run(svc_rx, shutdown.clone()));

    let mut router = Router::new(tree, verifier, svc_tx, GatingTable::new(cfg.gating_slots, cfg.gating_ttl), m.clone());
    let (http_mgr, http_rx) = router.register_transport(TRANSPORT_QUEUE);
    let (ws_mgr, ws_rx) = router.register_transport(TRANSPORT_QUEUE);
    tokio::spawn(router.run(req_rx, out_rx, consent_rx, shutdown.clone()));

    let state = AppState::new(req_tx, history, consent_tx, m, http_mgr, ws_mgr);
    state.spawn_dispatchers(http_rx, ws_rx);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { tokio::signal::ctrl_c().await.ok(); info!("shutdown"); stop.cancel(); })
        .await?;
    shutdown.cancel();
    Ok(())
}
