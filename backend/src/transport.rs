// =============================================================================
// VISS GATEWAY — Transport adapters (axum HTTP + WebSocket)
// =============================================================================
// HTTP: GET /<path> is a get, POST /<path> with the value as body is a set.
// Signal paths are served by the router fallback.
// Each HTTP exchange is one clientId parked on a oneshot until the router
// answers. WebSocket: /ws carries full JSON envelopes both ways; a
// disconnect kills every subscription of that RouterId.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::sync::{mpsc, oneshot};
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::access::ConsentEvent;
use crate::history::HistoryHandle;
use crate::message::{Response, RouterId};
use crate::metrics::Metrics;
use crate::router::{normalize_path, TransportMessage, TransportRequest};

const HTTP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const WS_QUEUE: usize = 64;
const MAX_IN_FLIGHT: usize = 1024;

type Reply = (StatusCode, [(HeaderName, &'static str); 1], String);

fn json_reply(status: StatusCode, body: String) -> Reply { (status, [(header::CONTENT_TYPE, "application/json")], body) }

#[derive(Clone)]
pub struct AppState {
    req_tx: mpsc::Sender<TransportRequest>,
    history: HistoryHandle,
    consent_tx: mpsc::Sender<ConsentEvent>,
    m: Arc<Metrics>,
    http_mgr: usize,
    ws_mgr: usize,
    http_pending: Arc<DashMap<u64, oneshot::Sender<String>>>,
    ws_clients: Arc<DashMap<u64, mpsc::Sender<String>>>,
    next_client: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        req_tx: mpsc::Sender<TransportRequest>, history: HistoryHandle, consent_tx: mpsc::Sender<ConsentEvent>,
        m: Arc<Metrics>, http_mgr: usize, ws_mgr: usize,
    ) -> Self {
        Self {
            req_tx, history, consent_tx, m, http_mgr, ws_mgr,
            http_pending: Arc::new(DashMap::new()), ws_clients: Arc::new(DashMap::new()),
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Drains the router's per-manager queues into the waiting clients.
    pub fn spawn_dispatchers(&self, http_rx: mpsc::Receiver<TransportMessage>, ws_rx: mpsc::Receiver<TransportMessage>) {
        tokio::spawn(dispatch_http(http_rx, self.http_pending.clone()));
        tokio::spawn(dispatch_ws(ws_rx, self.ws_clients.clone(), self.m.clone()));
    }

    fn client_id(&self) -> u64 { self.next_client.fetch_add(1, Ordering::Relaxed) }
}

async fn dispatch_http(mut rx: mpsc::Receiver<TransportMessage>, pending: Arc<DashMap<u64, oneshot::Sender<String>>>) {
    while let Some(msg) = rx.recv().await {
        match pending.remove(&msg.client_id) {
            Some((_, tx)) => { let _ = tx.send(msg.payload); }
            None => debug!(client_id=msg.client_id, "http_reply_without_waiter"),
        }
    }
}

async fn dispatch_ws(mut rx: mpsc::Receiver<TransportMessage>, clients: Arc<DashMap<u64, mpsc::Sender<String>>>, m: Arc<Metrics>) {
    while let Some(msg) = rx.recv().await {
        let Some(tx) = clients.get(&msg.client_id) else {
            debug!(client_id=msg.client_id, "ws_client_gone");
            continue;
        };
        if tx.try_send(msg.payload).is_err() {
            Metrics::inc(&m.dropped);
            warn!(client_id=msg.client_id, "ws_client_queue_full");
        }
    }
}

pub fn app(s: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_upgrade))
        .route("/history", post(history_control))
        .route("/consent", post(consent))
        .fallback(http_adapter)
        .with_state(s)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT)),
        )
}

// --- HTTP adapter ------------------------------------------------------------

fn bearer(headers: &HeaderMap) -> Option<String> {
    let v = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    Some(v.strip_prefix("Bearer ").unwrap_or(v).to_string())
}

/// Maps the envelope's error number onto the HTTP status.
fn status_of(payload: &str) -> StatusCode {
    serde_json::from_str::<Json>(payload).ok()
        .and_then(|v| v["error"]["number"].as_str().and_then(|n| n.parse::<u16>().ok()))
        .and_then(|n| StatusCode::from_u16(n).ok())
        .unwrap_or(StatusCode::OK)
}

pub fn http_envelope(action: &str, path: &str, value: Option<String>, filter: Option<&str>, token: Option<String>) -> Json {
    let mut env = json!({"action": action, "path": normalize_path(path)});
    if let Some(v) = value { env["value"] = json!(v); }
    // non-JSON filters go through as strings and fail validation in the router
    if let Some(f) = filter { env["filter"] = serde_json::from_str(f).unwrap_or_else(|_| json!(f)); }
    if let Some(t) = token { env["authorization"] = json!(t); }
    env
}

async fn round_trip(s: &AppState, mut env: Json) -> Reply {
    let action = env["action"].as_str().unwrap_or("get").to_string();
    let cid = s.client_id();
    env["requestId"] = json!(cid.to_string());
    let (tx, rx) = oneshot::channel();
    s.http_pending.insert(cid, tx);
    if s.req_tx.send(TransportRequest::external(s.http_mgr, cid, env.to_string())).await.is_err() {
        s.http_pending.remove(&cid);
        return json_reply(StatusCode::SERVICE_UNAVAILABLE, Response::internal_error(&action, None).to_json());
    }
    match tokio::time::timeout(HTTP_REPLY_TIMEOUT, rx).await {
        Ok(Ok(payload)) => json_reply(status_of(&payload), payload),
        _ => {
            s.http_pending.remove(&cid);
            warn!(client_id=cid, "http_reply_timeout");
            let r = Response::error(&action, Some(cid.to_string()), 504, "Gateway Timeout", "No response from service.");
            json_reply(StatusCode::GATEWAY_TIMEOUT, r.to_json())
        }
    }
}

/// Every path not claimed by an operational route is a signal path.
async fn http_adapter(
    State(s): State<AppState>, method: Method, uri: Uri, Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap, body: Bytes,
) -> Reply {
    let env = match method {
        Method::GET => http_envelope("get", uri.path(), None, q.get("filter").map(String::as_str), bearer(&headers)),
        Method::POST => {
            let value = String::from_utf8_lossy(&body).trim().to_string();
            http_envelope("set", uri.path(), (!value.is_empty()).then_some(value), None, bearer(&headers))
        }
        _ => {
            let r = Response::error("unknown", None, 405, "Method Not Allowed", "Use GET or POST.");
            return json_reply(StatusCode::METHOD_NOT_ALLOWED, r.to_json());
        }
    };
    round_trip(&s, env).await
}

// --- WebSocket adapter ---------------------------------------------------------

async fn ws_upgrade(State(s): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session(s, socket))
}

async fn ws_session(s: AppState, mut socket: WebSocket) {
    let cid = s.client_id();
    let (tx, mut rx) = mpsc::channel::<String>(WS_QUEUE);
    s.ws_clients.insert(cid, tx);
    info!(client_id=cid, "ws_connected");
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(t))) => {
                    if s.req_tx.send(TransportRequest::external(s.ws_mgr, cid, t)).await.is_err() { break; }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Some(out) = rx.recv() => {
                if socket.send(Message::Text(out)).await.is_err() { break; }
            }
        }
    }
    s.ws_clients.remove(&cid);
    let kill = json!({"action": "internal-killsubscriptions", "RouterId": RouterId::new(s.ws_mgr, cid).to_string()});
    if s.req_tx.send(TransportRequest::internal(s.ws_mgr, cid, kill.to_string())).await.is_err() {
        warn!(client_id=cid, "kill_not_delivered");
    }
    info!(client_id=cid, "ws_disconnected");
}

// --- Operational endpoints ---------------------------------------------------

async fn health() -> StatusCode { StatusCode::OK }

async fn ready(State(s): State<AppState>) -> StatusCode {
    if s.req_tx.capacity() > 0 { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE }
}

async fn metrics(State(s): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, serde_json::to_string_pretty(&s.m.snapshot()).unwrap_or_default())
}

async fn history_control(State(s): State<AppState>, body: String) -> (StatusCode, String) {
    let status = s.history.control(&body).await;
    let code = status.split(' ').next().and_then(|c| c.parse::<u16>().ok())
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, status)
}

#[derive(Debug, Deserialize)]
pub struct ConsentBody {
    #[serde(rename = "gatingId")]
    pub gating_id: i64,
    pub consent: bool,
}

async fn consent(State(s): State<AppState>, axum::Json(b): axum::Json<ConsentBody>) -> StatusCode {
    let ev = if b.consent { ConsentEvent::Granted(b.gating_id) } else { ConsentEvent::Revoked(b.gating_id) };
    info!(gating_id=b.gating_id, consent=b.consent, "consent_event");
    match s.consent_tx.send(ev).await {
        Ok(_) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{GatingTable, UnavailableVerifier};
    use crate::curvelog::ClConfig;
    use crate::history::HistoryManager;
    use crate::router::Router;
    use crate::store::{MemoryStore, SignalStore};
    use crate::subscription::{ServiceConfig, SubscriptionManager};
    use crate::tree::VssTree;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn stack() -> (axum::Router, Arc<MemoryStore>, CancellationToken) {
        let store = Arc::new(MemoryStore::new());
        store.put("Vehicle.Speed", "42", "2026-01-01T00:00:00.000Z");
        let m = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();
        let (req_tx, req_rx) = mpsc::channel(64);
        let (svc_tx, svc_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let (consent_tx, consent_rx) = mpsc::channel(8);
        let (hist_tx, hist_rx) = mpsc::channel(8);

        let mut router = Router::new(
            Arc::new(VssTree::demo().unwrap()), Arc::new(UnavailableVerifier), svc_tx,
            GatingTable::new(4, Duration::from_secs(60)), m.clone(),
        );
        let (http_mgr, http_rx) = router.register_transport(64);
        let (ws_mgr, ws_rx) = router.register_transport(64);
        let history = HistoryHandle::new(hist_tx);
        let dyn_store: Arc<dyn SignalStore> = store.clone();
        let svc = SubscriptionManager::new(
            dyn_store.clone(), Some(history.clone()), ClConfig::default(), ServiceConfig::default(), out_tx, m.clone(),
        );
        tokio::spawn(router.run(req_rx, out_rx, consent_rx, shutdown.clone()));
        tokio::spawn(svc.run(svc_rx, shutdown.clone()));
        tokio::spawn(HistoryManager::new(vec!["Vehicle.Speed".into()], dyn_store, 4).run(hist_rx, shutdown.clone()));

        let state = AppState::new(req_tx, history, consent_tx, m, http_mgr, ws_mgr);
        state.spawn_dispatchers(http_rx, ws_rx);
        (app(state), store, shutdown)
    }

    async fn call(app: &axum::Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> { Request::get(uri).body(Body::empty()).unwrap() }

    #[test]
    fn test_http_envelope() {
        let env = http_envelope("get", "Vehicle/Cabin", None, Some(r#"{"type":"paths","parameter":"Lights"}"#), Some("tok".into()));
        assert_eq!(env["path"], "Vehicle.Cabin");
        assert_eq!(env["filter"]["type"], "paths");
        assert_eq!(env["authorization"], "tok");
        assert_eq!(http_envelope("get", "x", None, Some("junk"), None)["filter"], "junk");
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(&Response::ok("get", None).to_json()), StatusCode::OK);
        assert_eq!(status_of(&Response::error("get", None, 401, "Unauthorized", "").to_json()), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_http_get_and_set() {
        let (app, store, shutdown) = stack();
        let (status, body) = call(&app, get_req("/Vehicle/Speed")).await;
        assert_eq!(status, StatusCode::OK);
        let v: Json = serde_json::from_str(&body).unwrap();
        assert_eq!(v["data"]["dp"]["value"], "42");

        let (status, body) = call(&app, get_req("/Vehicle/Warp")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("No signals matching path."));

        let set = Request::post("/Vehicle/Cabin/Lights/IsDomeOn").body(Body::from("true")).unwrap();
        assert_eq!(call(&app, set).await.0, StatusCode::OK);
        assert_eq!(store.get("Vehicle.Cabin.Lights.IsDomeOn").unwrap().unwrap().value, "true");

        let illegal = Request::post("/Vehicle/Speed").body(Body::from("1")).unwrap();
        assert_eq!(call(&app, illegal).await.0, StatusCode::BAD_REQUEST);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_operational_endpoints() {
        let (app, _store, shutdown) = stack();
        assert_eq!(call(&app, get_req("/health")).await.0, StatusCode::OK);
        assert_eq!(call(&app, get_req("/ready")).await.0, StatusCode::OK);
        call(&app, get_req("/Vehicle/Speed")).await;
        let (_, body) = call(&app, get_req("/metrics")).await;
        let v: Json = serde_json::from_str(&body).unwrap();
        assert!(v["requests"].as_u64().unwrap() >= 1);

        let create = Request::post("/history").body(Body::from(r#"{"action":"create","path":"Vehicle.Speed","buf-size":"10"}"#)).unwrap();
        assert_eq!(call(&app, create).await, (StatusCode::OK, "200 OK".to_string()));
        let again = Request::post("/history").body(Body::from(r#"{"action":"create","path":"Vehicle.Speed","buf-size":"10"}"#)).unwrap();
        assert_eq!(call(&app, again).await.0, StatusCode::CONFLICT);
        shutdown.cancel();
    }
}
