// =============================================================================
// VISS GATEWAY — Request router / access gate
// =============================================================================
// Single event loop between the transport managers and the service side.
// Inbound: parse, validate, resolve paths against the tree, gate on access
// tokens, forward tagged with RouterId. Outbound: correlate by RouterId and
// hand the de-tagged payload to the owning transport's queue.
//
// Malformed and denied requests are answered locally and never reach the
// subscription manager.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::{token_error_message, ConsentEvent, GatingTable, TokenVerifier, VerifyRequest, CONSENT_PENDING};
use crate::filter::FilterList;
use crate::message::{Action, RawRequest, Response, RouterId};
use crate::metrics::Metrics;
use crate::subscription::{ServiceRequest, ServiceResponse};
use crate::tree::{NodeKind, NodeMatch, SignalTree, MAX_METADATA_DEPTH};

const EXPIRY_SCAN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin { External, Internal }

/// Raw client message as framed by a transport manager.
#[derive(Debug, Clone)]
pub struct TransportRequest { pub mgr_id: usize, pub client_id: u64, pub origin: Origin, pub payload: String }

impl TransportRequest {
    pub fn external(mgr_id: usize, client_id: u64, payload: impl Into<String>) -> Self {
        Self { mgr_id, client_id, origin: Origin::External, payload: payload.into() }
    }

    pub fn internal(mgr_id: usize, client_id: u64, payload: impl Into<String>) -> Self {
        Self { mgr_id, client_id, origin: Origin::Internal, payload: payload.into() }
    }
}

/// Outbound payload for one client of a transport manager.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage { pub client_id: u64, pub payload: String }

pub fn normalize_path(p: &str) -> String { p.trim().trim_matches('/').replace('/', ".") }

fn scalar_string(v: &Json) -> Option<String> {
    match v {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn static_depth(param: &str) -> usize { param.trim().parse::<usize>().unwrap_or(MAX_METADATA_DEPTH).min(MAX_METADATA_DEPTH) }

pub struct Router {
    tree: Arc<dyn SignalTree>,
    verifier: Arc<dyn TokenVerifier>,
    service_tx: mpsc::Sender<ServiceRequest>,
    transports: Vec<Option<mpsc::Sender<TransportMessage>>>,
    gating: GatingTable,
    m: Arc<Metrics>,
}

impl Router {
    pub fn new(
        tree: Arc<dyn SignalTree>, verifier: Arc<dyn TokenVerifier>, service_tx: mpsc::Sender<ServiceRequest>,
        gating: GatingTable, m: Arc<Metrics>,
    ) -> Self {
        Self { tree, verifier, service_tx, transports: Vec::new(), gating, m }
    }

    /// Registers a transport manager; returns its mgrId and outbound queue.
    pub fn register_transport(&mut self, capacity: usize) -> (usize, mpsc::Receiver<TransportMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = match self.transports.iter().position(Option::is_none) {
            Some(i) => { self.transports[i] = Some(tx); i }
            None => { self.transports.push(Some(tx)); self.transports.len() - 1 }
        };
        info!(mgr_id=id, "transport_registered");
        (id, rx)
    }

    pub async fn run(
        mut self, mut req_rx: mpsc::Receiver<TransportRequest>, mut svc_rx: mpsc::Receiver<ServiceResponse>,
        mut consent_rx: mpsc::Receiver<ConsentEvent>, shutdown: CancellationToken,
    ) {
        let mut expiry = tokio::time::interval(EXPIRY_SCAN);
        info!(transports=self.transports.len(), "router_started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                req = req_rx.recv() => match req {
                    Some(r) => self.serve(r).await,
                    None => break,
                },
                Some(resp) = svc_rx.recv() => self.deliver(resp),
                Some(ev) = consent_rx.recv() => self.on_consent(ev).await,
                _ = expiry.tick() => {
                    for gid in self.gating.expire(Instant::now()) {
                        info!(gating_id=gid, "gating_session_expired");
                        self.inject_cancel(gid).await;
                    }
                }
            }
        }
        info!("router_stopped");
    }

    /// Handles one inbound message and answers locally when required.
    pub async fn serve(&mut self, req: TransportRequest) {
        let rid = RouterId::new(req.mgr_id, req.client_id);
        if let Some(resp) = self.process(req).await {
            if resp.is_error() { debug!(router_id=%rid, error=?resp.error, "request_rejected"); }
            self.deliver(ServiceResponse { router_id: rid, response: resp });
        }
    }

    /// `Some` carries a local answer; `None` means forwarded (or internal).
    async fn process(&mut self, req: TransportRequest) -> Option<Response> {
        Metrics::inc(&self.m.requests);
        let rid = RouterId::new(req.mgr_id, req.client_id);
        let raw: RawRequest = match serde_json::from_str(&req.payload) {
            Ok(r) => r,
            Err(e) => {
                Metrics::inc(&self.m.malformed);
                warn!(router_id=%rid, error=%e, "malformed_request");
                return Some(Response::error("unknown", None, 400, "invalid request syntax", "Request is not valid JSON."));
            }
        };
        let reqid = raw.request_id.clone();
        let internal_ok = req.origin == Origin::Internal;
        let action = match Action::parse(&raw.action) {
            Some(Action::KillSubscriptions | Action::CancelSubscription) if !internal_ok => None,
            a => a,
        };
        let Some(action) = action else {
            Metrics::inc(&self.m.malformed);
            return Some(Response::error("unknown", reqid, 400, "invalid request syntax", "Unknown action."));
        };

        match action {
            Action::KillSubscriptions => {
                let target = raw.router_id.as_deref().and_then(RouterId::parse).unwrap_or(rid);
                self.forward(ServiceRequest::new(target, action));
                None
            }
            Action::CancelSubscription => {
                let Some(gid) = raw.gating_id.as_deref().and_then(|g| g.parse::<i64>().ok()) else {
                    warn!("cancel_without_gating_id");
                    return None;
                };
                let mut s = ServiceRequest::new(rid, action);
                s.gating_id = Some(gid);
                self.forward(s);
                None
            }
            Action::Unsubscribe => {
                let Some(sid) = raw.subscription_id.clone() else {
                    return Some(Response::error(action.as_str(), reqid, 400, "Unsubscribe failed.", "subscriptionId missing."));
                };
                let mut s = ServiceRequest::new(rid, action);
                s.request_id = reqid;
                s.subscription_id = Some(sid);
                self.forward(s)
            }
            Action::Get | Action::Set | Action::Subscribe => self.process_path_request(raw, action, rid).await,
        }
    }

    /// Never waits on the service queue: the service side awaits on our
    /// reply queue, so a blocking send here could stall both loops.
    /// External requests are refused with 503 when the queue is full;
    /// internal ones are handed to a task so they are not lost.
    fn forward(&self, s: ServiceRequest) -> Option<Response> {
        let (action, reqid) = (s.action, s.request_id.clone());
        match self.service_tx.try_send(s) {
            Ok(()) => None,
            Err(mpsc::error::TrySendError::Full(s)) if matches!(action, Action::KillSubscriptions | Action::CancelSubscription) => {
                let tx = self.service_tx.clone();
                tokio::spawn(async move { let _ = tx.send(s).await; });
                None
            }
            Err(mpsc::error::TrySendError::Full(s)) => {
                Metrics::inc(&self.m.service_busy);
                warn!(router_id=%s.router_id, action=action.as_str(), "service_queue_full");
                Some(Response::error(action.as_str(), reqid, 503, "Service Unavailable", "Service queue full."))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Metrics::inc(&self.m.internal_errors);
                error!("service channel closed");
                Some(Response::internal_error(action.as_str(), reqid))
            }
        }
    }

    async fn process_path_request(&mut self, raw: RawRequest, action: Action, rid: RouterId) -> Option<Response> {
        let a = action.as_str();
        let reqid = raw.request_id.clone();
        let bad = |msg: &str| Some(Response::error(a, raw.request_id.clone(), 400, "Bad Request", msg));

        let filter = match raw.filter.as_ref().map(FilterList::parse) {
            Some(Ok(f)) => Some(f),
            Some(Err(e)) => return bad(&e.0),
            None => None,
        };
        if let Some(f) = &filter {
            if f.trigger().is_some() && action != Action::Subscribe { return bad("Trigger filters are only valid for subscribe."); }
            if (f.history().is_some() || f.static_metadata().is_some() || f.dynamic_metadata().is_some()) && action != Action::Get {
                return bad("Filter type is only valid for get.");
            }
        }

        // dynamic metadata needs no path resolution
        if filter.as_ref().and_then(FilterList::dynamic_metadata).is_some() {
            let mut s = ServiceRequest::new(rid, action);
            s.request_id = reqid;
            s.filter = filter;
            return self.forward(s);
        }

        let roots: Vec<String> = match raw.path.as_ref() {
            Some(Json::String(p)) => vec![p.clone()],
            Some(Json::Array(a)) => match a.iter().map(|p| p.as_str().map(str::to_string)).collect::<Option<Vec<_>>>() {
                Some(v) if !v.is_empty() => v,
                _ => return bad("path must be a string or array of strings."),
            },
            _ => return bad("path missing."),
        };
        if roots.iter().any(|p| p.contains('*')) { return bad("Wildcards are only allowed in a paths filter."); }
        let roots: Vec<String> = roots.iter().map(|p| normalize_path(p)).collect();

        if let Some(param) = filter.as_ref().and_then(FilterList::static_metadata) {
            let md = self.tree.metadata(&roots[0], static_depth(param));
            return Some(match md {
                Some(md) => Response::ok(a, reqid).with_metadata(md),
                None => { Metrics::inc(&self.m.no_match); Response::error(a, reqid, 400, "No signals matching path.", "") }
            });
        }

        let patterns: Vec<String> = match filter.as_ref().and_then(FilterList::paths) {
            Some(rel) => roots.iter().flat_map(|r| rel.iter().map(move |p| format!("{r}.{}", normalize_path(p)))).collect(),
            None => roots,
        };
        let mut matches = Vec::new();
        for p in &patterns {
            for m in self.tree.search(p) {
                if !matches.iter().any(|x: &NodeMatch| x.path == m.path) { matches.push(m); }
            }
        }
        if matches.is_empty() {
            Metrics::inc(&self.m.no_match);
            return Some(Response::error(a, reqid, 400, "No signals matching path.", ""));
        }

        let value = raw.value.as_ref().and_then(scalar_string);
        if action == Action::Set {
            if value.is_none() { return bad("Set requires a value."); }
            if matches.iter().any(|m| m.kind != NodeKind::Actuator) {
                return Some(Response::error(a, reqid, 400, "Illegal command", "Set is only allowed on actuators."));
            }
        }

        let paths: Vec<String> = matches.iter().map(|m| m.path.clone()).collect();
        let tag = matches.iter().map(|m| m.validation).max().unwrap_or(0);
        let gated = if action == Action::Set { tag >= 1 } else { tag >= 2 };
        let (mut handle, mut gating_id) = (None, None);
        if gated {
            let Some(token) = raw.authorization.as_deref().filter(|t| !t.is_empty()) else {
                Metrics::inc(&self.m.access_denied);
                return Some(Response::error(a, reqid, 401, "Unauthorized", "Access token missing."));
            };
            match self.verifier.verify(&VerifyRequest::new(token, a, &paths, tag)).await {
                Ok(v) if v.code == 0 => {
                    if let Some(g) = v.gating_id {
                        if !self.gating.add_active(g, Instant::now()) { warn!(gating_id=g, "gating_active_list_full"); }
                    }
                    handle = v.handle;
                    gating_id = v.gating_id;
                }
                Ok(v) => {
                    Metrics::inc(&self.m.access_denied);
                    if v.code == CONSENT_PENDING {
                        if let Some(g) = v.gating_id { self.gating.add_pending(g, Instant::now()); }
                    }
                    info!(router_id=%rid, code=v.code, "access_denied");
                    return Some(Response::error(a, reqid, 401, "Unauthorized", token_error_message(v.code)));
                }
                Err(e) => {
                    Metrics::inc(&self.m.access_denied);
                    error!(error=%e, "verifier_unavailable");
                    return Some(Response::error(a, reqid, 503, "Service Unavailable", "Access token could not be verified."));
                }
            }
        }

        let mut s = ServiceRequest::new(rid, action);
        s.request_id = reqid;
        s.paths = paths;
        s.value = value;
        s.filter = filter;
        s.token_handle = handle;
        s.gating_id = gating_id;
        self.forward(s)
    }

    /// Routes a service-side message to its transport by mgrId.
    fn deliver(&self, resp: ServiceResponse) {
        let rid = resp.router_id;
        let Some(Some(tx)) = self.transports.get(rid.mgr_id) else {
            Metrics::inc(&self.m.dropped);
            warn!(router_id=%rid, "no_transport_for_response");
            return;
        };
        match tx.try_send(TransportMessage { client_id: rid.client_id, payload: resp.response.to_json() }) {
            Ok(_) => Metrics::inc(&self.m.responses),
            Err(mpsc::error::TrySendError::Full(_)) => { Metrics::inc(&self.m.dropped); warn!(router_id=%rid, "transport_queue_full"); }
            Err(mpsc::error::TrySendError::Closed(_)) => { Metrics::inc(&self.m.dropped); warn!(router_id=%rid, "transport_closed"); }
        }
    }

    async fn on_consent(&mut self, ev: ConsentEvent) {
        match ev {
            ConsentEvent::Granted(gid) => {
                if !self.gating.grant(gid, Instant::now()) { debug!(gating_id=gid, "consent_for_unknown_session"); }
            }
            ConsentEvent::Revoked(gid) => {
                if self.gating.revoke(gid) { self.inject_cancel(gid).await; }
            }
        }
    }

    /// Cancellation travels the ordinary request path.
    async fn inject_cancel(&mut self, gid: i64) {
        let payload = serde_json::json!({"action": "internal-cancelsubscription", "gatingId": gid.to_string(), "origin": "internal"});
        self.serve(TransportRequest::internal(usize::MAX, 0, payload.to_string())).await;
    }
}
