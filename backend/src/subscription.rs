// =============================================================================
// VISS GATEWAY — Subscription manager (service side)
// =============================================================================
// Single event loop that owns the subscription list. It multiplexes the
// request channel, timebased ticks, curve-logging results and a fixed-period
// range/change scan, so list edits never need a lock.
//
// Lifecycle: Created -> Active -> (Notifying)* -> Terminated. Curve-logging
// subscriptions terminate only after every worker reported its exit.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::curvelog::{ClEvent, ClJob, CurveLogger};
use crate::error::Result;
use crate::filter::{Filter, FilterList};
use crate::history::HistoryHandle;
use crate::message::{render_data, Action, DataPoint, Response, RouterId};
use crate::metrics::Metrics;
use crate::store::{read_or_na, SignalStore};
use crate::ticker::TickerPool;
use crate::value::{compare_values, Value};

/// Request as forwarded by the router: paths already resolved, access
/// already checked.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub router_id: RouterId,
    pub action: Action,
    pub request_id: Option<String>,
    pub paths: Vec<String>,
    pub value: Option<String>,
    pub filter: Option<FilterList>,
    pub subscription_id: Option<String>,
    pub gating_id: Option<i64>,
    pub token_handle: Option<String>,
}

impl ServiceRequest {
    pub fn new(router_id: RouterId, action: Action) -> Self {
        Self { router_id, action, request_id: None, paths: Vec::new(), value: None, filter: None,
               subscription_id: None, gating_id: None, token_handle: None }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceResponse { pub router_id: RouterId, pub response: Response }

#[derive(Debug)]
struct Subscription {
    id: u64,
    threads: usize,
    router_id: RouterId,
    paths: Vec<String>,
    filter: FilterList,
    latest: Option<DataPoint>,
    last_eval_ts: Option<String>,
    gating_id: Option<i64>,
    cl_cancel: Option<CancellationToken>,
    closing: bool,
    // consent withdrawn: draining workers' output is discarded
    revoked: bool,
}

impl Subscription {
    fn trigger(&self) -> Option<&Filter> { self.filter.trigger() }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig { pub scan_period: Duration, pub ticker_slots: usize }

impl Default for ServiceConfig {
    fn default() -> Self { Self { scan_period: Duration::from_millis(50), ticker_slots: crate::ticker::DEFAULT_TICKER_SLOTS } }
}

pub fn server_capabilities() -> Json {
    json!({
        "filter": ["paths", "timebased", "change", "range", "curvelog", "history", "static-metadata", "dynamic-metadata"],
        "access_ctrl": ["short_term", "long_term", "signalset_claim"],
        "transport_protocol": ["https", "wss"],
    })
}

pub struct SubscriptionManager {
    store: Arc<dyn SignalStore>,
    history: Option<HistoryHandle>,
    curvelog: CurveLogger,
    cl_rx: mpsc::Receiver<ClEvent>,
    tickers: TickerPool<u64>,
    tick_tx: mpsc::Sender<u64>,
    tick_rx: mpsc::Receiver<u64>,
    subs: Vec<Subscription>,
    next_id: u64,
    out: mpsc::Sender<ServiceResponse>,
    cfg: ServiceConfig,
    m: Arc<Metrics>,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn SignalStore>, history: Option<HistoryHandle>, cl_cfg: crate::curvelog::ClConfig,
        cfg: ServiceConfig, out: mpsc::Sender<ServiceResponse>, m: Arc<Metrics>,
    ) -> Self {
        let (cl_tx, cl_rx) = mpsc::channel(1024);
        let (tick_tx, tick_rx) = mpsc::channel(1024);
        Self {
            curvelog: CurveLogger::new(store.clone(), cl_cfg, cl_tx), store, history, cl_rx,
            tickers: TickerPool::new(cfg.ticker_slots), tick_tx, tick_rx,
            subs: Vec::new(), next_id: 1, out, cfg, m,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ServiceRequest>, shutdown: CancellationToken) {
        let mut scan = tokio::time::interval(self.cfg.scan_period);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(scan_ms=self.cfg.scan_period.as_millis() as u64, "service_manager_started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                req = rx.recv() => match req {
                    Some(r) => self.handle(r).await,
                    None => break,
                },
                Some(id) = self.tick_rx.recv() => self.on_tick(id),
                Some(ev) = self.cl_rx.recv() => self.on_curvelog(ev),
                _ = scan.tick() => self.scan(),
            }
        }
        for s in &self.subs { if let Some(c) = &s.cl_cancel { c.cancel(); } }
        info!(active=self.subs.len(), "service_manager_stopped");
    }

    async fn reply(&self, router_id: RouterId, response: Response) {
        if response.is_error() { debug!(router_id=%router_id, "service_error_reply"); }
        if self.out.send(ServiceResponse { router_id, response }).await.is_err() {
            error!("router channel closed");
        }
    }

    /// Notifications never block the loop; a full router queue drops them.
    fn notify(&self, router_id: RouterId, response: Response) {
        match self.out.try_send(ServiceResponse { router_id, response }) {
            Ok(_) => Metrics::inc(&self.m.notifications),
            Err(mpsc::error::TrySendError::Full(_)) => { Metrics::inc(&self.m.dropped); warn!(router_id=%router_id, "notification_dropped_queue_full"); }
            Err(mpsc::error::TrySendError::Closed(_)) => error!("router channel closed"),
        }
    }

    async fn handle(&mut self, r: ServiceRequest) {
        let resp = match r.action {
            Action::Get => self.get(&r).await,
            Action::Set => self.set(&r),
            Action::Subscribe => self.subscribe(&r),
            Action::Unsubscribe => self.unsubscribe(&r),
            Action::KillSubscriptions => { self.kill(r.router_id); return; }
            Action::CancelSubscription => { self.cancel_gated(r.gating_id); return; }
        };
        self.reply(r.router_id, resp).await;
    }

    async fn get(&self, r: &ServiceRequest) -> Response {
        let action = r.action.as_str();
        let rid = r.request_id.clone();
        let filter = r.filter.as_ref();
        if let Some(domain) = filter.and_then(FilterList::dynamic_metadata) {
            return match domain {
                "server_capabilities" => Response::ok(action, rid).with_metadata(server_capabilities()),
                d => Response::error(action, rid, 400, "Bad Request", &format!("Unsupported metadata domain '{d}'.")),
            };
        }
        if let Some(period) = filter.and_then(FilterList::history) {
            return self.get_history(r, period).await;
        }
        match self.read_all(&r.paths) {
            Ok(points) => Response::ok(action, rid).with_data(render_data(&points)),
            Err(e) => {
                Metrics::inc(&self.m.internal_errors);
                error!(error=%e, "get_store_failed");
                Response::internal_error(action, rid)
            }
        }
    }

    async fn get_history(&self, r: &ServiceRequest, period: &str) -> Response {
        let (action, rid) = (r.action.as_str(), r.request_id.clone());
        let Some(h) = &self.history else {
            return Response::error(action, rid, 404, "Not Found", "History not available.");
        };
        let mut items = Vec::new();
        for p in &r.paths {
            match h.get(p, period).await {
                Ok(Ok(Some(dp))) => items.push(json!({"path": p, "dp": dp})),
                Ok(Ok(None)) => {}
                Ok(Err(msg)) => return Response::error(action, rid, 400, "Bad Request", &msg),
                Err(e) => {
                    Metrics::inc(&self.m.internal_errors);
                    error!(error=%e, "history_unavailable");
                    return Response::internal_error(action, rid);
                }
            }
        }
        match items.len() {
            0 => Response::error(action, rid, 404, "Not Found", "No historic data available."),
            1 => Response::ok(action, rid).with_data(items.remove(0)),
            _ => Response::ok(action, rid).with_data(Json::Array(items)),
        }
    }

    fn set(&self, r: &ServiceRequest) -> Response {
        let (action, rid) = (r.action.as_str(), r.request_id.clone());
        let Some(value) = r.value.as_deref() else {
            return Response::error(action, rid, 400, "Bad Request", "Set requires a value.");
        };
        for p in &r.paths {
            if let Err(e) = self.store.set(p, value) {
                Metrics::inc(&self.m.internal_errors);
                error!(path=%p, error=%e, "set_store_failed");
                return Response::internal_error(action, rid);
            }
        }
        Response::ok(action, rid)
    }

    fn read_all(&self, paths: &[String]) -> Result<Vec<(String, DataPoint)>> {
        paths.iter().map(|p| Ok((p.clone(), read_or_na(self.store.as_ref(), p)?))).collect()
    }

    fn subscribe(&mut self, r: &ServiceRequest) -> Response {
        let (action, rid) = (r.action.as_str(), r.request_id.clone());
        let Some(filter) = r.filter.clone().filter(|f| !f.is_empty()) else {
            return Response::error(action, rid, 400, "Bad Request", "Filter missing.");
        };
        let Some(trigger) = filter.trigger().cloned() else {
            return Response::error(action, rid, 400, "Bad Request", "Invalid filter.");
        };
        let Some(first) = r.paths.first() else {
            return Response::error(action, rid, 400, "Bad Request", "No signals matching path.");
        };
        let latest = match self.store.get(first) {
            Ok(dp) => dp,
            Err(e) => {
                Metrics::inc(&self.m.internal_errors);
                error!(path=%first, error=%e, "subscribe_store_failed");
                return Response::internal_error(action, rid);
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let mut sub = Subscription {
            id, threads: 0, router_id: r.router_id, paths: r.paths.clone(), filter,
            last_eval_ts: latest.as_ref().map(|d| d.ts.clone()), latest,
            gating_id: r.gating_id, cl_cancel: None, closing: false, revoked: false,
        };
        match trigger {
            Filter::Timebased { period_ms } => {
                if self.tickers.allocate(id, Duration::from_millis(period_ms), self.tick_tx.clone()).is_none() {
                    Metrics::inc(&self.m.ticker_exhausted);
                    error!(sub_id=id, "ticker_pool_exhausted");
                    return Response::error(action, rid, 503, "Service Unavailable", "No timer available.");
                }
            }
            Filter::Curvelog { max_err, buf_size } => {
                let cancel = CancellationToken::new();
                let job = ClJob { sub_id: id, max_err, buf_size, paths: sub.paths.clone() };
                sub.threads = self.curvelog.spawn(job, cancel.clone());
                sub.cl_cancel = Some(cancel);
            }
            _ => {}
        }
        info!(sub_id=id, router_id=%r.router_id, trigger=trigger.type_name(), paths=sub.paths.len(), "subscription_created");
        Metrics::inc(&self.m.subscriptions_created);
        self.subs.push(sub);
        Response::ok(action, rid).with_subscription(id)
    }

    fn unsubscribe(&mut self, r: &ServiceRequest) -> Response {
        let (action, rid) = (r.action.as_str(), r.request_id.clone());
        let id = r.subscription_id.as_deref().and_then(|s| s.parse::<u64>().ok());
        let Some(idx) = id.and_then(|id| self.subs.iter().position(|s| s.id == id && !s.closing)) else {
            return Response::error(action, rid, 400, "Unsubscribe failed.", "Unknown or invalid subscriptionId.");
        };
        let sub_id = self.subs[idx].id;
        self.terminate(idx);
        Response::ok(action, rid).with_subscription(sub_id)
    }

    /// Stops the trigger and removes the entry, or for curve logging asks the
    /// workers to wind down and defers removal to the last exit.
    fn terminate(&mut self, idx: usize) {
        let sub = &mut self.subs[idx];
        let timebased = matches!(sub.trigger(), Some(Filter::Timebased { .. }));
        if timebased { self.tickers.release(&sub.id); }
        if sub.threads > 0 {
            sub.closing = true;
            if let Some(c) = &sub.cl_cancel { c.cancel(); }
            info!(sub_id=sub.id, threads=sub.threads, "subscription_draining");
            return;
        }
        let sub = self.subs.swap_remove(idx);
        Metrics::inc(&self.m.subscriptions_removed);
        info!(sub_id=sub.id, "subscription_removed");
    }

    fn kill(&mut self, router_id: RouterId) {
        let mut i = 0;
        while i < self.subs.len() {
            if self.subs[i].router_id == router_id && !self.subs[i].closing {
                let before = self.subs.len();
                self.terminate(i);
                if self.subs.len() < before { continue; }
            }
            i += 1;
        }
    }

    fn cancel_gated(&mut self, gating_id: Option<i64>) {
        let Some(gid) = gating_id else { return };
        while let Some(idx) = self.subs.iter().position(|s| s.gating_id == Some(gid) && !s.closing) {
            let (sid, rid) = (self.subs[idx].id, self.subs[idx].router_id);
            warn!(sub_id=sid, gating_id=gid, "subscription_cancelled_by_gating");
            let resp = Response::error("subscription", None, 401, "Token expired or consent cancelled", "").with_subscription(sid);
            self.notify(rid, resp);
            self.subs[idx].revoked = true;
            self.terminate(idx);
        }
    }

    fn on_tick(&self, id: u64) {
        let Some(sub) = self.subs.iter().find(|s| s.id == id) else { return };
        match self.read_all(&sub.paths) {
            Ok(points) => self.notify(sub.router_id, Response::notification(id, render_data(&points))),
            Err(e) => { Metrics::inc(&self.m.internal_errors); error!(sub_id=id, error=%e, "tick_store_failed"); }
        }
    }

    fn on_curvelog(&mut self, ev: ClEvent) {
        match ev {
            ClEvent::Points { sub_id, data } => {
                let Some(sub) = self.subs.iter().find(|s| s.id == sub_id) else { return };
                if sub.revoked { debug!(sub_id, "cl_points_after_revocation"); return; }
                Metrics::inc(&self.m.cl_batches);
                self.notify(sub.router_id, Response::notification(sub_id, data));
            }
            ClEvent::Exit { sub_id } => {
                let Some(idx) = self.subs.iter().position(|s| s.id == sub_id) else { return };
                let sub = &mut self.subs[idx];
                sub.threads = sub.threads.saturating_sub(1);
                debug!(sub_id, remaining=sub.threads, "cl_worker_drained");
                if sub.threads == 0 {
                    self.subs.swap_remove(idx);
                    Metrics::inc(&self.m.subscriptions_removed);
                    info!(sub_id, "subscription_removed");
                }
            }
        }
    }

    /// Range/change evaluation over every active subscription.
    fn scan(&mut self) {
        let store = self.store.clone();
        let mut fired: Vec<(RouterId, u64, DataPoint, String)> = Vec::new();
        for sub in self.subs.iter_mut().filter(|s| !s.closing) {
            let Some(trigger) = sub.filter.trigger() else { continue };
            if !matches!(trigger, Filter::Range(_) | Filter::Change { .. }) { continue; }
            let path = &sub.paths[0];
            let dp = match store.get(path) {
                Ok(Some(dp)) => dp,
                Ok(None) => continue,
                Err(e) => { warn!(sub_id=sub.id, error=%e, "scan_store_failed"); continue; }
            };
            let current = Value::parse(&dp.value);
            let hit = match trigger {
                Filter::Range(_) => {
                    if sub.last_eval_ts.as_deref() == Some(dp.ts.as_str()) { continue; }
                    sub.last_eval_ts = Some(dp.ts.clone());
                    trigger.range_holds(&current)
                }
                Filter::Change { op, diff } => match &sub.latest {
                    Some(l) if l.ts == dp.ts => continue,
                    Some(l) => compare_values(*op, &Value::parse(&l.value), &current, diff),
                    None => { sub.latest = Some(dp); continue; }
                },
                _ => false,
            };
            if hit {
                if matches!(trigger, Filter::Change { .. }) { sub.latest = Some(dp.clone()); }
                fired.push((sub.router_id, sub.id, dp, path.clone()));
            }
        }
        for (rid, id, dp, path) in fired {
            self.notify(rid, Response::notification(id, render_data(&[(path, dp)])));
        }
    }
}
