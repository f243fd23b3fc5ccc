// =============================================================================
// VISS GATEWAY — History manager
// =============================================================================
// One entry per leaf path, loaded at startup. A small control protocol
// (create/start/stop/delete) arms periodic capture into a bounded buffer;
// `get` requests with a history filter read the buffer back through a time
// window. The entry list is owned by the manager's event loop.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as Json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::message::DataPoint;
use crate::store::SignalStore;
use crate::ticker::TickerPool;

pub const OK: &str = "200 OK";
pub const BAD_REQUEST: &str = "400 Bad Request";
pub const CONFLICT: &str = "409 Conflict";
pub const INTERNAL: &str = "500 Internal Server Error";

const MS_PER_HOUR: u64 = 3_600_000;

/// ISO8601 duration subset: `PnW`, `PnD`, `PTnH`, `PTnM`, `PTn[.n]S` and
/// combinations. Years and months have no fixed length and are rejected.
pub fn parse_period(s: &str) -> Option<chrono::Duration> {
    let rest = s.trim().strip_prefix('P')?;
    if rest.is_empty() { return None; }
    let (date, time) = match rest.split_once('T') {
        Some((d, t)) if !t.is_empty() => (d, Some(t)),
        Some(_) => return None,
        None => (rest, None),
    };
    let mut ms: f64 = 0.0;
    let mut scan = |part: &str, units: &[(char, f64)]| -> Option<()> {
        let mut num = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' { num.push(c); continue; }
            let (_, scale) = units.iter().find(|(u, _)| *u == c)?;
            let n: f64 = num.parse().ok()?;
            ms += n * scale;
            num.clear();
        }
        num.is_empty().then_some(())
    };
    scan(date, &[('W', 604_800_000.0), ('D', 86_400_000.0)])?;
    if let Some(t) = time { scan(t, &[('H', 3_600_000.0), ('M', 60_000.0), ('S', 1000.0)])?; }
    chrono::Duration::try_milliseconds(ms as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status { Idle, Created, Running, Stopped }

#[derive(Debug)]
struct HistoryEntry {
    path: String,
    frequency: u64,
    buf_size: usize,
    status: Status,
    buffer: Vec<DataPoint>,
}

pub enum HistoryCommand {
    Control { body: String, reply: oneshot::Sender<String> },
    Get { path: String, period: String, reply: oneshot::Sender<std::result::Result<Option<Json>, String>> },
}

#[derive(Clone)]
pub struct HistoryHandle { tx: mpsc::Sender<HistoryCommand> }

impl HistoryHandle {
    pub fn new(tx: mpsc::Sender<HistoryCommand>) -> Self { Self { tx } }

    /// Plain-text status line as defined by the control protocol.
    pub async fn control(&self, body: &str) -> String {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HistoryCommand::Control { body: body.to_string(), reply }).await.is_err() { return INTERNAL.into(); }
        rx.await.unwrap_or_else(|_| INTERNAL.into())
    }

    /// `Ok(None)` when nothing newer than the window start was captured.
    pub async fn get(&self, path: &str, period: &str) -> Result<std::result::Result<Option<Json>, String>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HistoryCommand::Get { path: path.to_string(), period: period.to_string(), reply }).await
            .map_err(|_| GatewayError::Channel("history"))?;
        rx.await.map_err(|_| GatewayError::Channel("history"))
    }
}

fn field(v: &Json, k: &str) -> Option<String> {
    match v.get(k)? { Json::String(s) => Some(s.clone()), Json::Number(n) => Some(n.to_string()), _ => None }
}

pub struct HistoryManager {
    entries: Vec<HistoryEntry>,
    store: Arc<dyn SignalStore>,
    tickers: TickerPool<usize>,
    tick_tx: mpsc::Sender<usize>,
    tick_rx: mpsc::Receiver<usize>,
}

impl HistoryManager {
    pub fn new(paths: Vec<String>, store: Arc<dyn SignalStore>, ticker_slots: usize) -> Self {
        let entries = paths.into_iter()
            .map(|path| HistoryEntry { path, frequency: 0, buf_size: 0, status: Status::Idle, buffer: Vec::new() })
            .collect();
        let (tick_tx, tick_rx) = mpsc::channel(1024);
        Self { entries, store, tickers: TickerPool::new(ticker_slots), tick_tx, tick_rx }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<HistoryCommand>, shutdown: CancellationToken) {
        info!(paths=self.entries.len(), "history_manager_started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(HistoryCommand::Control { body, reply }) => { let _ = reply.send(self.control(&body)); }
                    Some(HistoryCommand::Get { path, period, reply }) => { let _ = reply.send(self.get(&path, &period, Utc::now())); }
                    None => break,
                },
                Some(idx) = self.tick_rx.recv() => self.capture(idx),
            }
        }
        info!("history_manager_stopped");
    }

    fn control(&mut self, body: &str) -> String {
        let Ok(req) = serde_json::from_str::<Json>(body) else { return BAD_REQUEST.into() };
        let (Some(action), Some(path)) = (field(&req, "action"), field(&req, "path")) else { return BAD_REQUEST.into() };
        let Some(idx) = self.entries.iter().position(|e| e.path == path) else { return BAD_REQUEST.into() };
        let status = match action.as_str() {
            "create" => self.create(idx, field(&req, "buf-size")),
            "start" => self.start(idx, field(&req, "frequency")),
            "stop" => self.stop(idx),
            "delete" => self.delete(idx),
            _ => BAD_REQUEST,
        };
        info!(action=%action, path=%path, status, "history_control");
        status.into()
    }

    fn create(&mut self, idx: usize, buf_size: Option<String>) -> &'static str {
        let Some(n) = buf_size.and_then(|b| b.parse::<usize>().ok()).filter(|n| *n > 0) else { return BAD_REQUEST };
        let e = &mut self.entries[idx];
        if e.status != Status::Idle { return CONFLICT; }
        e.buf_size = n;
        e.buffer = Vec::with_capacity(n);
        e.status = Status::Created;
        OK
    }

    fn start(&mut self, idx: usize, frequency: Option<String>) -> &'static str {
        let Some(f) = frequency.and_then(|f| f.parse::<u64>().ok()).filter(|f| *f > 0 && *f <= MS_PER_HOUR) else { return BAD_REQUEST };
        match self.entries[idx].status {
            Status::Idle => return BAD_REQUEST,
            Status::Running => return CONFLICT,
            Status::Created | Status::Stopped => {}
        }
        let period = Duration::from_millis(MS_PER_HOUR / f);
        if self.tickers.allocate(idx, period, self.tick_tx.clone()).is_none() {
            warn!(path=%self.entries[idx].path, "history_ticker_pool_exhausted");
            return INTERNAL;
        }
        let e = &mut self.entries[idx];
        e.frequency = f;
        e.status = Status::Running;
        OK
    }

    fn stop(&mut self, idx: usize) -> &'static str {
        if self.entries[idx].status != Status::Running { return CONFLICT; }
        self.tickers.release(&idx);
        self.entries[idx].status = Status::Stopped;
        OK
    }

    fn delete(&mut self, idx: usize) -> &'static str {
        let e = &mut self.entries[idx];
        match e.status {
            Status::Running => CONFLICT,
            Status::Idle => BAD_REQUEST,
            Status::Created | Status::Stopped => {
                e.frequency = 0;
                e.buf_size = 0;
                e.buffer = Vec::new();
                e.status = Status::Idle;
                OK
            }
        }
    }

    fn capture(&mut self, idx: usize) {
        let Some(e) = self.entries.get_mut(idx) else { return };
        if e.status != Status::Running || e.buffer.len() >= e.buf_size { return; }
        match self.store.get(&e.path) {
            Ok(Some(dp)) => {
                if e.buffer.last().map(|l| l.ts.as_str()) != Some(dp.ts.as_str()) {
                    debug!(path=%e.path, freq=e.frequency, n=e.buffer.len() + 1, "history_capture");
                    e.buffer.push(dp);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(path=%e.path, error=%err, "history_read_failed"),
        }
    }

    fn get(&self, path: &str, period: &str, now: DateTime<Utc>) -> std::result::Result<Option<Json>, String> {
        let e = self.entries.iter().find(|e| e.path == path).ok_or_else(|| format!("no history for {path}"))?;
        let window = parse_period(period).ok_or_else(|| format!("invalid period '{period}'"))?;
        let cutoff = now.checked_sub_signed(window).ok_or_else(|| format!("invalid period '{period}'"))?;
        let mut hits: Vec<Json> = Vec::new();
        for dp in e.buffer.iter().rev() {
            let Ok(t) = DateTime::parse_from_rfc3339(&dp.ts) else { continue };
            if t.with_timezone(&Utc) <= cutoff { break; }
            hits.push(json!({"value": dp.value, "ts": dp.ts}));
        }
        Ok(match hits.len() {
            0 => None,
            1 => hits.pop(),
            _ => { hits.reverse(); Some(Json::Array(hits)) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> (HistoryManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (HistoryManager::new(vec!["Vehicle.Speed".into()], store.clone(), 4), store)
    }

    fn ctl(action: &str, extra: &str) -> String {
        format!(r#"{{"action":"{action}","path":"Vehicle.Speed"{extra}}}"#)
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("PT1H"), chrono::Duration::try_hours(1));
        assert_eq!(parse_period("P2DT30M"), chrono::Duration::try_minutes(2 * 24 * 60 + 30));
        assert_eq!(parse_period("PT1.5S"), chrono::Duration::try_milliseconds(1500));
        assert!(parse_period("P1Y").is_none());
        assert!(parse_period("P").is_none());
        assert!(parse_period("PT").is_none());
        assert!(parse_period("1H").is_none());
    }

    #[tokio::test]
    async fn test_control_lifecycle() {
        let (mut m, _) = manager();
        assert_eq!(m.control(&ctl("start", r#","frequency":"60""#)), BAD_REQUEST);
        assert_eq!(m.control(&ctl("create", r#","buf-size":"10""#)), OK);
        assert_eq!(m.control(&ctl("create", r#","buf-size":"10""#)), CONFLICT);
        assert_eq!(m.control(&ctl("start", r#","frequency":"3600""#)), OK);
        assert_eq!(m.control(&ctl("delete", "")), CONFLICT);
        assert_eq!(m.control(&ctl("stop", "")), OK);
        assert_eq!(m.control(&ctl("delete", "")), OK);
        assert_eq!(m.control("not json"), BAD_REQUEST);
        assert_eq!(m.control(r#"{"action":"create","path":"Nope","buf-size":"1"}"#), BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_capture_dedups_and_caps() {
        let (mut m, store) = manager();
        m.control(&ctl("create", r#","buf-size":"2""#));
        m.entries[0].status = Status::Running;
        store.put("Vehicle.Speed", "10", "2024-01-01T00:00:00Z");
        m.capture(0);
        m.capture(0);
        assert_eq!(m.entries[0].buffer.len(), 1);
        store.put("Vehicle.Speed", "11", "2024-01-01T00:00:01Z");
        m.capture(0);
        store.put("Vehicle.Speed", "12", "2024-01-01T00:00:02Z");
        m.capture(0);
        assert_eq!(m.entries[0].buffer.len(), 2);
    }

    #[test]
    fn test_get_window() {
        let (mut m, _) = manager();
        m.control(&ctl("create", r#","buf-size":"10""#));
        for (v, ts) in [("1", "2024-01-01T00:00:00Z"), ("2", "2024-01-01T00:30:00Z"), ("3", "2024-01-01T00:50:00Z")] {
            m.entries[0].buffer.push(DataPoint::new(v, ts));
        }
        let now: DateTime<Utc> = "2024-01-01T01:00:00Z".parse().unwrap();
        let one = m.get("Vehicle.Speed", "PT15M", now).unwrap().unwrap();
        assert_eq!(one["value"], "3");
        let two = m.get("Vehicle.Speed", "PT45M", now).unwrap().unwrap();
        assert_eq!(two.as_array().map(|a| a.len()), Some(2));
        assert_eq!(two[0]["value"], "2");
        assert!(m.get("Vehicle.Speed", "PT1M", now).unwrap().is_none());
        assert!(m.get("Vehicle.Speed", "bogus", now).is_err());
    }

    #[tokio::test]
    async fn test_oversized_period_is_rejected() {
        let (m, _) = manager();
        let now: DateTime<Utc> = "2024-01-01T01:00:00Z".parse().unwrap();
        assert!(m.get("Vehicle.Speed", "P99999999999W", now).is_err());

        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(m.run(rx, shutdown.clone()));
        let h = HistoryHandle::new(tx);
        assert!(h.get("Vehicle.Speed", "P99999999999W").await.unwrap().is_err());
        assert_eq!(h.control(&ctl("create", r#","buf-size":"4""#)).await, OK);
        shutdown.cancel();
        assert!(task.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_captures_on_tick() {
        let (m, store) = manager();
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        tokio::spawn(m.run(rx, shutdown.clone()));
        let h = HistoryHandle::new(tx);
        store.put("Vehicle.Speed", "42", &chrono::Utc::now().to_rfc3339());
        assert_eq!(h.control(&ctl("create", r#","buf-size":"5""#)).await, OK);
        assert_eq!(h.control(&ctl("start", r#","frequency":"3600""#)).await, OK);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let got = h.get("Vehicle.Speed", "PT1H").await.unwrap().unwrap().unwrap();
        assert_eq!(got["value"], "42");
        shutdown.cancel();
    }
}
