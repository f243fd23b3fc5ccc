// =============================================================================
// VISS GATEWAY — Curve logging
// =============================================================================
// Online lossy reduction of sampled signals. One worker per signal group
// (1, 2 or 3 coupled signals) samples the store at a fixed cadence into a
// ring buffer and, once the window is full, keeps only the samples whose
// removal would break the caller's error bound (recursive split on maximum
// residual). Results and worker exits travel to the subscription manager on
// a channel; workers never touch subscription state.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ringbuf::RingBuffer;
use crate::store::SignalStore;

#[derive(Debug, Clone)]
pub struct ClConfig { pub period: Duration, pub max_buf: usize }

impl Default for ClConfig {
    fn default() -> Self { Self { period: Duration::from_millis(800), max_buf: 240 } }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClEvent {
    /// `data` is an array of `{"path":..,"dp":[..]}` fragments.
    Points { sub_id: u64, data: Json },
    Exit { sub_id: u64 },
}

#[derive(Debug, Clone)]
pub struct ClJob { pub sub_id: u64, pub max_err: f64, pub buf_size: usize, pub paths: Vec<String> }

/// A sample as the reduction sees it: seconds since window start, one value
/// per dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClPoint<const D: usize> { pub t: f64, pub v: [f64; D] }

/// Indices in `(first, last)` that must be kept so that linear interpolation
/// between consecutive kept points (endpoints included) stays within
/// `max_err`. Multi-dimensional residuals combine as a sum of squares
/// compared against `max_err^2`. Returned ascending.
///
/// A zero-width interval (equal endpoint timestamps) has no defined slope and
/// yields no split.
pub fn reduce<const D: usize>(buf: &[ClPoint<D>], first: usize, last: usize, max_err: f64) -> Vec<usize> {
    if last <= first + 1 || last >= buf.len() { return Vec::new(); }
    let (a, b) = (buf[first], buf[last]);
    let dt = b.t - a.t;
    if dt == 0.0 || !dt.is_finite() { return Vec::new(); }
    let mut slope = [0.0; D];
    for d in 0..D { slope[d] = (b.v[d] - a.v[d]) / dt; }

    let (mut worst, mut worst_idx) = (0.0f64, first);
    for (i, p) in buf.iter().enumerate().take(last).skip(first + 1) {
        let mut err = 0.0;
        for d in 0..D {
            let r = p.v[d] - (a.v[d] + slope[d] * (p.t - a.t));
            err += r * r;
        }
        if err > worst { worst = err; worst_idx = i; }
    }
    if worst <= max_err * max_err { return Vec::new(); }

    let mut kept = reduce(buf, first, worst_idx, max_err);
    kept.push(worst_idx);
    kept.extend(reduce(buf, worst_idx, last, max_err));
    kept
}

/// Sibling Latitude/Longitude(/Altitude) leaves form one 2D (3D) group;
/// every other path is sampled on its own.
pub fn group_paths(paths: &[String]) -> Vec<Vec<String>> {
    let mut used = vec![false; paths.len()];
    let mut groups = Vec::new();
    for (i, p) in paths.iter().enumerate() {
        let Some(parent) = p.strip_suffix(".Latitude") else { continue };
        let find = |leaf: &str| paths.iter().position(|q| q == &format!("{parent}.{leaf}"));
        let Some(lon) = find("Longitude") else { continue };
        let mut g = vec![i, lon];
        if let Some(alt) = find("Altitude") { g.push(alt); }
        if g.iter().any(|&k| used[k]) { continue; }
        for &k in &g { used[k] = true; }
        groups.push(g.into_iter().map(|k| paths[k].clone()).collect());
    }
    for (i, p) in paths.iter().enumerate() {
        if !used[i] { groups.push(vec![p.clone()]); }
    }
    groups
}

fn ts_secs(ts: &str) -> Option<f64> {
    DateTime::parse_from_rfc3339(ts).ok().map(|t| t.timestamp_millis() as f64 / 1000.0)
}

/// Buffered sample: absolute seconds and parsed value for the reduction,
/// raw strings for rendering.
#[derive(Debug, Clone, PartialEq)]
struct Dp { secs: f64, v: f64, value: String, ts: String }

struct Worker<const D: usize> {
    job: ClJob,
    paths: [String; D],
    rings: [RingBuffer; D],
    window: usize,
    emitted_any: bool,
    last_emitted_ts: Option<String>,
}

impl<const D: usize> Worker<D> {
    fn new(job: ClJob, paths: [String; D], max_buf: usize) -> Self {
        let window = job.buf_size.min(max_buf).max(1);
        let rings = std::array::from_fn(|_| RingBuffer::new(window + 1));
        Self { job, paths, rings, window, emitted_any: false, last_emitted_ts: None }
    }

    /// Writes a new sample if every dimension shares one fresh timestamp and
    /// all values are numeric.
    fn capture(&mut self, store: &dyn SignalStore) -> bool {
        let mut vals: Vec<(String, String)> = Vec::with_capacity(D);
        for p in &self.paths {
            match store.get(p) {
                Ok(Some(dp)) => vals.push((dp.value, dp.ts)),
                Ok(None) => return false,
                Err(e) => { warn!(sub_id=self.job.sub_id, path=%p, error=%e, "cl_read_failed"); return false; }
            }
        }
        let ts = &vals[0].1;
        if vals.iter().any(|(_, t)| t != ts) { debug!(sub_id=self.job.sub_id, "cl_misaligned_sample"); return false; }
        if self.rings[0].latest_ts() == Some(ts.as_str()) { return false; }
        if ts_secs(ts).is_none() || vals.iter().any(|(v, _)| v.trim().parse::<f64>().is_err()) { return false; }
        for (d, (v, t)) in vals.iter().enumerate() { self.rings[d].write(v, t); }
        true
    }

    fn dp_at(&self, d: usize, offset: usize) -> Option<Dp> {
        let e = self.rings[d].read(offset)?;
        Some(Dp { secs: ts_secs(&e.ts)?, v: e.value.trim().parse().ok()?, value: e.value.clone(), ts: e.ts.clone() })
    }

    fn render(&self, per_dim: &[Vec<Dp>]) -> Json {
        let items: Vec<Json> = self.paths.iter().zip(per_dim).map(|(p, dps)| {
            let dp: Vec<Json> = dps.iter().map(|x| json!({"value": x.value, "ts": x.ts})).collect();
            json!({"path": p, "dp": dp})
        }).collect();
        Json::Array(items)
    }

    /// Reduces the populated window and returns the fragment to emit. The
    /// window is consumed up to its newest emitted sample, which anchors the
    /// next reduction, so every dropped sample lies between two emitted ones.
    fn analyze(&mut self) -> Option<Json> {
        let n = self.rings[0].populated();
        // a lone retained anchor was already emitted
        if n == 0 || (n == 1 && self.emitted_any) { return None; }
        // chronological: index 0 is the oldest populated sample
        let offset = |i: usize| n - 1 - i;
        let base = self.dp_at(0, offset(0))?.secs;
        let mut pts: Vec<ClPoint<D>> = Vec::with_capacity(n);
        for i in 0..n {
            let mut v = [0.0; D];
            let mut t = 0.0;
            for (d, slot) in v.iter_mut().enumerate() {
                let dp = self.dp_at(d, offset(i))?;
                *slot = dp.v;
                t = dp.secs - base;
            }
            pts.push(ClPoint { t, v });
        }

        let selected = if n >= 3 { reduce(&pts, 0, n - 1, self.job.max_err) } else { Vec::new() };
        let keep = selected.last().map_or(1, |&last| n - last);
        let mut idx: Vec<usize> = Vec::with_capacity(selected.len() + 2);
        if !self.emitted_any { idx.push(0); }
        if selected.is_empty() { if !idx.contains(&(n - 1)) { idx.push(n - 1); } } else { idx.extend(selected); }

        let per_dim: Vec<Vec<Dp>> = (0..D)
            .map(|d| idx.iter().filter_map(|&i| self.dp_at(d, offset(i))).collect())
            .collect();

        for r in self.rings.iter_mut() { r.retain_newest(keep); }
        self.emitted_any = true;
        self.last_emitted_ts = per_dim[0].last().map(|d| d.ts.clone());
        debug!(sub_id=self.job.sub_id, window=n, emitted=idx.len(), retained=keep, "cl_window_reduced");
        Some(self.render(&per_dim))
    }

    /// Latest raw sample, unreduced. `None` if it was the last one emitted.
    fn single_dp(&self) -> Option<Json> {
        let latest = self.rings[0].read(0)?;
        if self.last_emitted_ts.as_deref() == Some(latest.ts.as_str()) { return None; }
        let per_dim: Vec<Vec<Dp>> = (0..D).map(|d| self.dp_at(d, 0).into_iter().collect()).collect();
        Some(self.render(&per_dim))
    }
}

async fn run_worker<const D: usize>(
    mut w: Worker<D>, store: Arc<dyn SignalStore>, period: Duration,
    tx: mpsc::Sender<ClEvent>, cancel: CancellationToken,
) {
    let sub_id = w.job.sub_id;
    info!(sub_id, dim=D, window=w.window, max_err=w.job.max_err, "cl_worker_started");
    loop {
        let started = Instant::now();
        let closing = cancel.is_cancelled();
        w.capture(store.as_ref());

        let n = w.rings[0].populated();
        if n >= w.window || (closing && n > 1) {
            if let Some(data) = w.analyze() {
                if tx.send(ClEvent::Points { sub_id, data }).await.is_err() { return; }
            }
        }
        if closing {
            if let Some(data) = w.single_dp() {
                let _ = tx.send(ClEvent::Points { sub_id, data }).await;
            }
            info!(sub_id, dim=D, "cl_worker_exit");
            let _ = tx.send(ClEvent::Exit { sub_id }).await;
            return;
        }

        let elapsed = started.elapsed();
        if elapsed >= period {
            warn!(sub_id, elapsed_ms=elapsed.as_millis() as u64, "cl_capture_overrun, may have missed capture");
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(period - elapsed).await;
        }
    }
}

/// Spawns curve-logging workers on behalf of the subscription manager.
#[derive(Clone)]
pub struct CurveLogger { store: Arc<dyn SignalStore>, cfg: ClConfig, tx: mpsc::Sender<ClEvent> }

impl CurveLogger {
    pub fn new(store: Arc<dyn SignalStore>, cfg: ClConfig, tx: mpsc::Sender<ClEvent>) -> Self { Self { store, cfg, tx } }

    /// Returns the number of workers started; each sends exactly one
    /// `ClEvent::Exit` after `cancel` fires.
    pub fn spawn(&self, job: ClJob, cancel: CancellationToken) -> usize {
        let groups = group_paths(&job.paths);
        let mut started = 0;
        for g in groups {
            let j = ClJob { paths: g.clone(), ..job.clone() };
            let (store, period, tx, c) = (self.store.clone(), self.cfg.period, self.tx.clone(), cancel.clone());
            let max_buf = self.cfg.max_buf;
            match g.len() {
                1 => if let Ok(p) = <[String; 1]>::try_from(g) {
                    tokio::spawn(run_worker(Worker::new(j, p, max_buf), store, period, tx, c)); started += 1;
                },
                2 => if let Ok(p) = <[String; 2]>::try_from(g) {
                    tokio::spawn(run_worker(Worker::new(j, p, max_buf), store, period, tx, c)); started += 1;
                },
                3 => if let Ok(p) = <[String; 3]>::try_from(g) {
                    tokio::spawn(run_worker(Worker::new(j, p, max_buf), store, period, tx, c)); started += 1;
                },
                _ => {}
            }
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::message::DataPoint;
    use crate::store::MemoryStore;
    use dashmap::DashMap;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: i64 = 1_700_000_000;

    fn pts1(vals: &[f64]) -> Vec<ClPoint<1>> {
        vals.iter().enumerate().map(|(i, v)| ClPoint { t: i as f64, v: [*v] }).collect()
    }

    #[test]
    fn test_linear_input_selects_nothing() {
        let buf = pts1(&(0..50).map(|i| 3.0 + 0.5 * i as f64).collect::<Vec<_>>());
        assert!(reduce(&buf, 0, 49, 0.01).is_empty());
    }

    #[test]
    fn test_spike_is_selected() {
        let mut v = vec![0.0; 20];
        v[7] = 10.0;
        let kept = reduce(&pts1(&v), 0, 19, 1.0);
        assert!(kept.contains(&7), "{kept:?}");
        assert!(kept.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_zero_width_interval_no_split() {
        let buf: Vec<ClPoint<1>> = (0..5).map(|i| ClPoint { t: 1.0, v: [i as f64 * 100.0] }).collect();
        assert!(reduce(&buf, 0, 4, 0.1).is_empty());
    }

    #[test]
    fn test_reconstruction_within_bound() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut x = 0.0;
            let vals: Vec<f64> = (0..120).map(|_| { x += rng.gen_range(-2.0..2.0); x }).collect();
            let buf = pts1(&vals);
            let max_err = rng.gen_range(0.2..3.0);
            let mut keep = vec![0];
            keep.extend(reduce(&buf, 0, buf.len() - 1, max_err));
            keep.push(buf.len() - 1);
            for w in keep.windows(2) {
                let (a, b) = (buf[w[0]], buf[w[1]]);
                for p in &buf[w[0]..=w[1]] {
                    let interp = a.v[0] + (b.v[0] - a.v[0]) / (b.t - a.t) * (p.t - a.t);
                    assert!((p.v[0] - interp).abs() <= max_err + 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_two_dim_combines_residuals() {
        // each dimension alone is within 1.0, combined they are not
        let mut buf: Vec<ClPoint<2>> = (0..9).map(|i| ClPoint { t: i as f64, v: [0.0, 0.0] }).collect();
        buf[4].v = [0.8, 0.8];
        assert_eq!(reduce(&buf, 0, 8, 1.0), vec![4]);
        assert!(reduce(&buf, 0, 8, 1.2).is_empty());
    }

    #[test]
    fn test_three_dim_combines_residuals() {
        let mut buf: Vec<ClPoint<3>> = (0..7).map(|i| ClPoint { t: i as f64, v: [i as f64, 0.0, -(i as f64)] }).collect();
        buf[3].v = [3.6, 0.6, -3.6];
        // 3 * 0.36 = 1.08 > 1.0^2, but < 1.1^2
        assert_eq!(reduce(&buf, 0, 6, 1.0), vec![3]);
        assert!(reduce(&buf, 0, 6, 1.1).is_empty());
    }

    #[test]
    fn test_group_paths() {
        let p: Vec<String> = ["Vehicle.Speed", "Vehicle.CurrentLocation.Longitude", "Vehicle.CurrentLocation.Latitude"]
            .iter().map(|s| s.to_string()).collect();
        let g = group_paths(&p);
        assert_eq!(g.len(), 2);
        assert!(g.contains(&vec!["Vehicle.CurrentLocation.Latitude".to_string(), "Vehicle.CurrentLocation.Longitude".to_string()]));
        assert!(g.contains(&vec!["Vehicle.Speed".to_string()]));
    }

    /// Each read advances the path by one second; `f` maps step to value.
    struct StepStore { steps: DashMap<String, i64>, f: fn(i64) -> f64 }

    impl SignalStore for StepStore {
        fn get(&self, path: &str) -> Result<Option<DataPoint>> {
            let mut s = self.steps.entry(path.to_string()).or_insert(0);
            let i = *s;
            *s += 1;
            let ts = chrono::DateTime::from_timestamp(1_700_000_000 + i, 0).unwrap().to_rfc3339();
            Ok(Some(DataPoint::new(((self.f)(i)).to_string(), ts)))
        }
        fn set(&self, _: &str, _: &str) -> Result<()> { Ok(()) }
    }

    /// Replays a fixed series, one sample per read, one second apart.
    struct SeriesStore { vals: Vec<f64>, next: AtomicUsize }

    impl SignalStore for SeriesStore {
        fn get(&self, _: &str) -> Result<Option<DataPoint>> {
            let i = self.next.fetch_add(1, Ordering::Relaxed).min(self.vals.len() - 1);
            let ts = chrono::DateTime::from_timestamp(BASE + i as i64, 0).unwrap().to_rfc3339();
            Ok(Some(DataPoint::new(self.vals[i].to_string(), ts)))
        }
        fn set(&self, _: &str, _: &str) -> Result<()> { Ok(()) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_bound_holds_across_windows() {
        for seed in 0..10u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut x = 0.0;
            let vals: Vec<f64> = (0..400).map(|_| { x += rng.gen_range(-2.0..2.0); x }).collect();
            let store = Arc::new(SeriesStore { vals: vals.clone(), next: AtomicUsize::new(0) });
            let (tx, mut rx) = mpsc::channel(64);
            let cl = CurveLogger::new(store, ClConfig::default(), tx);
            let cancel = CancellationToken::new();
            cl.spawn(ClJob { sub_id: 1, max_err: 1.0, buf_size: 8, paths: vec!["Vehicle.Speed".into()] }, cancel.clone());

            let mut emitted: Vec<usize> = Vec::new();
            while emitted.last().map_or(true, |&i| i < 300) {
                let ClEvent::Points { data, .. } = rx.recv().await.unwrap() else { panic!("worker exited early") };
                for dp in data[0]["dp"].as_array().unwrap() {
                    let secs = ts_secs(dp["ts"].as_str().unwrap()).unwrap() as i64;
                    emitted.push((secs - BASE) as usize);
                }
            }
            cancel.cancel();

            assert_eq!(emitted[0], 0);
            assert!(emitted.windows(2).all(|w| w[0] < w[1]), "seed {seed}: {emitted:?}");
            for w in emitted.windows(2) {
                let (a, b) = (w[0], w[1]);
                for k in a..=b {
                    let interp = vals[a] + (vals[b] - vals[a]) / (b - a) as f64 * (k - a) as f64;
                    assert!((vals[k] - interp).abs() <= 1.0 + 1e-9, "seed {seed}: sample {k} between {a} and {b}");
                }
            }
        }
    }

    #[test]
    fn test_misaligned_sample_rejected() {
        let store = MemoryStore::new();
        let (lat, lon) = ("Vehicle.CurrentLocation.Latitude", "Vehicle.CurrentLocation.Longitude");
        let job = ClJob { sub_id: 3, max_err: 0.1, buf_size: 10, paths: vec![lat.into(), lon.into()] };
        let mut w = Worker::<2>::new(job, [lat.to_string(), lon.to_string()], 240);

        store.put(lat, "57.1", "2024-01-01T00:00:00Z");
        store.put(lon, "11.9", "2024-01-01T00:00:00Z");
        assert!(w.capture(&store));
        store.put(lat, "57.2", "2024-01-01T00:00:01Z");
        assert!(!w.capture(&store));
        assert!(w.rings.iter().all(|r| r.populated() == 1));
        store.put(lon, "12.0", "2024-01-01T00:00:01Z");
        assert!(w.capture(&store));
        assert!(w.rings.iter().all(|r| r.populated() == 2));
        // unchanged timestamps are not written twice
        assert!(!w.capture(&store));
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_group_spawns_one_worker() {
        let store = Arc::new(MemoryStore::new());
        let paths = ["Vehicle.CurrentLocation.Latitude", "Vehicle.CurrentLocation.Longitude", "Vehicle.CurrentLocation.Altitude"];
        for (p, v) in paths.iter().zip(["57.1", "11.9", "30"]) { store.put(p, v, "2024-01-01T00:00:00Z"); }
        let (tx, mut rx) = mpsc::channel(16);
        let cl = CurveLogger::new(store, ClConfig::default(), tx);
        let cancel = CancellationToken::new();
        let mut job_paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        job_paths.push("Vehicle.Speed".into());
        assert_eq!(cl.spawn(ClJob { sub_id: 4, max_err: 0.1, buf_size: 10, paths: job_paths }, cancel.clone()), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let (mut exits, mut fragments) = (0, Vec::new());
        while exits < 2 {
            match rx.recv().await.unwrap() {
                ClEvent::Exit { .. } => exits += 1,
                ClEvent::Points { data, .. } => fragments.extend(data.as_array().unwrap().iter().map(|f| f["path"].clone())),
            }
        }
        // the 3-D worker reports all three paths in one batch; Speed has no data
        assert_eq!(fragments.len(), 3);
        for p in paths { assert!(fragments.contains(&Json::from(p))); }
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_worker_emits_window_end() {
        let store = Arc::new(StepStore { steps: DashMap::new(), f: |i| i as f64 * 2.0 });
        let (tx, mut rx) = mpsc::channel(16);
        let cl = CurveLogger::new(store, ClConfig { period: Duration::from_millis(800), max_buf: 240 }, tx);
        let cancel = CancellationToken::new();
        let job = ClJob { sub_id: 9, max_err: 0.1, buf_size: 10, paths: vec!["Vehicle.Speed".into()] };
        assert_eq!(cl.spawn(job, cancel.clone()), 1);

        let ClEvent::Points { sub_id, data } = rx.recv().await.unwrap() else { panic!("expected points") };
        assert_eq!(sub_id, 9);
        let dps = data[0]["dp"].as_array().unwrap();
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[0]["value"], "0");
        assert_eq!(dps[1]["value"], "18");

        cancel.cancel();
        loop {
            if let ClEvent::Exit { sub_id } = rx.recv().await.unwrap() { assert_eq!(sub_id, 9); break; }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_workers() {
        let store = Arc::new(StepStore { steps: DashMap::new(), f: |i| (i % 2) as f64 * 50.0 });
        let (tx, mut rx) = mpsc::channel(64);
        let cl = CurveLogger::new(store, ClConfig::default(), tx);
        let (c1, c2) = (CancellationToken::new(), CancellationToken::new());
        cl.spawn(ClJob { sub_id: 1, max_err: 1.0, buf_size: 5, paths: vec!["A.X".into()] }, c1.clone());
        cl.spawn(ClJob { sub_id: 2, max_err: 1.0, buf_size: 5, paths: vec!["B.X".into()] }, c2.clone());
        c1.cancel();
        let mut exited = Vec::new();
        let mut points_after_exit = 0;
        for _ in 0..12 {
            match rx.recv().await.unwrap() {
                ClEvent::Exit { sub_id } => exited.push(sub_id),
                ClEvent::Points { sub_id: 2, .. } if exited.contains(&1) => points_after_exit += 1,
                _ => {}
            }
        }
        assert_eq!(exited, vec![1]);
        assert!(points_after_exit > 0);
        c2.cancel();
    }
}
