// =============================================================================
// VISS GATEWAY — Counters
// =============================================================================
// Every accept/reject/drop path bumps one counter; /metrics renders them.
// =============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub requests: AtomicU64,
    pub malformed: AtomicU64,
    pub no_match: AtomicU64,
    pub access_denied: AtomicU64,
    pub internal_errors: AtomicU64,
    pub responses: AtomicU64,
    pub notifications: AtomicU64,
    pub dropped: AtomicU64,
    pub service_busy: AtomicU64,
    pub subscriptions_created: AtomicU64,
    pub subscriptions_removed: AtomicU64,
    pub cl_batches: AtomicU64,
    pub ticker_exhausted: AtomicU64,
}

#[derive(Serialize, Debug, Default, PartialEq, Eq)]
pub struct MResp {
    pub requests: u64,
    pub malformed: u64,
    pub no_match: u64,
    pub access_denied: u64,
    pub internal_errors: u64,
    pub responses: u64,
    pub notifications: u64,
    pub dropped: u64,
    pub service_busy: u64,
    pub subscriptions_created: u64,
    pub subscriptions_removed: u64,
    pub cl_batches: u64,
    pub ticker_exhausted: u64,
}

impl Metrics {
    pub fn new() -> Self { Self::default() }

    pub fn inc(c: &AtomicU64) { c.fetch_add(1, Ordering::Relaxed); }

    pub fn snapshot(&self) -> MResp {
        let l = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MResp {
            requests: l(&self.requests), malformed: l(&self.malformed), no_match: l(&self.no_match),
            access_denied: l(&self.access_denied), internal_errors: l(&self.internal_errors),
            responses: l(&self.responses), notifications: l(&self.notifications), dropped: l(&self.dropped),
            service_busy: l(&self.service_busy),
            subscriptions_created: l(&self.subscriptions_created), subscriptions_removed: l(&self.subscriptions_removed),
            cl_batches: l(&self.cl_batches), ticker_exhausted: l(&self.ticker_exhausted),
        }
    }
}
