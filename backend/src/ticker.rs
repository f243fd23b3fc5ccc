// =============================================================================
// VISS GATEWAY — Ticker pool
// =============================================================================
// Fixed number of periodic timers, allocated by linear scan over a slot
// arena. Each live slot is a task that sends its key on the owner's channel
// every period; the owner's event loop is the only consumer.
// =============================================================================

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICKER_SLOTS: usize = 255;

struct Slot<K> { key: K, cancel: CancellationToken }

pub struct TickerPool<K> { slots: Vec<Option<Slot<K>>> }

impl<K> TickerPool<K>
where K: Clone + PartialEq + Send + 'static
{
    pub fn new(size: usize) -> Self { Self { slots: (0..size).map(|_| None).collect() } }

    /// `None` when every slot is taken.
    pub fn allocate(&mut self, key: K, period: Duration, tx: mpsc::Sender<K>) -> Option<usize> {
        let idx = self.slots.iter().position(Option::is_none)?;
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let k = key.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut iv = interval_at(Instant::now() + period, period);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = c.cancelled() => break,
                    _ = iv.tick() => if tx.send(k.clone()).await.is_err() { break },
                }
            }
        });
        self.slots[idx] = Some(Slot { key, cancel });
        Some(idx)
    }

    /// Stops and frees the slot owned by `key`.
    pub fn release(&mut self, key: &K) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| &s.key == key) {
                if let Some(s) = slot.take() { s.cancel.cancel(); }
                return true;
            }
        }
        false
    }

    pub fn active(&self) -> usize { self.slots.iter().filter(|s| s.is_some()).count() }
}

impl<K> Drop for TickerPool<K> {
    fn drop(&mut self) {
        for s in self.slots.iter().flatten() { s.cancel.cancel(); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_and_release() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pool = TickerPool::new(2);
        assert_eq!(pool.allocate(7u64, Duration::from_millis(100), tx.clone()), Some(0));
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(7));
        assert!(pool.release(&7));
        assert!(!pool.release(&7));
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_none() {
        let (tx, _rx) = mpsc::channel(8);
        let mut pool = TickerPool::new(2);
        assert!(pool.allocate(1u64, Duration::from_secs(1), tx.clone()).is_some());
        assert!(pool.allocate(2u64, Duration::from_secs(1), tx.clone()).is_some());
        assert!(pool.allocate(3u64, Duration::from_secs(1), tx.clone()).is_none());
        pool.release(&1);
        assert_eq!(pool.allocate(3u64, Duration::from_secs(1), tx), Some(0));
    }
}
