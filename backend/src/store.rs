// =============================================================================
// VISS GATEWAY — Signal data access
// =============================================================================
// Key/value view of the vehicle state backend. SQL/Redis backends implement
// `SignalStore`; the in-process `MemoryStore` is what the server runs with
// when no backend is attached.
// =============================================================================

use dashmap::DashMap;

use crate::error::Result;
use crate::message::{now_ts, DataPoint};

pub const NOT_AVAILABLE: &str = "Data-not-available";

pub trait SignalStore: Send + Sync {
    /// Current `{value, ts}` for a path, `None` if never written.
    fn get(&self, path: &str) -> Result<Option<DataPoint>>;
    /// Writes a value stamped with the current time.
    fn set(&self, path: &str, value: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore { points: DashMap<String, DataPoint> }

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Feeder-side write with an explicit timestamp.
    pub fn put(&self, path: &str, value: &str, ts: &str) {
        self.points.insert(path.to_string(), DataPoint::new(value, ts));
    }

    pub fn len(&self) -> usize { self.points.len() }
    pub fn is_empty(&self) -> bool { self.points.is_empty() }
}

impl SignalStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Option<DataPoint>> { Ok(self.points.get(path).map(|e| e.value().clone())) }

    fn set(&self, path: &str, value: &str) -> Result<()> {
        self.points.insert(path.to_string(), DataPoint::new(value, now_ts()));
        Ok(())
    }
}

/// Reads a path, substituting the not-available marker for unwritten paths.
pub fn read_or_na(store: &dyn SignalStore, path: &str) -> Result<DataPoint> {
    Ok(store.get(path)?.unwrap_or_else(|| DataPoint::new(NOT_AVAILABLE, now_ts())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let s = MemoryStore::new();
        assert!(s.get("Vehicle.Speed").unwrap().is_none());
        s.put("Vehicle.Speed", "50", "2024-01-01T00:00:00Z");
        assert_eq!(s.get("Vehicle.Speed").unwrap(), Some(DataPoint::new("50", "2024-01-01T00:00:00Z")));
    }

    #[test]
    fn test_set_stamps_time() {
        let s = MemoryStore::new();
        s.set("Vehicle.Cabin.Lights.IsDomeOn", "true").unwrap();
        let dp = s.get("Vehicle.Cabin.Lights.IsDomeOn").unwrap().unwrap();
        assert_eq!(dp.value, "true");
        assert!(chrono::DateTime::parse_from_rfc3339(&dp.ts).is_ok());
    }

    #[test]
    fn test_read_or_na() {
        let s = MemoryStore::new();
        assert_eq!(read_or_na(&s, "X").unwrap().value, NOT_AVAILABLE);
    }
}
