// =============================================================================
// VISS GATEWAY — Configuration
// =============================================================================
// Environment-driven. Every knob has a default; malformed values are fatal
// at startup.
// =============================================================================

use std::time::Duration;

use crate::curvelog::ClConfig;
use crate::error::{GatewayError, Result};
use crate::subscription::ServiceConfig;
use crate::ticker::DEFAULT_TICKER_SLOTS;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub tree_path: Option<String>,
    pub ats_url: Option<String>,
    pub scan_period: Duration,
    pub cl_period: Duration,
    pub cl_max_buf: usize,
    pub ticker_slots: usize,
    pub gating_slots: usize,
    pub gating_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8888,
            tree_path: None,
            ats_url: None,
            scan_period: Duration::from_millis(50),
            cl_period: Duration::from_millis(800),
            cl_max_buf: 240,
            ticker_slots: DEFAULT_TICKER_SLOTS,
            gating_slots: 100,
            gating_ttl: Duration::from_secs(3600),
        }
    }
}

fn num<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match get(key) {
        None => Ok(default),
        Some(v) => v.trim().parse::<T>().map_err(|_| GatewayError::Config(format!("{key}: invalid value '{v}'"))),
    }
}

fn positive<T: PartialOrd + Default + std::fmt::Display>(key: &str, v: T) -> Result<T> {
    if v > T::default() { Ok(v) } else { Err(GatewayError::Config(format!("{key}: must be positive, got {v}"))) }
}

impl Config {
    pub fn from_env() -> Result<Self> { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let text = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Ok(Self {
            port: num(&get, "PORT", d.port)?,
            tree_path: text("VISS_TREE"),
            ats_url: text("VISS_ATS_URL"),
            scan_period: Duration::from_millis(positive("VISS_SCAN_MS", num(&get, "VISS_SCAN_MS", 50u64)?)?),
            cl_period: Duration::from_millis(positive("VISS_CL_PERIOD_MS", num(&get, "VISS_CL_PERIOD_MS", 800u64)?)?),
            cl_max_buf: positive("VISS_CL_MAX_BUF", num(&get, "VISS_CL_MAX_BUF", d.cl_max_buf)?)?,
            ticker_slots: positive("VISS_TICKER_SLOTS", num(&get, "VISS_TICKER_SLOTS", d.ticker_slots)?)?,
            gating_slots: positive("VISS_GATING_SLOTS", num(&get, "VISS_GATING_SLOTS", d.gating_slots)?)?,
            gating_ttl: Duration::from_secs(positive("VISS_GATING_TTL_S", num(&get, "VISS_GATING_TTL_S", 3600u64)?)?),
        })
    }

    pub fn service(&self) -> ServiceConfig { ServiceConfig { scan_period: self.scan_period, ticker_slots: self.ticker_slots } }

    pub fn curvelog(&self) -> ClConfig { ClConfig { period: self.cl_period, max_buf: self.cl_max_buf } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.service().scan_period, Duration::from_millis(50));
        assert_eq!(c.curvelog().max_buf, 240);
    }

    #[test]
    fn test_overrides() {
        let c = Config::from_lookup(lookup(&[
            ("PORT", "9000"), ("VISS_ATS_URL", "http://ats:8600/atserver"), ("VISS_CL_PERIOD_MS", "200"),
            ("VISS_TREE", "  "), ("VISS_GATING_TTL_S", "5"),
        ])).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.ats_url.as_deref(), Some("http://ats:8600/atserver"));
        assert_eq!(c.cl_period, Duration::from_millis(200));
        assert_eq!(c.tree_path, None);
        assert_eq!(c.gating_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_is_fatal() {
        assert!(matches!(Config::from_lookup(lookup(&[("PORT", "http")])), Err(GatewayError::Config(_))));
        assert!(matches!(Config::from_lookup(lookup(&[("VISS_TICKER_SLOTS", "0")])), Err(GatewayError::Config(_))));
        assert!(matches!(Config::from_lookup(lookup(&[("VISS_SCAN_MS", "-5")])), Err(GatewayError::Config(_))));
    }
}
