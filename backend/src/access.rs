// =============================================================================
// VISS GATEWAY — Access gate
// =============================================================================
// The trust component is consumed as one call: token + action + paths +
// validation tag in, `(code, handle, gatingId)` out. Nonzero codes map to a
// fixed message table; verifier internals never reach a client.
//
// Sessions that carry a gatingId are tracked in pending (awaiting consent)
// and active slot lists so revocation and expiry can cancel subscriptions.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{GatewayError, Result};

pub const CONSENT_PENDING: i32 = 61;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerifyRequest {
    pub token: String,
    pub paths: Json,
    pub action: String,
    pub validation: String,
}

impl VerifyRequest {
    pub fn new(token: &str, action: &str, paths: &[String], tag: u8) -> Self {
        let paths = match paths { [one] => Json::String(one.clone()), many => Json::from(many.to_vec()) };
        Self { token: token.to_string(), paths, action: action.to_string(), validation: tag.to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyWire {
    validation: String,
    #[serde(default)]
    handle: Option<String>,
    #[serde(rename = "gatingId", default)]
    gating_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict { pub code: i32, pub handle: Option<String>, pub gating_id: Option<i64> }

impl Verdict {
    pub fn ok(handle: Option<String>, gating_id: Option<i64>) -> Self { Self { code: 0, handle, gating_id } }
    pub fn denied(code: i32) -> Self { Self { code, handle: None, gating_id: None } }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, req: &VerifyRequest) -> Result<Verdict>;
}

/// Client-facing text for a verifier code.
pub fn token_error_message(code: i32) -> &'static str {
    match code {
        1 => "Invalid access token. Malformed token.",
        2 => "Invalid access token. Signature verification failed.",
        5 => "Invalid access token. Unknown issuer.",
        6 => "Invalid access token. Token revoked.",
        10 => "Access token expired.",
        11 => "Access token not yet valid.",
        15 => "Invalid access token. Audience mismatch.",
        16 => "Invalid access token. Unknown client.",
        20 => "Purpose mismatch. Signals not covered by token purpose.",
        21 => "Purpose mismatch. Action not permitted by token purpose.",
        30 => "Access token scope does not include the requested signals.",
        40 => "Invalid proof of possession. PoP missing.",
        41 => "Invalid proof of possession. Signature mismatch.",
        42 => "Invalid proof of possession. PoP expired.",
        60 => "Consent not granted.",
        61 => "Consent pending.",
        _ => "Access token verification failed.",
    }
}

/// Trust component reached over HTTP.
pub struct HttpVerifier { client: reqwest::Client, url: String }

impl HttpVerifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()
            .map_err(|e| GatewayError::Verifier(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

fn parse_verdict(w: VerifyWire) -> Result<Verdict> {
    let code = w.validation.trim().parse::<i32>().map_err(|_| GatewayError::Verifier(format!("bad validation code '{}'", w.validation)))?;
    let gating_id = w.gating_id.as_deref().and_then(|g| g.trim().parse::<i64>().ok()).filter(|g| *g >= 0);
    Ok(Verdict { code, handle: w.handle.filter(|h| !h.is_empty()), gating_id })
}

#[async_trait]
impl TokenVerifier for HttpVerifier {
    async fn verify(&self, req: &VerifyRequest) -> Result<Verdict> {
        let resp = self.client.post(&self.url).json(req).send().await
            .map_err(|e| GatewayError::Verifier(e.to_string()))?;
        let wire: VerifyWire = resp.json().await.map_err(|e| GatewayError::Verifier(e.to_string()))?;
        parse_verdict(wire)
    }
}

/// Stand-in when no trust component is configured: every gated request fails.
pub struct UnavailableVerifier;

#[async_trait]
impl TokenVerifier for UnavailableVerifier {
    async fn verify(&self, _req: &VerifyRequest) -> Result<Verdict> {
        Err(GatewayError::Verifier("no verifier configured".into()))
    }
}

/// Events pushed by the trust component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentEvent { Granted(i64), Revoked(i64) }

#[derive(Debug, Clone, Copy)]
struct GatingElem { gating_id: i64, expires: Instant }

#[derive(Debug)]
pub struct GatingTable { pending: Vec<Option<GatingElem>>, active: Vec<Option<GatingElem>>, ttl: Duration }

fn insert(list: &mut [Option<GatingElem>], e: GatingElem) -> bool {
    if let Some(slot) = list.iter_mut().flatten().find(|s| s.gating_id == e.gating_id) { *slot = e; return true; }
    match list.iter_mut().find(|s| s.is_none()) { Some(slot) => { *slot = Some(e); true } None => false }
}

fn take(list: &mut [Option<GatingElem>], gid: i64) -> bool {
    match list.iter_mut().find(|s| s.is_some_and(|e| e.gating_id == gid)) { Some(slot) => { *slot = None; true } None => false }
}

impl GatingTable {
    pub fn new(slots: usize, ttl: Duration) -> Self {
        Self { pending: vec![None; slots], active: vec![None; slots], ttl }
    }

    /// `false` when the list is full.
    pub fn add_pending(&mut self, gid: i64, now: Instant) -> bool { insert(&mut self.pending, GatingElem { gating_id: gid, expires: now + self.ttl }) }

    pub fn add_active(&mut self, gid: i64, now: Instant) -> bool {
        take(&mut self.pending, gid);
        insert(&mut self.active, GatingElem { gating_id: gid, expires: now + self.ttl })
    }

    pub fn grant(&mut self, gid: i64, now: Instant) -> bool { take(&mut self.pending, gid) && self.add_active(gid, now) }

    /// Returns whether an active session was dropped.
    pub fn revoke(&mut self, gid: i64) -> bool {
        take(&mut self.pending, gid);
        take(&mut self.active, gid)
    }

    pub fn is_active(&self, gid: i64) -> bool { self.active.iter().flatten().any(|e| e.gating_id == gid) }
    pub fn is_pending(&self, gid: i64) -> bool { self.pending.iter().flatten().any(|e| e.gating_id == gid) }

    /// Frees aged slots; returns the gatingIds of expired active sessions.
    pub fn expire(&mut self, now: Instant) -> Vec<i64> {
        for slot in self.pending.iter_mut() {
            if let Some(e) = slot.filter(|e| e.expires <= now) { debug!(gating_id=e.gating_id, "pending_gating_expired"); *slot = None; }
        }
        let mut out = Vec::new();
        for slot in self.active.iter_mut() {
            if let Some(e) = slot.filter(|e| e.expires <= now) { out.push(e.gating_id); *slot = None; }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_table_covers_codes() {
        for c in [1, 2, 5, 6, 10, 11, 15, 16, 20, 21, 30, 40, 41, 42, 60, 61] {
            assert_ne!(token_error_message(c), token_error_message(999), "code {c}");
        }
    }

    #[test]
    fn test_verify_request_shape() {
        let r = VerifyRequest::new("tok", "set", &["Vehicle.Speed".into()], 1);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["paths"], "Vehicle.Speed");
        assert_eq!(v["validation"], "1");
        let r = VerifyRequest::new("tok", "get", &["A".into(), "B".into()], 2);
        assert!(r.paths.is_array());
    }

    #[test]
    fn test_parse_verdict() {
        let w: VerifyWire = serde_json::from_str(r#"{"validation":"0","handle":"h1","gatingId":"7"}"#).unwrap();
        assert_eq!(parse_verdict(w).unwrap(), Verdict::ok(Some("h1".into()), Some(7)));
        let w: VerifyWire = serde_json::from_str(r#"{"validation":"10"}"#).unwrap();
        assert_eq!(parse_verdict(w).unwrap().code, 10);
        let w: VerifyWire = serde_json::from_str(r#"{"validation":"x"}"#).unwrap();
        assert!(parse_verdict(w).is_err());
    }

    #[tokio::test]
    async fn test_unavailable_verifier_fails() {
        let r = VerifyRequest::new("t", "get", &["A".into()], 2);
        assert!(UnavailableVerifier.verify(&r).await.is_err());
    }

    #[test]
    fn test_gating_lifecycle() {
        let now = Instant::now();
        let mut g = GatingTable::new(2, Duration::from_secs(10));
        assert!(g.add_pending(1, now));
        assert!(g.add_pending(2, now));
        assert!(!g.add_pending(3, now));
        assert!(g.grant(1, now));
        assert!(g.is_active(1) && !g.is_pending(1));
        assert!(!g.grant(9, now));
        assert!(g.revoke(1));
        assert!(!g.revoke(1));
    }

    #[test]
    fn test_gating_expiry() {
        let now = Instant::now();
        let mut g = GatingTable::new(4, Duration::from_secs(10));
        g.add_active(5, now);
        g.add_pending(6, now);
        assert!(g.expire(now + Duration::from_secs(5)).is_empty());
        assert_eq!(g.expire(now + Duration::from_secs(11)), vec![5]);
        assert!(!g.is_pending(6));
    }
}
