// =============================================================================
// VISS GATEWAY — Request / response envelopes
// =============================================================================
// RouterId ("<mgrId>?<clientId>") is attached at the transport boundary and
// never serialized towards a client: responses carry it beside the payload,
// not inside it.
// =============================================================================

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub fn now_ts() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true) }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouterId { pub mgr_id: usize, pub client_id: u64 }

impl RouterId {
    pub fn new(mgr_id: usize, client_id: u64) -> Self { Self { mgr_id, client_id } }

    pub fn parse(s: &str) -> Option<Self> {
        let (m, c) = s.split_once('?')?;
        Some(Self { mgr_id: m.parse().ok()?, client_id: c.parse().ok()? })
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}?{}", self.mgr_id, self.client_id) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action { Get, Set, Subscribe, Unsubscribe, KillSubscriptions, CancelSubscription }

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "get" => Action::Get,
            "set" => Action::Set,
            "subscribe" => Action::Subscribe,
            "unsubscribe" => Action::Unsubscribe,
            "internal-killsubscriptions" => Action::KillSubscriptions,
            "internal-cancelsubscription" => Action::CancelSubscription,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Set => "set",
            Action::Subscribe => "subscribe",
            Action::Unsubscribe => "unsubscribe",
            Action::KillSubscriptions => "internal-killsubscriptions",
            Action::CancelSubscription => "internal-cancelsubscription",
        }
    }
}

/// Inbound envelope as clients (and internal injectors) send it. Fields are
/// loosely typed here; the router validates and narrows them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(rename = "subscriptionId", default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(rename = "gatingId", default, skip_serializing_if = "Option::is_none")]
    pub gating_id: Option<String>,
    #[serde(rename = "RouterId", default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint { pub value: String, pub ts: String }

impl DataPoint {
    pub fn new(value: impl Into<String>, ts: impl Into<String>) -> Self { Self { value: value.into(), ts: ts.into() } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody { pub number: String, pub reason: String, pub message: String }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub action: String,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(rename = "subscriptionId", default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(action: &str, request_id: Option<String>) -> Self {
        Self { action: action.to_string(), request_id, subscription_id: None, ts: now_ts(), data: None, metadata: None, error: None }
    }

    pub fn error(action: &str, request_id: Option<String>, number: u16, reason: &str, message: &str) -> Self {
        let mut r = Self::ok(action, request_id);
        r.error = Some(ErrorBody { number: number.to_string(), reason: reason.to_string(), message: message.to_string() });
        r
    }

    /// Generic store/downstream failure; detail stays in the server log.
    pub fn internal_error(action: &str, request_id: Option<String>) -> Self {
        Self::error(action, request_id, 500, "Internal error", "")
    }

    pub fn notification(subscription_id: u64, data: serde_json::Value) -> Self {
        let mut r = Self::ok("subscription", None);
        r.subscription_id = Some(subscription_id.to_string());
        r.data = Some(data);
        r
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self { self.data = Some(data); self }
    pub fn with_metadata(mut self, md: serde_json::Value) -> Self { self.metadata = Some(md); self }
    pub fn with_subscription(mut self, id: u64) -> Self { self.subscription_id = Some(id.to_string()); self }

    pub fn is_error(&self) -> bool { self.error.is_some() }

    pub fn to_json(&self) -> String { serde_json::to_string(self).unwrap_or_default() }
}

/// `{"path":..,"dp":{..}}` for one path, a JSON array for several.
pub fn render_data(points: &[(String, DataPoint)]) -> serde_json::Value {
    let mut items: Vec<serde_json::Value> = points.iter()
        .map(|(p, dp)| serde_json::json!({"path": p, "dp": dp}))
        .collect();
    if items.len() == 1 { items.remove(0) } else { serde_json::Value::Array(items) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_id_roundtrip() {
        let r = RouterId::new(2, 77);
        assert_eq!(r.to_string(), "2?77");
        assert_eq!(RouterId::parse("2?77"), Some(r));
        assert_eq!(RouterId::parse("2-77"), None);
        assert_eq!(RouterId::parse("x?1"), None);
    }

    #[test]
    fn test_error_envelope_shape() {
        let r = Response::error("get", Some("12".into()), 400, "No signals matching path.", "");
        let v: serde_json::Value = serde_json::from_str(&r.to_json()).unwrap();
        assert_eq!(v["error"]["number"], "400");
        assert_eq!(v["error"]["reason"], "No signals matching path.");
        assert_eq!(v["requestId"], "12");
        assert!(v.get("data").is_none());
        assert!(v.get("RouterId").is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(v["ts"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_render_data_single_vs_many() {
        let one = render_data(&[("A.B".into(), DataPoint::new("1", "t"))]);
        assert_eq!(one["path"], "A.B");
        let two = render_data(&[("A.B".into(), DataPoint::new("1", "t")), ("A.C".into(), DataPoint::new("2", "t"))]);
        assert_eq!(two.as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_raw_request_accepts_router_id_field() {
        let r: RawRequest = serde_json::from_str(r#"{"action":"get","path":"Vehicle.Speed","RouterId":"0?5","requestId":"1"}"#).unwrap();
        assert_eq!(r.router_id.as_deref(), Some("0?5"));
        assert_eq!(Action::parse(&r.action), Some(Action::Get));
        assert_eq!(Action::parse("publish"), None);
    }
}
