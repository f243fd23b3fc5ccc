// =============================================================================
// VISS GATEWAY — Signal tree
// =============================================================================
// The router only needs three things from the tree: wildcard search with
// access tags, a depth-limited metadata subtree, and the leaf list. The
// in-memory `VssTree` reads the VSS JSON export format.
// =============================================================================

use serde_json::{Map, Value as Json};

use crate::error::{GatewayError, Result};

pub const MAX_METADATA_DEPTH: usize = 10;
const DEMO_TREE: &str = include_str!("../assets/vss_demo.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind { Branch, Sensor, Actuator, Attribute }

impl NodeKind {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "branch" => NodeKind::Branch,
            "sensor" => NodeKind::Sensor,
            "actuator" => NodeKind::Actuator,
            "attribute" => NodeKind::Attribute,
            _ => return None,
        })
    }
}

/// One resolved leaf. `validation`: 0 open, 1 write-gated, 2 read+write-gated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMatch { pub path: String, pub kind: NodeKind, pub validation: u8 }

pub trait SignalTree: Send + Sync {
    /// Resolves a dot path; `*` matches one segment and a branch expands to
    /// every leaf beneath it.
    fn search(&self, pattern: &str) -> Vec<NodeMatch>;
    fn metadata(&self, path: &str, depth: usize) -> Option<Json>;
    fn leaf_paths(&self) -> Vec<String>;
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: NodeKind,
    validation: u8,
    attrs: Map<String, Json>,
    children: Vec<Node>,
}

fn validation_tag(attrs: &Map<String, Json>) -> u8 {
    match attrs.get("validate").and_then(Json::as_str) {
        Some("write-only") => 1,
        Some("read-write") => 2,
        _ => 0,
    }
}

fn build(name: &str, v: &Json, inherited: u8) -> Result<Node> {
    let obj = v.as_object().ok_or_else(|| GatewayError::Tree(format!("node {name} is not an object")))?;
    let kind = obj.get("type").and_then(Json::as_str).and_then(NodeKind::parse)
        .ok_or_else(|| GatewayError::Tree(format!("node {name} has no valid type")))?;
    let mut attrs = obj.clone();
    let children_json = attrs.remove("children");
    let validation = validation_tag(&attrs).max(inherited);
    let mut children = Vec::new();
    if let Some(Json::Object(ch)) = children_json {
        for (cn, cv) in ch.iter() { children.push(build(cn, cv, validation)?); }
    }
    Ok(Node { name: name.to_string(), kind, validation, attrs, children })
}

fn collect_leaves(n: &Node, prefix: &str, out: &mut Vec<NodeMatch>) {
    let path = if prefix.is_empty() { n.name.clone() } else { format!("{prefix}.{}", n.name) };
    if n.children.is_empty() {
        if n.kind != NodeKind::Branch { out.push(NodeMatch { path, kind: n.kind, validation: n.validation }); }
        return;
    }
    for c in &n.children { collect_leaves(c, &path, out); }
}

fn search_rec(n: &Node, segs: &[&str], prefix: &str, out: &mut Vec<NodeMatch>) {
    let Some((head, rest)) = segs.split_first() else { return };
    if *head != "*" && *head != n.name { return; }
    if rest.is_empty() { collect_leaves(n, prefix, out); return; }
    let path = if prefix.is_empty() { n.name.clone() } else { format!("{prefix}.{}", n.name) };
    for c in &n.children { search_rec(c, rest, &path, out); }
}

fn render(n: &Node, depth: usize) -> Json {
    let mut body = n.attrs.clone();
    if depth > 0 && !n.children.is_empty() {
        let ch: Map<String, Json> = n.children.iter().map(|c| (c.name.clone(), render(c, depth - 1))).collect();
        body.insert("children".into(), Json::Object(ch));
    }
    Json::Object(body)
}

#[derive(Debug, Clone)]
pub struct VssTree { roots: Vec<Node> }

impl VssTree {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let v: Json = serde_json::from_str(s)?;
        let obj = v.as_object().ok_or_else(|| GatewayError::Tree("tree root must be an object".into()))?;
        let roots = obj.iter().map(|(k, v)| build(k, v, 0)).collect::<Result<Vec<_>>>()?;
        if roots.is_empty() { return Err(GatewayError::Tree("empty tree".into())); }
        Ok(Self { roots })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let s = std::fs::read_to_string(path).map_err(|e| GatewayError::Tree(format!("{path}: {e}")))?;
        Self::from_json_str(&s)
    }

    pub fn demo() -> Result<Self> { Self::from_json_str(DEMO_TREE) }

    fn find(&self, path: &str) -> Option<&Node> {
        let mut segs = path.split('.');
        let first = segs.next()?;
        let mut cur = self.roots.iter().find(|r| r.name == first)?;
        for s in segs { cur = cur.children.iter().find(|c| c.name == s)?; }
        Some(cur)
    }
}

impl SignalTree for VssTree {
    fn search(&self, pattern: &str) -> Vec<NodeMatch> {
        let segs: Vec<&str> = pattern.split('.').collect();
        if segs.iter().any(|s| s.is_empty()) { return Vec::new(); }
        let mut out = Vec::new();
        for r in &self.roots { search_rec(r, &segs, "", &mut out); }
        out
    }

    fn metadata(&self, path: &str, depth: usize) -> Option<Json> {
        let n = self.find(path)?;
        let mut m = Map::new();
        m.insert(n.name.clone(), render(n, depth.min(MAX_METADATA_DEPTH)));
        Some(Json::Object(m))
    }

    fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for r in &self.roots { collect_leaves(r, "", &mut out); }
        out.into_iter().map(|m| m.path).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_leaf() {
        let t = VssTree::demo().unwrap();
        let m = t.search("Vehicle.Speed");
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].kind, NodeKind::Sensor);
        assert_eq!(m[0].validation, 0);
    }

    #[test]
    fn test_wildcard_and_branch_expansion() {
        let t = VssTree::demo().unwrap();
        let m = t.search("Vehicle.Cabin.Door.*.*.IsOpen");
        assert_eq!(m.len(), 2);
        assert!(m.iter().all(|n| n.kind == NodeKind::Actuator && n.validation == 1));
        assert_eq!(t.search("Vehicle.CurrentLocation").len(), 3);
        assert!(t.search("Vehicle.Nope").is_empty());
        assert!(t.search("Vehicle..Speed").is_empty());
    }

    #[test]
    fn test_validation_tags() {
        let t = VssTree::demo().unwrap();
        assert_eq!(t.search("Vehicle.VehicleIdentification.VIN")[0].validation, 2);
        assert_eq!(t.search("Vehicle.Cabin.Lights.IsDomeOn")[0].validation, 0);
    }

    #[test]
    fn test_metadata_depth_limited() {
        let t = VssTree::demo().unwrap();
        let md = t.metadata("Vehicle.Cabin", 1).unwrap();
        let door = &md["Cabin"]["children"]["Door"];
        assert_eq!(door["type"], "branch");
        assert!(door.get("children").is_none());
        assert!(t.metadata("Vehicle.Cabin.*", 1).is_none());
    }

    #[test]
    fn test_leaf_paths_and_bad_tree() {
        let t = VssTree::demo().unwrap();
        let leaves = t.leaf_paths();
        assert!(leaves.contains(&"Vehicle.Powertrain.TractionBattery.StateOfCharge.Current".to_string()));
        assert!(!leaves.contains(&"Vehicle.Cabin".to_string()));
        assert!(VssTree::from_json_str(r#"{"A":{"type":"nonsense"}}"#).is_err());
    }
}
