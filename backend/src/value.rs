// =============================================================================
// VISS GATEWAY — Typed signal values and comparators
// =============================================================================
// Signal values travel as strings on the wire. They are classified exactly
// once into `Value`; every range/change predicate works on the typed form.
// =============================================================================

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Classification order: bool, int, float, string.
    pub fn parse(raw: &str) -> Self {
        let t = raw.trim();
        match t {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = t.parse::<i64>() { return Value::Int(i); }
        match t.parse::<f64>() {
            Ok(f) if f.is_finite() => Value::Float(f),
            _ => Value::Str(raw.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self { Value::Bool(_) => "bool", Value::Int(_) => "int", Value::Float(_) => "float", Value::Str(_) => "string" }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self { Value::Int(i) => Some(*i as f64), Value::Float(f) => Some(*f), _ => None }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp { Eq, Ne, Gt, Gte, Lt, Lte }

impl LogicOp {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => LogicOp::Eq, "ne" => LogicOp::Ne,
            "gt" => LogicOp::Gt, "gte" => LogicOp::Gte,
            "lt" => LogicOp::Lt, "lte" => LogicOp::Lte,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicOp::Eq => "eq", LogicOp::Ne => "ne", LogicOp::Gt => "gt",
            LogicOp::Gte => "gte", LogicOp::Lt => "lt", LogicOp::Lte => "lte",
        }
    }

    fn holds(&self, ord: Ordering) -> bool {
        match self {
            LogicOp::Eq => ord == Ordering::Equal,
            LogicOp::Ne => ord != Ordering::Equal,
            LogicOp::Gt => ord == Ordering::Greater,
            LogicOp::Gte => ord != Ordering::Less,
            LogicOp::Lt => ord == Ordering::Less,
            LogicOp::Lte => ord != Ordering::Greater,
        }
    }
}

/// Change-filter predicate. Fails closed (false) on any type disagreement.
///
/// Numeric: `(current - diff) op latest`. Bool: `gt` is a false->true edge,
/// `lt` a true->false edge. Bool and string require `diff == "0"`.
pub fn compare_values(op: LogicOp, latest: &Value, current: &Value, diff: &str) -> bool {
    match (latest, current) {
        (Value::Bool(l), Value::Bool(c)) => {
            if diff.trim() != "0" { return false; }
            match op {
                LogicOp::Eq => l == c,
                LogicOp::Ne => l != c,
                LogicOp::Gt => !*l && *c,
                LogicOp::Lt => *l && !*c,
                _ => false,
            }
        }
        (Value::Str(l), Value::Str(c)) => {
            if diff.trim() != "0" { return false; }
            match op { LogicOp::Eq => l == c, LogicOp::Ne => l != c, _ => false }
        }
        (Value::Int(l), Value::Int(c)) => match Value::parse(diff) {
            Value::Int(d) => c.checked_sub(d).map(|x| op.holds(x.cmp(l))).unwrap_or(false),
            _ => false,
        },
        (Value::Float(l), Value::Float(c)) => match Value::parse(diff).as_f64() {
            Some(d) => (c - d).partial_cmp(l).map(|o| op.holds(o)).unwrap_or(false),
            None => false,
        },
        _ => false,
    }
}

/// Range boundary test: `current op boundary`. Int and float boundaries mix
/// freely; everything else must agree in kind.
pub fn in_range(op: LogicOp, current: &Value, boundary: &Value) -> bool {
    match (current, boundary) {
        (Value::Bool(c), Value::Bool(b)) => match op { LogicOp::Eq => c == b, LogicOp::Ne => c != b, _ => false },
        (Value::Str(c), Value::Str(b)) => op.holds(c.as_str().cmp(b.as_str())),
        (c, b) => match (c.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).map(|o| op.holds(o)).unwrap_or(false),
            _ => false,
        },
    }
}
