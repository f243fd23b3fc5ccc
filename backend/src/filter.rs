// =============================================================================
// VISS GATEWAY — Filter model
// =============================================================================
// One `Filter` variant per filter type. A request carries at most two: a
// `paths` filter plus one other. range/change/curvelog/timebased are the
// subscription trigger policies and therefore mutually exclusive.
// =============================================================================

use serde_json::Value as Json;
use thiserror::Error;

use crate::value::{LogicOp, Value};

#[derive(Debug, Error, PartialEq)]
#[error("{0}")]
pub struct FilterError(pub String);

fn bad(msg: impl Into<String>) -> FilterError { FilterError(msg.into()) }

#[derive(Debug, Clone, PartialEq)]
pub struct RangeExpr { pub op: LogicOp, pub boundary: Value }

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Paths(Vec<String>),
    Timebased { period_ms: u64 },
    Range(Vec<RangeExpr>),
    Change { op: LogicOp, diff: String },
    Curvelog { max_err: f64, buf_size: usize },
    History { period: String },
    StaticMetadata { parameter: String },
    DynamicMetadata { domain: String },
}

impl Filter {
    pub fn type_name(&self) -> &'static str {
        match self {
            Filter::Paths(_) => "paths",
            Filter::Timebased { .. } => "timebased",
            Filter::Range(_) => "range",
            Filter::Change { .. } => "change",
            Filter::Curvelog { .. } => "curvelog",
            Filter::History { .. } => "history",
            Filter::StaticMetadata { .. } => "static-metadata",
            Filter::DynamicMetadata { .. } => "dynamic-metadata",
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Filter::Timebased { .. } | Filter::Range(_) | Filter::Change { .. } | Filter::Curvelog { .. })
    }

    /// Evaluates a range filter; every boundary expression must hold.
    pub fn range_holds(&self, current: &Value) -> bool {
        match self {
            Filter::Range(exprs) => !exprs.is_empty() && exprs.iter().all(|e| crate::value::in_range(e.op, current, &e.boundary)),
            _ => false,
        }
    }
}

/// Accepts `"12"` as well as `12`.
fn scalar(v: Option<&Json>) -> Option<String> {
    match v? {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn logic_op(obj: &Json, kind: &str) -> Result<LogicOp, FilterError> {
    let raw = scalar(obj.get("logic-op")).ok_or_else(|| bad(format!("{kind} filter requires logic-op")))?;
    LogicOp::parse(&raw).ok_or_else(|| bad(format!("unknown logic-op '{raw}'")))
}

fn parse_range_expr(obj: &Json) -> Result<RangeExpr, FilterError> {
    let op = logic_op(obj, "range")?;
    let boundary = scalar(obj.get("boundary")).ok_or_else(|| bad("range filter requires boundary"))?;
    Ok(RangeExpr { op, boundary: Value::parse(&boundary) })
}

fn parse_one(obj: &Json) -> Result<Filter, FilterError> {
    let kind = obj.get("type").and_then(Json::as_str).ok_or_else(|| bad("filter type missing"))?;
    let param = obj.get("parameter").ok_or_else(|| bad(format!("{kind} filter requires parameter")))?;
    Ok(match kind {
        "paths" => {
            let paths: Vec<String> = match param {
                Json::String(s) => vec![s.clone()],
                Json::Array(a) => a.iter().map(|p| p.as_str().map(str::to_string)).collect::<Option<_>>()
                    .ok_or_else(|| bad("paths parameter must hold strings"))?,
                _ => return Err(bad("paths parameter must be a path or array of paths")),
            };
            if paths.is_empty() || paths.iter().any(|p| p.is_empty()) { return Err(bad("paths parameter is empty")); }
            Filter::Paths(paths)
        }
        "timebased" => {
            let p = scalar(param.get("period")).ok_or_else(|| bad("timebased filter requires period"))?;
            match p.parse::<u64>() {
                Ok(ms) if ms > 0 => Filter::Timebased { period_ms: ms },
                _ => return Err(bad(format!("invalid period '{p}'"))),
            }
        }
        "range" => {
            let exprs = match param {
                Json::Array(a) => a.iter().map(parse_range_expr).collect::<Result<Vec<_>, _>>()?,
                obj @ Json::Object(_) => vec![parse_range_expr(obj)?],
                _ => return Err(bad("range parameter must be an object or array")),
            };
            if exprs.is_empty() { return Err(bad("range parameter is empty")); }
            Filter::Range(exprs)
        }
        "change" => {
            let op = logic_op(param, "change")?;
            let diff = scalar(param.get("diff")).ok_or_else(|| bad("change filter requires diff"))?;
            Filter::Change { op, diff }
        }
        "curvelog" => {
            let me = scalar(param.get("maxerr")).ok_or_else(|| bad("curvelog filter requires maxerr"))?;
            let bs = scalar(param.get("bufsize")).ok_or_else(|| bad("curvelog filter requires bufsize"))?;
            let max_err = me.parse::<f64>().ok().filter(|e| e.is_finite() && *e >= 0.0)
                .ok_or_else(|| bad(format!("invalid maxerr '{me}'")))?;
            let buf_size = bs.parse::<usize>().ok().filter(|b| *b > 0)
                .ok_or_else(|| bad(format!("invalid bufsize '{bs}'")))?;
            Filter::Curvelog { max_err, buf_size }
        }
        "history" => Filter::History { period: scalar(Some(param)).ok_or_else(|| bad("history parameter must be a duration"))? },
        "static-metadata" => Filter::StaticMetadata { parameter: scalar(Some(param)).unwrap_or_default() },
        "dynamic-metadata" => Filter::DynamicMetadata {
            domain: scalar(Some(param)).filter(|d| !d.is_empty()).ok_or_else(|| bad("dynamic-metadata requires a domain"))?,
        },
        other => return Err(bad(format!("unknown filter type '{other}'"))),
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterList { items: Vec<Filter> }

impl FilterList {
    pub fn parse(v: &Json) -> Result<Self, FilterError> {
        let items = match v {
            Json::Array(a) => a.iter().map(parse_one).collect::<Result<Vec<_>, _>>()?,
            obj @ Json::Object(_) => vec![parse_one(obj)?],
            _ => return Err(bad("filter must be an object or array")),
        };
        if items.is_empty() { return Err(bad("filter is empty")); }
        if items.len() > 2 { return Err(bad("at most two filters may be combined")); }
        if items.len() == 2 {
            let paths = items.iter().filter(|f| matches!(f, Filter::Paths(_))).count();
            if paths != 1 { return Err(bad("only a paths filter may be combined with another filter")); }
        }
        Ok(Self { items })
    }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Filter> { self.items.iter() }

    pub fn paths(&self) -> Option<&[String]> {
        self.items.iter().find_map(|f| match f { Filter::Paths(p) => Some(p.as_slice()), _ => None })
    }

    pub fn trigger(&self) -> Option<&Filter> { self.items.iter().find(|f| f.is_trigger()) }

    pub fn history(&self) -> Option<&str> {
        self.items.iter().find_map(|f| match f { Filter::History { period } => Some(period.as_str()), _ => None })
    }

    pub fn static_metadata(&self) -> Option<&str> {
        self.items.iter().find_map(|f| match f { Filter::StaticMetadata { parameter } => Some(parameter.as_str()), _ => None })
    }

    pub fn dynamic_metadata(&self) -> Option<&str> {
        self.items.iter().find_map(|f| match f { Filter::DynamicMetadata { domain } => Some(domain.as_str()), _ => None })
    }
}
