//! Label filters.
//!
//! A filter is a predicate over a host's label set. Filters are compiled
//! from strings such as `"host.num_cpus >= 4"`, `"gpu"`, `"!maintenance"`,
//! `"os in (linux, bsd)"` or `"host.resource.gpu contains gpu0, gpu1"`, or
//! synthesized directly (capacity minimums, generic-resource demands).
//!
//! Syntax errors surface when compiling; matching never fails, it only
//! reports why a label could not be compared.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use hostspool_state::split_items;

use crate::error::{PlacementError, PlacementResult};
use crate::resources::parse_quantity;

static FILTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<neg>!)?\s*(?P<key>[A-Za-z0-9_.\-/]+)\s*(?:(?P<op>==|!=|>=|<=|=|>|<|\bnot\s+in\b|\bin\b|\bcontains\b)\s*(?P<value>.*?))?\s*$",
    )
    .expect("filter regex is valid")
});

/// Numeric comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    fn holds(self, left: u64, right: u64) -> bool {
        match self {
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
        }
    }
}

/// A compiled predicate over host labels.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Exists(String),
    Absent(String),
    Equals(String, String),
    NotEquals(String, String),
    /// Numeric comparison; `value` is in base units, `raw` is what was written.
    Compare {
        key: String,
        op: CompareOp,
        value: u64,
        raw: String,
    },
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    /// Every listed item is present in the comma-separated label value.
    Contains(String, Vec<String>),
    /// The comma-separated label value has at least n items.
    MinItems(String, usize),
}

impl Filter {
    /// Compile a filter string.
    pub fn parse(filter: &str) -> PlacementResult<Filter> {
        let syntax = |reason: &str| PlacementError::FilterSyntax {
            filter: filter.to_string(),
            reason: reason.to_string(),
        };
        let caps = FILTER_RE
            .captures(filter)
            .ok_or_else(|| syntax("expected `key`, `!key` or `key <op> value`"))?;
        let key = caps["key"].to_string();
        let negated = caps.name("neg").is_some();

        let Some(op) = caps.name("op") else {
            return Ok(if negated {
                Filter::Absent(key)
            } else {
                Filter::Exists(key)
            });
        };
        if negated {
            return Err(syntax("`!` only applies to existence checks"));
        }
        let value = caps.name("value").map(|m| m.as_str().trim()).unwrap_or("");
        if value.is_empty() {
            return Err(syntax("missing value after operator"));
        }
        let op = op.as_str().split_whitespace().collect::<Vec<_>>().join(" ");

        match op.as_str() {
            "=" | "==" => Ok(Filter::Equals(key, unquote(value).to_string())),
            "!=" => Ok(Filter::NotEquals(key, unquote(value).to_string())),
            ">" | ">=" | "<" | "<=" => {
                let quantity =
                    parse_quantity(value).ok_or_else(|| syntax("expected a number with optional unit"))?;
                let op = match op.as_str() {
                    ">" => CompareOp::Gt,
                    ">=" => CompareOp::Ge,
                    "<" => CompareOp::Lt,
                    _ => CompareOp::Le,
                };
                Ok(Filter::Compare {
                    key,
                    op,
                    value: quantity.value,
                    raw: value.to_string(),
                })
            }
            "in" | "not in" => {
                let inner = value
                    .strip_prefix('(')
                    .and_then(|v| v.strip_suffix(')'))
                    .ok_or_else(|| syntax("set must be written as `(a, b, ...)`"))?;
                let items: Vec<String> = split_items(inner)
                    .iter()
                    .map(|i| unquote(i).to_string())
                    .collect();
                if items.is_empty() {
                    return Err(syntax("empty set"));
                }
                Ok(if op == "in" {
                    Filter::In(key, items)
                } else {
                    Filter::NotIn(key, items)
                })
            }
            "contains" => {
                let items = split_items(value);
                if items.is_empty() {
                    return Err(syntax("missing items after `contains`"));
                }
                Ok(Filter::Contains(key, items))
            }
            _ => Err(syntax("unknown operator")),
        }
    }

    /// Minimum-capacity filter: `key >= raw`.
    pub fn at_least(key: &str, raw: &str) -> PlacementResult<Filter> {
        let quantity = parse_quantity(raw).ok_or_else(|| PlacementError::FilterSyntax {
            filter: format!("{key} >= {raw}"),
            reason: "expected a number with optional unit".to_string(),
        })?;
        Ok(Filter::Compare {
            key: key.to_string(),
            op: CompareOp::Ge,
            value: quantity.value,
            raw: raw.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        match self {
            Filter::Exists(k)
            | Filter::Absent(k)
            | Filter::Equals(k, _)
            | Filter::NotEquals(k, _)
            | Filter::Compare { key: k, .. }
            | Filter::In(k, _)
            | Filter::NotIn(k, _)
            | Filter::Contains(k, _)
            | Filter::MinItems(k, _) => k,
        }
    }

    /// Evaluate against a label set. `Err` carries the reason a label could
    /// not be compared; it counts as a non-match.
    pub fn check(&self, labels: &HashMap<String, String>) -> Result<bool, String> {
        let label = labels.get(self.key());
        Ok(match self {
            Filter::Exists(_) => label.is_some(),
            Filter::Absent(_) => label.is_none(),
            Filter::Equals(_, v) => label.is_some_and(|l| l.trim() == v),
            Filter::NotEquals(_, v) => label.is_none_or(|l| l.trim() != v),
            Filter::Compare { key, op, value, .. } => match label {
                None => false,
                Some(l) => {
                    let current = parse_quantity(l).ok_or_else(|| {
                        format!("label {key}={l:?} is not a number, cannot evaluate {self}")
                    })?;
                    op.holds(current.value, *value)
                }
            },
            Filter::In(_, set) => label.is_some_and(|l| set.iter().any(|v| v == l.trim())),
            Filter::NotIn(_, set) => label.is_none_or(|l| !set.iter().any(|v| v == l.trim())),
            Filter::Contains(_, items) => label.is_some_and(|l| {
                let available = split_items(l);
                items.iter().all(|i| available.contains(i))
            }),
            Filter::MinItems(_, n) => label.map_or(*n == 0, |l| split_items(l).len() >= *n),
        })
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.check(labels).unwrap_or(false)
    }
}

impl FromStr for Filter {
    type Err = PlacementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Exists(k) => write!(f, "{k}"),
            Filter::Absent(k) => write!(f, "!{k}"),
            Filter::Equals(k, v) => write!(f, "{k} == {v}"),
            Filter::NotEquals(k, v) => write!(f, "{k} != {v}"),
            Filter::Compare { key, op, raw, .. } => write!(f, "{key} {} {raw}", op.symbol()),
            Filter::In(k, set) => write!(f, "{k} in ({})", set.join(", ")),
            Filter::NotIn(k, set) => write!(f, "{k} not in ({})", set.join(", ")),
            Filter::Contains(k, items) => write!(f, "{k} contains {}", items.join(", ")),
            Filter::MinItems(k, n) => write!(f, "{k} has at least {n} items"),
        }
    }
}

/// Evaluate all filters; returns whether all match plus the warnings
/// raised by labels that could not be compared.
pub fn matches_all(filters: &[Filter], labels: &HashMap<String, String>) -> (bool, Vec<String>) {
    let mut warnings = Vec::new();
    let mut matched = true;
    for filter in filters {
        match filter.check(labels) {
            Ok(true) => {}
            Ok(false) => matched = false,
            Err(warning) => {
                warnings.push(warning);
                matched = false;
            }
        }
    }
    (matched, warnings)
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(s)
}
