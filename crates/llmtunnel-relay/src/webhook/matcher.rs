//! Event selection for webhook registrations: glob event-type patterns plus
//! property filters over the event payload.
//!
//! Matchers are compiled once per registration and cached by registration
//! id; a cached matcher is reused until the registration's `updated_at`
//! changes.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::glob::GlobPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    In,
    Regex,
}

/// Predicate on one payload field, addressed by a dot path such as
/// `data.newStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyFilter {
    pub path: String,
    pub operator: FilterOperator,
    pub value: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("invalid event pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("invalid regex filter on {path:?}: {source}")]
    FilterRegex { path: String, source: regex::Error },

    #[error("filter on {path:?}: {message}")]
    Filter { path: String, message: String },
}

#[derive(Debug)]
enum Compiled {
    Equals(Value),
    Contains(Value),
    StartsWith(String),
    EndsWith(String),
    In(Vec<Value>),
    Regex(Regex),
}

#[derive(Debug)]
struct CompiledFilter {
    path: Vec<String>,
    op: Compiled,
}

impl CompiledFilter {
    fn compile(filter: &PropertyFilter) -> Result<Self, MatcherError> {
        let text = || {
            filter.value.as_str().map(str::to_string).ok_or_else(|| MatcherError::Filter {
                path: filter.path.clone(),
                message: "value must be a string".into(),
            })
        };
        let op = match filter.operator {
            FilterOperator::Equals => Compiled::Equals(filter.value.clone()),
            FilterOperator::Contains => Compiled::Contains(filter.value.clone()),
            FilterOperator::StartsWith => Compiled::StartsWith(text()?),
            FilterOperator::EndsWith => Compiled::EndsWith(text()?),
            FilterOperator::In => match &filter.value {
                Value::Array(values) => Compiled::In(values.clone()),
                _ => {
                    return Err(MatcherError::Filter {
                        path: filter.path.clone(),
                        message: "value must be an array".into(),
                    });
                }
            },
            FilterOperator::Regex => {
                let regex = Regex::new(&text()?).map_err(|source| MatcherError::FilterRegex {
                    path: filter.path.clone(),
                    source,
                })?;
                Compiled::Regex(regex)
            }
        };
        if filter.path.trim().is_empty() {
            return Err(MatcherError::Filter {
                path: filter.path.clone(),
                message: "path must not be empty".into(),
            });
        }
        Ok(Self {
            path: filter.path.split('.').map(str::to_string).collect(),
            op,
        })
    }

    fn matches(&self, payload: &Value) -> bool {
        let Some(field) = lookup(payload, &self.path) else {
            return false;
        };
        match &self.op {
            Compiled::Equals(expected) => field == expected,
            Compiled::Contains(needle) => match (field, needle) {
                (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            Compiled::StartsWith(prefix) => field.as_str().is_some_and(|s| s.starts_with(prefix)),
            Compiled::EndsWith(suffix) => field.as_str().is_some_and(|s| s.ends_with(suffix)),
            Compiled::In(options) => options.contains(field),
            Compiled::Regex(regex) => match field {
                Value::String(s) => regex.is_match(s),
                Value::Number(n) => regex.is_match(&n.to_string()),
                Value::Bool(b) => regex.is_match(&b.to_string()),
                _ => false,
            },
        }
    }
}

fn lookup<'a>(payload: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Compiled event patterns and filters for one registration.
#[derive(Debug)]
pub struct EventMatcher {
    patterns: Vec<GlobPattern>,
    filters: Vec<CompiledFilter>,
}

impl EventMatcher {
    pub fn compile(patterns: &[String], filters: &[PropertyFilter]) -> Result<Self, MatcherError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                GlobPattern::new(p).map_err(|source| MatcherError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let filters = filters
            .iter()
            .map(CompiledFilter::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, filters })
    }

    /// True if the type matches any pattern and every filter passes.
    pub fn matches(&self, event_type: &str, payload: &Value) -> bool {
        self.patterns.iter().any(|p| p.matches(event_type))
            && self.filters.iter().all(|f| f.matches(payload))
    }
}

/// Compiled matchers keyed by registration id.
#[derive(Debug, Default)]
pub struct MatcherCache {
    entries: DashMap<String, (i64, Arc<EventMatcher>)>,
}

impl MatcherCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached matcher for `id` if it was compiled for `version`,
    /// otherwise compile and cache a new one.
    pub fn get_or_compile(
        &self,
        id: &str,
        version: i64,
        patterns: &[String],
        filters: &[PropertyFilter],
    ) -> Result<Arc<EventMatcher>, MatcherError> {
        if let Some(entry) = self.entries.get(id) {
            if entry.0 == version {
                return Ok(Arc::clone(&entry.1));
            }
        }
        let matcher = Arc::new(EventMatcher::compile(patterns, filters)?);
        self.entries
            .insert(id.to_string(), (version, Arc::clone(&matcher)));
        Ok(matcher)
    }

    pub fn invalidate(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn filter(path: &str, operator: FilterOperator, value: Value) -> PropertyFilter {
        PropertyFilter {
            path: path.into(),
            operator,
            value,
        }
    }

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn payload() -> Value {
        json!({
            "type": "tunnel.status_changed",
            "tunnelId": "t-1",
            "data": {
                "previousStatus": "connecting",
                "newStatus": "connected",
                "tags": ["gpu", "local"],
                "latencyMs": 42
            }
        })
    }

    #[test]
    fn glob_patterns_select_event_types() {
        let m = EventMatcher::compile(&patterns(&["tunnel.*"]), &[]).unwrap();
        assert!(m.matches("tunnel.created", &payload()));
        assert!(!m.matches("quota.exceeded", &payload()));

        let m = EventMatcher::compile(&patterns(&["*.status_changed"]), &[]).unwrap();
        assert!(m.matches("tunnel.status_changed", &payload()));
        assert!(!m.matches("tunnel.created", &payload()));

        let m = EventMatcher::compile(&patterns(&["*"]), &[]).unwrap();
        assert!(m.matches("anything.at.all", &payload()));
    }

    #[test]
    fn every_operator() {
        let p = payload();
        let check = |f: PropertyFilter| {
            EventMatcher::compile(&patterns(&["*"]), &[f])
                .unwrap()
                .matches("tunnel.status_changed", &p)
        };
        assert!(check(filter("data.newStatus", FilterOperator::Equals, json!("connected"))));
        assert!(!check(filter("data.newStatus", FilterOperator::Equals, json!("error"))));
        assert!(check(filter("data.newStatus", FilterOperator::Contains, json!("nect"))));
        assert!(check(filter("data.tags", FilterOperator::Contains, json!("gpu"))));
        assert!(check(filter("tunnelId", FilterOperator::StartsWith, json!("t-"))));
        assert!(check(filter("data.previousStatus", FilterOperator::EndsWith, json!("ing"))));
        assert!(check(filter(
            "data.newStatus",
            FilterOperator::In,
            json!(["connected", "disconnected"])
        )));
        assert!(check(filter("data.latencyMs", FilterOperator::Regex, json!("^4\\d$"))));
        assert!(check(filter("data.tags.1", FilterOperator::Equals, json!("local"))));
    }

    #[test]
    fn missing_field_fails_filter() {
        let m = EventMatcher::compile(
            &patterns(&["*"]),
            &[filter("data.nope", FilterOperator::Equals, json!(null))],
        )
        .unwrap();
        assert!(!m.matches("tunnel.created", &payload()));
    }

    #[test]
    fn all_filters_must_pass() {
        let m = EventMatcher::compile(
            &patterns(&["tunnel.*"]),
            &[
                filter("data.newStatus", FilterOperator::Equals, json!("connected")),
                filter("tunnelId", FilterOperator::Equals, json!("t-2")),
            ],
        )
        .unwrap();
        assert!(!m.matches("tunnel.status_changed", &payload()));
    }

    #[test]
    fn invalid_filters_are_rejected_at_compile_time() {
        let bad_regex = filter("data.newStatus", FilterOperator::Regex, json!("("));
        assert!(matches!(
            EventMatcher::compile(&patterns(&["*"]), &[bad_regex]),
            Err(MatcherError::FilterRegex { .. })
        ));
        let bad_in = filter("data.newStatus", FilterOperator::In, json!("connected"));
        assert!(EventMatcher::compile(&patterns(&["*"]), &[bad_in]).is_err());
    }

    #[test]
    fn cache_recompiles_on_new_version() {
        let cache = MatcherCache::new();
        let a = cache
            .get_or_compile("w1", 1, &patterns(&["tunnel.*"]), &[])
            .unwrap();
        let b = cache
            .get_or_compile("w1", 1, &patterns(&["quota.*"]), &[])
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache
            .get_or_compile("w1", 2, &patterns(&["quota.*"]), &[])
            .unwrap();
        assert!(c.matches("quota.exceeded", &payload()));
        assert_eq!(cache.len(), 1);

        cache.invalidate("w1");
        assert!(cache.is_empty());
    }
}
