//! Rolling log of rate-limit decisions and the admin reports derived from
//! it: totals, top violating users, top violating IPs and a per-minute
//! timeline.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::limiter::{RequestContext, ViolationType};
use crate::auth::Tier;

const TIMELINE_BUCKET_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    Allowed,
    Blocked(ViolationType),
    /// Carries the id of the rule that granted the exemption.
    Exempt(String),
}

#[derive(Debug, Clone)]
struct DecisionEvent {
    at: i64,
    user_id: Option<String>,
    tier: Tier,
    ip: String,
    outcome: DecisionOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSummary {
    pub period_start: i64,
    pub period_end: i64,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub exempted_requests: u64,
    /// Percentage of non-exempt requests that were blocked.
    pub block_rate: f64,
    pub violations_by_type: BTreeMap<String, u64>,
    pub violations_by_tier: BTreeMap<String, u64>,
    pub exemptions_by_rule: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolatorEntry {
    pub user_id: String,
    pub user_tier: Tier,
    pub violation_count: u64,
    pub last_violation_at: i64,
    pub violation_types: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpViolationEntry {
    pub ip_address: String,
    pub violation_count: u64,
    pub distinct_users: usize,
    pub last_violation_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineBucket {
    pub bucket_start: i64,
    pub allowed: u64,
    pub blocked: u64,
    pub exempted: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub summary: RateLimitSummary,
    pub top_violators: Vec<ViolatorEntry>,
    pub top_ips: Vec<IpViolationEntry>,
    pub timeline: Vec<TimelineBucket>,
}

/// Bounded, time-ordered decision log.
#[derive(Debug)]
pub struct ViolationReporter {
    events: Mutex<VecDeque<DecisionEvent>>,
    max_events: usize,
    retention_ms: i64,
}

impl ViolationReporter {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn new(max_events: usize, retention: Duration) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max_events.max(1),
            retention_ms: retention.as_millis() as i64,
        }
    }

    pub fn record(&self, now: i64, ctx: &RequestContext, outcome: DecisionOutcome) {
        let mut events = self.lock();
        while events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(DecisionEvent {
            at: now,
            user_id: ctx.user_id.clone(),
            tier: ctx.tier,
            ip: ctx.ip.clone(),
            outcome,
        });
    }

    /// Drop events older than the retention period.
    pub fn prune(&self, now: i64) {
        let cutoff = now - self.retention_ms;
        let mut events = self.lock();
        while events.front().is_some_and(|e| e.at < cutoff) {
            events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn summary(&self, now: i64, period: Duration) -> RateLimitSummary {
        let start = self.period_start(now, period);
        let events = self.lock();
        summarize(events.iter().filter(|e| e.at >= start), start, now)
    }

    /// Users ranked by violation count, ties broken by most recent violation.
    pub fn top_violators(&self, now: i64, period: Duration, limit: usize) -> Vec<ViolatorEntry> {
        let start = self.period_start(now, period);
        let events = self.lock();
        top_violators(events.iter().filter(|e| e.at >= start), limit)
    }

    pub fn top_ips(&self, now: i64, period: Duration, limit: usize) -> Vec<IpViolationEntry> {
        let start = self.period_start(now, period);
        let events = self.lock();
        top_ips(events.iter().filter(|e| e.at >= start), limit)
    }

    pub fn dashboard(&self, now: i64, period: Duration, limit: usize) -> DashboardData {
        let start = self.period_start(now, period);
        let events = self.lock();
        let window: Vec<&DecisionEvent> = events.iter().filter(|e| e.at >= start).collect();
        DashboardData {
            summary: summarize(window.iter().copied(), start, now),
            top_violators: top_violators(window.iter().copied(), limit),
            top_ips: top_ips(window.iter().copied(), limit),
            timeline: timeline(window.iter().copied()),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn period_start(&self, now: i64, period: Duration) -> i64 {
        now - (period.as_millis() as i64).min(self.retention_ms)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DecisionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[allow(clippy::cast_precision_loss)]
fn summarize<'a>(
    events: impl Iterator<Item = &'a DecisionEvent>,
    period_start: i64,
    period_end: i64,
) -> RateLimitSummary {
    let mut summary = RateLimitSummary {
        period_start,
        period_end,
        ..RateLimitSummary::default()
    };
    for event in events {
        summary.total_requests += 1;
        match &event.outcome {
            DecisionOutcome::Allowed => summary.allowed_requests += 1,
            DecisionOutcome::Blocked(violation) => {
                summary.blocked_requests += 1;
                *summary
                    .violations_by_type
                    .entry(violation.as_str().to_string())
                    .or_default() += 1;
                *summary
                    .violations_by_tier
                    .entry(event.tier.as_str().to_string())
                    .or_default() += 1;
            }
            DecisionOutcome::Exempt(rule_id) => {
                summary.exempted_requests += 1;
                *summary.exemptions_by_rule.entry(rule_id.clone()).or_default() += 1;
            }
        }
    }
    let limited = summary.allowed_requests + summary.blocked_requests;
    if limited > 0 {
        summary.block_rate = summary.blocked_requests as f64 / limited as f64 * 100.0;
    }
    summary
}

fn top_violators<'a>(
    events: impl Iterator<Item = &'a DecisionEvent>,
    limit: usize,
) -> Vec<ViolatorEntry> {
    let mut by_user: HashMap<&str, ViolatorEntry> = HashMap::new();
    for event in events {
        let DecisionOutcome::Blocked(violation) = &event.outcome else {
            continue;
        };
        let Some(user_id) = event.user_id.as_deref() else {
            continue;
        };
        let entry = by_user.entry(user_id).or_insert_with(|| ViolatorEntry {
            user_id: user_id.to_string(),
            user_tier: event.tier,
            violation_count: 0,
            last_violation_at: event.at,
            violation_types: BTreeMap::new(),
        });
        entry.violation_count += 1;
        entry.last_violation_at = entry.last_violation_at.max(event.at);
        entry.user_tier = event.tier;
        *entry
            .violation_types
            .entry(violation.as_str().to_string())
            .or_default() += 1;
    }
    let mut ranked: Vec<ViolatorEntry> = by_user.into_values().collect();
    ranked.sort_by(|a, b| {
        b.violation_count
            .cmp(&a.violation_count)
            .then(b.last_violation_at.cmp(&a.last_violation_at))
            .then(a.user_id.cmp(&b.user_id))
    });
    ranked.truncate(limit);
    ranked
}

fn top_ips<'a>(
    events: impl Iterator<Item = &'a DecisionEvent>,
    limit: usize,
) -> Vec<IpViolationEntry> {
    let mut by_ip: HashMap<&str, (u64, HashSet<&str>, i64)> = HashMap::new();
    for event in events {
        if !matches!(event.outcome, DecisionOutcome::Blocked(_)) {
            continue;
        }
        let (count, users, last) = by_ip
            .entry(event.ip.as_str())
            .or_insert_with(|| (0, HashSet::new(), event.at));
        *count += 1;
        *last = (*last).max(event.at);
        if let Some(user_id) = event.user_id.as_deref() {
            users.insert(user_id);
        }
    }
    let mut ranked: Vec<IpViolationEntry> = by_ip
        .into_iter()
        .map(|(ip, (count, users, last))| IpViolationEntry {
            ip_address: ip.to_string(),
            violation_count: count,
            distinct_users: users.len(),
            last_violation_at: last,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.violation_count
            .cmp(&a.violation_count)
            .then(b.last_violation_at.cmp(&a.last_violation_at))
            .then(a.ip_address.cmp(&b.ip_address))
    });
    ranked.truncate(limit);
    ranked
}

fn timeline<'a>(events: impl Iterator<Item = &'a DecisionEvent>) -> Vec<TimelineBucket> {
    let mut buckets: BTreeMap<i64, TimelineBucket> = BTreeMap::new();
    for event in events {
        let bucket_start = event.at - event.at.rem_euclid(TIMELINE_BUCKET_MS);
        let bucket = buckets.entry(bucket_start).or_insert_with(|| TimelineBucket {
            bucket_start,
            ..TimelineBucket::default()
        });
        match event.outcome {
            DecisionOutcome::Allowed => bucket.allowed += 1,
            DecisionOutcome::Blocked(_) => bucket.blocked += 1,
            DecisionOutcome::Exempt(_) => bucket.exempted += 1,
        }
    }
    buckets.into_values().collect()
}
