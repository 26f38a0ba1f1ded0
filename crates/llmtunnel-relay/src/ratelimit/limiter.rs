//! Fixed-window counters with a burst sub-window and a per-user
//! concurrency cap.
//!
//! Windows are anchored at the first request after the previous window
//! elapsed. Blocked requests never increment any counter. A request is
//! admitted only if both its user and its IP pass every check; counters are
//! committed together afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use llmtunnel_core::Clock;

use super::config::{LimitSpec, RateLimitConfig};
use super::exemption::{ExemptionEngine, ExemptionGrant};
use super::report::{DecisionOutcome, ViolationReporter};
use crate::auth::Tier;
use crate::telemetry;

/// What the limiter needs to know about an inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    /// `None` for unauthenticated requests, which are limited by IP only.
    pub user_id: Option<String>,
    pub tier: Tier,
    pub role: Option<String>,
    pub ip: String,
    pub method: String,
    pub path: String,
}

impl RequestContext {
    /// Key for per-subject bookkeeping: the user if known, else the IP.
    pub fn subject_key(&self) -> String {
        self.user_id
            .clone()
            .unwrap_or_else(|| format!("ip:{}", self.ip))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    WindowLimitExceeded,
    BurstLimitExceeded,
    ConcurrentLimitExceeded,
}

impl ViolationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WindowLimitExceeded => "window_limit_exceeded",
            Self::BurstLimitExceeded => "burst_limit_exceeded",
            Self::ConcurrentLimitExceeded => "concurrent_limit_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    User,
    Ip,
}

/// Holds one in-flight slot for a user; released on drop.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    in_flight: Arc<DashMap<String, u32>>,
    user_id: String,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Some(mut count) = self.in_flight.get_mut(&self.user_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Debug)]
pub struct Admission {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the governing window resets.
    pub reset_after: Duration,
    pub permit: Option<ConcurrencyPermit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub violation_type: ViolationType,
    pub scope: LimitScope,
    pub limit: u32,
    /// Never longer than the violated window.
    pub retry_after: Duration,
}

#[derive(Debug)]
pub enum RateLimitDecision {
    Exempt(ExemptionGrant),
    Allowed(Admission),
    Blocked(Block),
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    window_start: i64,
    window_count: u32,
    burst_start: i64,
    burst_count: u32,
}

impl CounterState {
    const fn new(now: i64) -> Self {
        Self {
            window_start: now,
            window_count: 0,
            burst_start: now,
            burst_count: 0,
        }
    }

    const fn roll(&mut self, now: i64, spec: &LimitSpec) {
        if now - self.window_start >= spec.window_ms() {
            self.window_start = now;
            self.window_count = 0;
        }
        if now - self.burst_start >= spec.burst_window_ms() {
            self.burst_start = now;
            self.burst_count = 0;
        }
    }

    fn check(&self, now: i64, spec: &LimitSpec) -> Result<(), (ViolationType, Duration)> {
        if self.window_count >= spec.max_requests {
            let left = self.window_start + spec.window_ms() - now;
            return Err((ViolationType::WindowLimitExceeded, clamp(left, spec)));
        }
        if self.burst_count >= spec.burst_max {
            let left = self.burst_start + spec.burst_window_ms() - now;
            return Err((ViolationType::BurstLimitExceeded, clamp(left, spec)));
        }
        Ok(())
    }

    const fn commit(&mut self) {
        self.window_count += 1;
        self.burst_count += 1;
    }

    const fn is_idle(&self, now: i64, ttl_ms: i64) -> bool {
        now - self.window_start >= ttl_ms && now - self.burst_start >= ttl_ms
    }
}

#[allow(clippy::cast_sign_loss)]
fn clamp(left_ms: i64, spec: &LimitSpec) -> Duration {
    Duration::from_millis(left_ms.max(0) as u64).min(spec.window())
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    users: DashMap<String, CounterState>,
    ips: DashMap<String, CounterState>,
    in_flight: Arc<DashMap<String, u32>>,
    exemptions: ExemptionEngine,
    reporter: ViolationReporter,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let exemptions = ExemptionEngine::with_default_rules(config.exemption_quota_window_ms());
        let reporter = ViolationReporter::new(config.max_report_events, config.report_period());
        Self {
            config,
            clock,
            users: DashMap::new(),
            ips: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
            exemptions,
            reporter,
        }
    }

    pub const fn exemptions(&self) -> &ExemptionEngine {
        &self.exemptions
    }

    pub const fn reporter(&self) -> &ViolationReporter {
        &self.reporter
    }

    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Decide whether a request proceeds. The returned admission carries a
    /// concurrency permit that must be held for the life of the request.
    pub fn check(&self, ctx: &RequestContext) -> RateLimitDecision {
        let started = Instant::now();
        let now = self.clock.now_millis();

        if let Some(grant) = self.exemptions.evaluate(ctx, now) {
            info!(
                correlation_id = %ctx.correlation_id,
                user_id = ctx.user_id.as_deref().unwrap_or("anonymous"),
                rule_id = %grant.rule_id,
                exemption_type = grant.exemption_type.as_str(),
                "Rate limit exemption granted"
            );
            telemetry::record_rate_limit_exemption(&grant.rule_id, grant.exemption_type.as_str());
            telemetry::record_rate_limit_decision("exempt", ctx.tier, started.elapsed());
            self.reporter
                .record(now, ctx, DecisionOutcome::Exempt(grant.rule_id.clone()));
            return RateLimitDecision::Exempt(grant);
        }

        let decision = self.evaluate_limits(ctx, now);
        match &decision {
            RateLimitDecision::Blocked(block) => {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    violation_type = block.violation_type.as_str(),
                    scope = ?block.scope,
                    "Request rate limited"
                );
                telemetry::record_rate_limit_violation(ctx.tier, block.violation_type.as_str());
                telemetry::record_rate_limit_decision("blocked", ctx.tier, started.elapsed());
                self.reporter
                    .record(now, ctx, DecisionOutcome::Blocked(block.violation_type));
            }
            _ => {
                telemetry::record_rate_limit_decision("allowed", ctx.tier, started.elapsed());
                self.reporter.record(now, ctx, DecisionOutcome::Allowed);
            }
        }
        decision
    }

    fn evaluate_limits(&self, ctx: &RequestContext, now: i64) -> RateLimitDecision {
        let user_spec = self.config.for_tier(ctx.tier);
        let ip_spec = &self.config.ip;

        // Lock order: users, then ips, then in_flight.
        let mut user_state = ctx.user_id.as_ref().map(|id| {
            let mut state = self
                .users
                .entry(id.clone())
                .or_insert_with(|| CounterState::new(now));
            state.roll(now, user_spec);
            state
        });

        if let Some(state) = &user_state {
            if let Err((violation_type, retry_after)) = state.check(now, user_spec) {
                return blocked(violation_type, LimitScope::User, user_spec, retry_after);
            }
        }
        if let Some(id) = &ctx.user_id {
            let in_flight = self.in_flight.get(id).map_or(0, |c| *c);
            if user_spec.max_concurrent > 0 && in_flight >= user_spec.max_concurrent {
                return blocked(
                    ViolationType::ConcurrentLimitExceeded,
                    LimitScope::User,
                    user_spec,
                    Duration::from_secs(1).min(user_spec.window()),
                );
            }
        }

        let mut ip_state = self
            .ips
            .entry(ctx.ip.clone())
            .or_insert_with(|| CounterState::new(now));
        ip_state.roll(now, ip_spec);
        if let Err((violation_type, retry_after)) = ip_state.check(now, ip_spec) {
            return blocked(violation_type, LimitScope::Ip, ip_spec, retry_after);
        }

        // Both subjects passed: commit.
        ip_state.commit();
        let (governing_spec, governing) = match user_state.as_mut() {
            Some(state) => {
                state.commit();
                (user_spec, **state)
            }
            None => (ip_spec, *ip_state),
        };
        drop(ip_state);

        let permit = ctx.user_id.as_ref().map(|id| {
            let mut count = self.in_flight.entry(id.clone()).or_insert(0);
            *count += 1;
            telemetry::record_rate_limit_usage(id, governing.window_count, governing.burst_count, *count);
            ConcurrencyPermit {
                in_flight: Arc::clone(&self.in_flight),
                user_id: id.clone(),
            }
        });
        drop(user_state);

        #[allow(clippy::cast_sign_loss)]
        let reset_ms = (governing.window_start + governing_spec.window_ms() - now).max(0) as u64;
        RateLimitDecision::Allowed(Admission {
            limit: governing_spec.max_requests,
            remaining: governing_spec
                .max_requests
                .saturating_sub(governing.window_count),
            reset_after: Duration::from_millis(reset_ms),
            permit,
        })
    }

    /// Current in-flight count for a user.
    pub fn in_flight(&self, user_id: &str) -> u32 {
        self.in_flight.get(user_id).map_or(0, |c| *c)
    }

    /// Forget counter state nobody has touched recently.
    #[allow(clippy::cast_possible_wrap)]
    pub fn prune(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl_ms = (self.config.idle_state_ttl_secs * 1000) as i64;
        let before = self.users.len() + self.ips.len();
        self.users.retain(|_, s| !s.is_idle(now, ttl_ms));
        self.ips.retain(|_, s| !s.is_idle(now, ttl_ms));
        self.in_flight.retain(|_, c| *c > 0);
        self.exemptions.prune(now);
        self.reporter.prune(now);
        before - (self.users.len() + self.ips.len())
    }

    /// Prune idle state every `idle_state_ttl_secs` until shutdown.
    pub fn spawn_prune_task(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = Duration::from_secs(limiter.config.idle_state_ttl_secs.max(1));
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let pruned = limiter.prune();
                        if pruned > 0 {
                            debug!(pruned, "Pruned idle rate-limit state");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

fn blocked(
    violation_type: ViolationType,
    scope: LimitScope,
    spec: &LimitSpec,
    retry_after: Duration,
) -> RateLimitDecision {
    let limit = match violation_type {
        ViolationType::WindowLimitExceeded => spec.max_requests,
        ViolationType::BurstLimitExceeded => spec.burst_max,
        ViolationType::ConcurrentLimitExceeded => spec.max_concurrent,
    };
    RateLimitDecision::Blocked(Block {
        violation_type,
        scope,
        limit,
        retry_after,
    })
}
