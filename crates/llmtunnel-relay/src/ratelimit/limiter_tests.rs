use std::sync::Arc;
use std::time::Duration;

use llmtunnel_core::ManualClock;

use super::config::{LimitSpec, RateLimitConfig};
use super::limiter::{LimitScope, RateLimitDecision, RateLimiter, RequestContext, ViolationType};
use crate::auth::Tier;

const START: i64 = 1_700_000_000_000;

fn small_config() -> RateLimitConfig {
    RateLimitConfig {
        free: LimitSpec {
            window_secs: 60,
            max_requests: 5,
            burst_window_secs: 10,
            burst_max: 3,
            max_concurrent: 2,
        },
        ip: LimitSpec {
            window_secs: 60,
            max_requests: 8,
            burst_window_secs: 10,
            burst_max: 8,
            max_concurrent: 0,
        },
        ..RateLimitConfig::default()
    }
}

fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    (RateLimiter::new(config, clock.clone()), clock)
}

fn request(user: Option<&str>, ip: &str, path: &str) -> RequestContext {
    RequestContext {
        correlation_id: uuid::Uuid::new_v4().to_string(),
        user_id: user.map(str::to_string),
        tier: Tier::Free,
        role: None,
        ip: ip.into(),
        method: "POST".into(),
        path: path.into(),
    }
}

fn allowed(decision: &RateLimitDecision) -> bool {
    matches!(decision, RateLimitDecision::Allowed(_))
}

fn violation(decision: &RateLimitDecision) -> Option<ViolationType> {
    match decision {
        RateLimitDecision::Blocked(block) => Some(block.violation_type),
        _ => None,
    }
}

#[test]
fn window_limit_blocks_after_max() {
    let (limiter, clock) = limiter(RateLimitConfig::default());
    let ctx = request(Some("u"), "10.0.0.1", "/proxy/v1/chat");

    for n in 1..=100 {
        assert!(allowed(&limiter.check(&ctx)), "request #{n} should pass");
        clock.advance(Duration::from_millis(10));
    }
    let decision = limiter.check(&ctx);
    assert_eq!(violation(&decision), Some(ViolationType::WindowLimitExceeded));
    clock.advance(Duration::from_millis(10));
    assert_eq!(
        violation(&limiter.check(&ctx)),
        Some(ViolationType::WindowLimitExceeded)
    );
    let RateLimitDecision::Blocked(block) = decision else {
        unreachable!()
    };
    assert_eq!(block.scope, LimitScope::User);
    assert!(block.retry_after <= Duration::from_secs(60));
    assert!(block.retry_after > Duration::ZERO);
}

#[test]
fn default_bursts_never_undercut_the_window() {
    let config = RateLimitConfig::default();
    for tier in [Tier::Free, Tier::Premium, Tier::Enterprise] {
        let spec = config.for_tier(tier);
        assert!(spec.burst_max >= spec.max_requests, "{tier}");
    }
    assert!(config.ip.burst_max >= config.ip.max_requests);
}

#[test]
fn burst_limit_applies_within_sub_window() {
    let (limiter, clock) = limiter(small_config());
    let ctx = request(Some("u"), "10.0.0.1", "/proxy/x");

    for _ in 0..3 {
        assert!(allowed(&limiter.check(&ctx)));
    }
    assert_eq!(
        violation(&limiter.check(&ctx)),
        Some(ViolationType::BurstLimitExceeded)
    );

    clock.advance(Duration::from_secs(10));
    assert!(allowed(&limiter.check(&ctx)));
}

#[test]
fn blocked_requests_are_not_counted() {
    let (limiter, clock) = limiter(small_config());
    let ctx = request(Some("u"), "10.0.0.1", "/proxy/x");

    for _ in 0..3 {
        assert!(allowed(&limiter.check(&ctx)));
    }
    for _ in 0..10 {
        assert!(!allowed(&limiter.check(&ctx)));
    }
    // The window holds 5; only 3 were admitted, so two more fit after the burst resets.
    clock.advance(Duration::from_secs(10));
    assert!(allowed(&limiter.check(&ctx)));
    assert!(allowed(&limiter.check(&ctx)));
    assert_eq!(
        violation(&limiter.check(&ctx)),
        Some(ViolationType::WindowLimitExceeded)
    );
}

#[test]
fn window_resets_after_elapsing() {
    let (limiter, clock) = limiter(small_config());
    let ctx = request(Some("u"), "10.0.0.1", "/proxy/x");
    for _ in 0..3 {
        assert!(allowed(&limiter.check(&ctx)));
    }
    clock.advance(Duration::from_secs(10));
    for _ in 0..2 {
        assert!(allowed(&limiter.check(&ctx)));
    }
    assert!(!allowed(&limiter.check(&ctx)));

    clock.advance(Duration::from_secs(50));
    assert!(allowed(&limiter.check(&ctx)));
}

#[test]
fn concurrency_cap_releases_on_drop() {
    let (limiter, _clock) = limiter(small_config());
    let ctx = request(Some("u"), "10.0.0.1", "/proxy/x");

    let first = limiter.check(&ctx);
    let second = limiter.check(&ctx);
    assert!(allowed(&first) && allowed(&second));
    assert_eq!(limiter.in_flight("u"), 2);

    let decision = limiter.check(&ctx);
    assert_eq!(
        violation(&decision),
        Some(ViolationType::ConcurrentLimitExceeded)
    );
    let RateLimitDecision::Blocked(block) = decision else {
        unreachable!()
    };
    assert_eq!(block.retry_after, Duration::from_secs(1));

    drop(first);
    assert_eq!(limiter.in_flight("u"), 1);
    assert!(allowed(&limiter.check(&ctx)));
    drop(second);
}

#[test]
fn ip_limit_is_enforced_independently() {
    let (limiter, _clock) = limiter(small_config());
    // Many users behind one address: each is under their own limit.
    for i in 0..8 {
        let ctx = request(Some(&format!("user-{i}")), "10.9.9.9", "/proxy/x");
        let decision = limiter.check(&ctx);
        assert!(allowed(&decision));
    }
    let decision = limiter.check(&request(Some("user-new"), "10.9.9.9", "/proxy/x"));
    let RateLimitDecision::Blocked(block) = decision else {
        unreachable!("expected IP block")
    };
    assert_eq!(block.scope, LimitScope::Ip);

    // The blocked request did not consume the new user's allowance elsewhere.
    assert!(allowed(
        &limiter.check(&request(Some("user-new"), "10.1.1.1", "/proxy/x"))
    ));
}

#[test]
fn user_block_does_not_consume_ip_allowance() {
    let (limiter, _clock) = limiter(small_config());
    let noisy = request(Some("noisy"), "10.2.2.2", "/proxy/x");
    for _ in 0..3 {
        let _ = limiter.check(&noisy);
    }
    for _ in 0..20 {
        assert!(!allowed(&limiter.check(&noisy)));
    }
    // The IP has seen 3 admitted requests of its 8.
    for i in 0..5 {
        let ctx = request(Some(&format!("other-{i}")), "10.2.2.2", "/proxy/x");
        assert!(allowed(&limiter.check(&ctx)));
    }
}

#[test]
fn anonymous_requests_limited_by_ip() {
    let (limiter, _clock) = limiter(small_config());
    let ctx = request(None, "10.3.3.3", "/proxy/x");
    for _ in 0..8 {
        let RateLimitDecision::Allowed(admission) = limiter.check(&ctx) else {
            unreachable!()
        };
        assert!(admission.permit.is_none());
        assert_eq!(admission.limit, 8);
    }
    assert_eq!(
        violation(&limiter.check(&ctx)),
        Some(ViolationType::WindowLimitExceeded)
    );
}

#[test]
fn admission_reports_remaining() {
    let (limiter, _clock) = limiter(small_config());
    let ctx = request(Some("u"), "10.0.0.1", "/proxy/x");
    let RateLimitDecision::Allowed(admission) = limiter.check(&ctx) else {
        unreachable!()
    };
    assert_eq!(admission.limit, 5);
    assert_eq!(admission.remaining, 4);
    assert_eq!(admission.reset_after, Duration::from_secs(60));
}

#[test]
fn exempt_paths_skip_limits_and_are_reported() {
    let (limiter, _clock) = limiter(small_config());
    let ctx = request(Some("u"), "10.0.0.1", "/health");
    for _ in 0..50 {
        assert!(matches!(
            limiter.check(&ctx),
            RateLimitDecision::Exempt(_)
        ));
    }
    let summary = limiter
        .reporter()
        .summary(limiter.now_millis(), Duration::from_secs(3600));
    assert_eq!(summary.exempted_requests, 50);
    assert_eq!(summary.exemptions_by_rule["health-check"], 50);
    // Exempt requests did not consume the user's window.
    assert!(allowed(
        &limiter.check(&request(Some("u"), "10.0.0.1", "/proxy/x"))
    ));
}

#[test]
fn violations_feed_top_violators() {
    let (limiter, _clock) = limiter(small_config());
    let ctx = request(Some("abuser"), "10.0.0.1", "/proxy/x");
    for _ in 0..6 {
        let _ = limiter.check(&ctx);
    }
    let top = limiter
        .reporter()
        .top_violators(limiter.now_millis(), Duration::from_secs(3600), 5);
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].user_id, "abuser");
    assert_eq!(top[0].violation_count, 3);
}

#[test]
fn prune_forgets_idle_state() {
    let (limiter, clock) = limiter(small_config());
    let ctx = request(Some("u"), "10.0.0.1", "/proxy/x");
    drop(limiter.check(&ctx));
    clock.advance(Duration::from_secs(601));
    assert_eq!(limiter.prune(), 2);
    assert_eq!(limiter.in_flight("u"), 0);
}
