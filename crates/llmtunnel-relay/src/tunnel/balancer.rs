//! Endpoint selection for proxied requests.
//!
//! Healthy endpoints are preferred; endpoints that have never been probed
//! are used only when nothing is known to be healthy, and unhealthy ones
//! are never selected. Among the best (lowest) priority, picks rotate by
//! weight so an endpoint of weight 3 is chosen three times as often as one
//! of weight 1.

use dashmap::DashMap;

use super::types::{HealthStatus, TunnelEndpoint};

#[derive(Debug, Default)]
pub struct EndpointBalancer {
    counters: DashMap<String, u64>,
}

impl EndpointBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints to try for one request, best first.
    pub fn plan(&self, tunnel_id: &str, endpoints: &[TunnelEndpoint]) -> Vec<TunnelEndpoint> {
        let mut candidates: Vec<&TunnelEndpoint> = endpoints
            .iter()
            .filter(|e| e.health_status == HealthStatus::Healthy)
            .collect();
        if candidates.is_empty() {
            candidates = endpoints
                .iter()
                .filter(|e| e.health_status == HealthStatus::Unknown)
                .collect();
        }
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.sort_by_key(|e| e.priority);

        let best = candidates[0].priority;
        let group_len = candidates.iter().take_while(|e| e.priority == best).count();
        let start = self.pick(tunnel_id, &candidates[..group_len]);

        let mut plan = Vec::with_capacity(candidates.len());
        plan.extend(candidates[start..group_len].iter().map(|e| (*e).clone()));
        plan.extend(candidates[..start].iter().map(|e| (*e).clone()));
        plan.extend(candidates[group_len..].iter().map(|e| (*e).clone()));
        plan
    }

    /// Index into `group` chosen by weighted round-robin.
    #[allow(clippy::cast_sign_loss)]
    fn pick(&self, tunnel_id: &str, group: &[&TunnelEndpoint]) -> usize {
        if group.len() == 1 {
            return 0;
        }
        let total: u64 = group.iter().map(|e| e.weight.max(1) as u64).sum();
        let tick = {
            let mut counter = self.counters.entry(tunnel_id.to_string()).or_insert(0);
            let tick = *counter;
            *counter = counter.wrapping_add(1);
            tick
        };
        let mut slot = tick % total;
        for (i, endpoint) in group.iter().enumerate() {
            let weight = endpoint.weight.max(1) as u64;
            if slot < weight {
                return i;
            }
            slot -= weight;
        }
        0
    }

    pub fn forget(&self, tunnel_id: &str) {
        self.counters.remove(tunnel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str, priority: i64, weight: i64, health: HealthStatus) -> TunnelEndpoint {
        TunnelEndpoint {
            id: id.into(),
            tunnel_id: "t".into(),
            url: format!("http://localhost/{id}"),
            priority,
            weight,
            health_status: health,
            last_health_check_at: None,
        }
    }

    fn ids(plan: &[TunnelEndpoint]) -> Vec<&str> {
        plan.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn lowest_priority_first_and_unhealthy_skipped() {
        let balancer = EndpointBalancer::new();
        let endpoints = [
            endpoint("backup", 1, 1, HealthStatus::Healthy),
            endpoint("dead", 0, 1, HealthStatus::Unhealthy),
            endpoint("primary", 0, 1, HealthStatus::Healthy),
        ];
        assert_eq!(ids(&balancer.plan("t", &endpoints)), ["primary", "backup"]);
    }

    #[test]
    fn weighted_rotation_within_priority() {
        let balancer = EndpointBalancer::new();
        let endpoints = [
            endpoint("a", 0, 3, HealthStatus::Healthy),
            endpoint("b", 0, 1, HealthStatus::Healthy),
            endpoint("c", 5, 1, HealthStatus::Healthy),
        ];
        let firsts: Vec<String> = (0..8)
            .map(|_| balancer.plan("t", &endpoints)[0].id.clone())
            .collect();
        assert_eq!(firsts, ["a", "a", "a", "b", "a", "a", "a", "b"]);

        // The next-best endpoint follows, and lower priorities come last.
        let plan = balancer.plan("t", &endpoints);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2].id, "c");
    }

    #[test]
    fn rotation_is_per_tunnel() {
        let balancer = EndpointBalancer::new();
        let endpoints = [
            endpoint("a", 0, 1, HealthStatus::Healthy),
            endpoint("b", 0, 1, HealthStatus::Healthy),
        ];
        assert_eq!(balancer.plan("t1", &endpoints)[0].id, "a");
        assert_eq!(balancer.plan("t1", &endpoints)[0].id, "b");
        assert_eq!(balancer.plan("t2", &endpoints)[0].id, "a");
    }

    #[test]
    fn unknown_endpoints_used_only_without_healthy_ones() {
        let balancer = EndpointBalancer::new();
        let fresh = [
            endpoint("new", 0, 1, HealthStatus::Unknown),
            endpoint("dead", 0, 1, HealthStatus::Unhealthy),
        ];
        assert_eq!(ids(&balancer.plan("t", &fresh)), ["new"]);

        let mixed = [
            endpoint("new", 0, 1, HealthStatus::Unknown),
            endpoint("ok", 1, 1, HealthStatus::Healthy),
        ];
        assert_eq!(ids(&balancer.plan("t", &mixed)), ["ok"]);
    }

    #[test]
    fn nothing_usable() {
        let balancer = EndpointBalancer::new();
        assert!(balancer.plan("t", &[]).is_empty());
        let dead = [endpoint("dead", 0, 1, HealthStatus::Unhealthy)];
        assert!(balancer.plan("t", &dead).is_empty());
    }
}
