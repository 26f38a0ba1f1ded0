//! Ordered exemption rules evaluated before any rate limit.
//!
//! Rules are checked in registration order and the first rule whose
//! predicate matches decides the outcome, even when that outcome is "no
//! exemption" because the user's exemption quota for the rule is spent.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::limiter::RequestContext;
use crate::glob::GlobPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExemptionType {
    /// Every matching request is exempt.
    Unconditional,
    /// Matching requests are exempt until the per-user quota is spent.
    Quota,
}

impl ExemptionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unconditional => "unconditional",
            Self::Quota => "quota",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExemptionRule {
    pub id: String,
    pub name: String,
    pub path_patterns: Vec<String>,
    #[serde(default)]
    pub required_role: Option<String>,
    pub exemption_type: ExemptionType,
    /// Exemptions granted per user per quota window (quota rules only).
    #[serde(default)]
    pub quota_per_user: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub builtin: bool,
}

const fn default_enabled() -> bool {
    true
}

impl ExemptionRule {
    fn builtin(id: &str, name: &str, patterns: &[&str], required_role: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            path_patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
            required_role: required_role.map(str::to_string),
            exemption_type: ExemptionType::Unconditional,
            quota_per_user: None,
            enabled: true,
            builtin: true,
        }
    }

    /// Rules installed at startup: health checks, authentication and
    /// admin-role requests to admin paths.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::builtin("health-check", "Health check endpoints", &["/health*"], None),
            Self::builtin("authentication", "Authentication endpoints", &["/auth/*"], None),
            Self::builtin(
                "admin-operations",
                "Admin operations",
                &["/admin/*", "/rate-limit-metrics/*", "/rate-limit-exemptions*"],
                Some("admin"),
            ),
        ]
    }
}

/// Why a request was exempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExemptionGrant {
    pub rule_id: String,
    pub rule_name: String,
    pub exemption_type: ExemptionType,
    /// Exemptions left in the current quota window (quota rules only).
    pub remaining: Option<u32>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExemptionError {
    #[error("Exemption rule not found: {0}")]
    NotFound(String),

    #[error("Exemption rule already exists: {0}")]
    Duplicate(String),

    #[error("Built-in exemption rule cannot be deleted: {0}")]
    BuiltIn(String),

    #[error("Invalid exemption rule: {0}")]
    Invalid(String),
}

#[derive(Debug)]
struct CompiledRule {
    rule: ExemptionRule,
    patterns: Vec<GlobPattern>,
}

impl CompiledRule {
    fn compile(rule: ExemptionRule) -> Result<Self, ExemptionError> {
        if rule.id.trim().is_empty() {
            return Err(ExemptionError::Invalid("id must not be empty".into()));
        }
        if rule.path_patterns.is_empty() {
            return Err(ExemptionError::Invalid(
                "at least one path pattern is required".into(),
            ));
        }
        if rule.exemption_type == ExemptionType::Quota && rule.quota_per_user.is_none() {
            return Err(ExemptionError::Invalid(
                "quota rules require quotaPerUser".into(),
            ));
        }
        let patterns = rule
            .path_patterns
            .iter()
            .map(|p| GlobPattern::new(p).map_err(|e| ExemptionError::Invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rule, patterns })
    }

    fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.rule.enabled {
            return false;
        }
        if let Some(required) = &self.rule.required_role {
            if ctx.role.as_deref() != Some(required.as_str()) {
                return false;
            }
        }
        self.patterns.iter().any(|p| p.matches(&ctx.path))
    }
}

#[derive(Debug, Clone, Copy)]
struct QuotaUsage {
    window_start: i64,
    count: u32,
}

/// Ordered rule set plus per-user exemption quota counters.
#[derive(Debug)]
pub struct ExemptionEngine {
    rules: RwLock<Vec<CompiledRule>>,
    usage: DashMap<(String, String), QuotaUsage>,
    quota_window_ms: i64,
}

impl ExemptionEngine {
    pub fn new(quota_window_ms: i64) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            usage: DashMap::new(),
            quota_window_ms,
        }
    }

    pub fn with_default_rules(quota_window_ms: i64) -> Self {
        let engine = Self::new(quota_window_ms);
        for rule in ExemptionRule::defaults() {
            // Built-in rules are static and always compile.
            if let Ok(compiled) = CompiledRule::compile(rule) {
                engine.write_rules().push(compiled);
            }
        }
        engine
    }

    /// Decide whether `ctx` is exempt. Consumes one unit of exemption quota
    /// when a quota rule grants.
    pub fn evaluate(&self, ctx: &RequestContext, now: i64) -> Option<ExemptionGrant> {
        let rules = self.read_rules();
        let rule = &rules.iter().find(|r| r.matches(ctx))?.rule;

        let remaining = match rule.exemption_type {
            ExemptionType::Unconditional => None,
            ExemptionType::Quota => {
                let max = rule.quota_per_user.unwrap_or(0);
                let mut usage = self
                    .usage
                    .entry((rule.id.clone(), ctx.subject_key()))
                    .or_insert(QuotaUsage {
                        window_start: now,
                        count: 0,
                    });
                if now - usage.window_start >= self.quota_window_ms {
                    *usage = QuotaUsage {
                        window_start: now,
                        count: 0,
                    };
                }
                if usage.count >= max {
                    return None;
                }
                usage.count += 1;
                Some(max - usage.count)
            }
        };

        Some(ExemptionGrant {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            exemption_type: rule.exemption_type,
            remaining,
        })
    }

    /// Append a rule; it is evaluated after all existing rules.
    pub fn add_rule(&self, rule: ExemptionRule) -> Result<ExemptionRule, ExemptionError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut rules = self.write_rules();
        if rules.iter().any(|r| r.rule.id == compiled.rule.id) {
            return Err(ExemptionError::Duplicate(compiled.rule.id));
        }
        let stored = compiled.rule.clone();
        rules.push(compiled);
        Ok(stored)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ExemptionRule, ExemptionError> {
        let mut rules = self.write_rules();
        let rule = rules
            .iter_mut()
            .find(|r| r.rule.id == id)
            .ok_or_else(|| ExemptionError::NotFound(id.to_string()))?;
        rule.rule.enabled = enabled;
        Ok(rule.rule.clone())
    }

    pub fn remove_rule(&self, id: &str) -> Result<(), ExemptionError> {
        let mut rules = self.write_rules();
        let index = rules
            .iter()
            .position(|r| r.rule.id == id)
            .ok_or_else(|| ExemptionError::NotFound(id.to_string()))?;
        if rules[index].rule.builtin {
            return Err(ExemptionError::BuiltIn(id.to_string()));
        }
        rules.remove(index);
        drop(rules);
        self.usage.retain(|(rule_id, _), _| rule_id != id);
        Ok(())
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> Vec<ExemptionRule> {
        self.read_rules().iter().map(|r| r.rule.clone()).collect()
    }

    /// Drop quota counters whose window has elapsed.
    pub fn prune(&self, now: i64) {
        self.usage
            .retain(|_, u| now - u.window_start < self.quota_window_ms);
    }

    fn read_rules(&self) -> RwLockReadGuard<'_, Vec<CompiledRule>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rules(&self) -> RwLockWriteGuard<'_, Vec<CompiledRule>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}
