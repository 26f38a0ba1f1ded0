//! Per-tunnel configuration and partial updates.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const MAX_CONNECTIONS_RANGE: std::ops::RangeInclusive<i64> = 1..=10_000;
const TIMEOUT_MS_RANGE: std::ops::RangeInclusive<i64> = 1_000..=300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub max_connections: u32,
    pub timeout_ms: u64,
    pub compression_enabled: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            compression_enabled: false,
        }
    }
}

/// A partial configuration. Absent fields keep their current value.
///
/// Numeric fields are wide signed integers so out-of-range input reaches
/// validation instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_enabled: Option<bool>,
}

/// Every field-level problem found in a patch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .0.join("; "))]
pub struct ConfigValidationError(pub Vec<String>);

impl TunnelConfigPatch {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut errors = Vec::new();
        if let Some(v) = self.max_connections {
            if !MAX_CONNECTIONS_RANGE.contains(&v) {
                errors.push("maxConnections must be between 1 and 10000".to_string());
            }
        }
        if let Some(v) = self.timeout_ms {
            if !TIMEOUT_MS_RANGE.contains(&v) {
                errors.push("timeoutMs must be between 1000 and 300000".to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError(errors))
        }
    }
}

impl TunnelConfig {
    /// Validate `patch` and apply it on top of `self`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn apply(self, patch: &TunnelConfigPatch) -> Result<Self, ConfigValidationError> {
        patch.validate()?;
        Ok(Self {
            max_connections: patch
                .max_connections
                .map_or(self.max_connections, |v| v as u32),
            timeout_ms: patch.timeout_ms.map_or(self.timeout_ms, |v| v as u64),
            compression_enabled: patch
                .compression_enabled
                .unwrap_or(self.compression_enabled),
        })
    }

    /// Decode stored JSON, filling absent fields with defaults.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_stored(json: &str) -> Result<Self, serde_json::Error> {
        let stored: TunnelConfigPatch = serde_json::from_str(json)?;
        let defaults = Self::default();
        Ok(Self {
            max_connections: stored
                .max_connections
                .filter(|v| MAX_CONNECTIONS_RANGE.contains(v))
                .map_or(defaults.max_connections, |v| v as u32),
            timeout_ms: stored
                .timeout_ms
                .filter(|v| TIMEOUT_MS_RANGE.contains(v))
                .map_or(defaults.timeout_ms, |v| v as u64),
            compression_enabled: stored
                .compression_enabled
                .unwrap_or(defaults.compression_enabled),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.timeout_ms, 30_000);
        assert!(!config.compression_enabled);
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let patch = TunnelConfigPatch {
            timeout_ms: Some(5_000),
            ..Default::default()
        };
        let config = TunnelConfig::default().apply(&patch).unwrap();
        assert_eq!(config.timeout_ms, 5_000);
        assert_eq!(config.max_connections, 100);
    }

    #[test]
    fn out_of_range_values_are_reported_together() {
        let patch: TunnelConfigPatch =
            serde_json::from_str(r#"{"maxConnections":0,"timeoutMs":500}"#).unwrap();
        let err = TunnelConfig::default().apply(&patch).unwrap_err();
        assert_eq!(
            err.0,
            vec![
                "maxConnections must be between 1 and 10000".to_string(),
                "timeoutMs must be between 1000 and 300000".to_string(),
            ]
        );
    }

    #[test]
    fn boundaries_are_inclusive() {
        let patch = TunnelConfigPatch {
            max_connections: Some(10_000),
            timeout_ms: Some(300_000),
            compression_enabled: Some(true),
        };
        let config = TunnelConfig::default().apply(&patch).unwrap();
        assert_eq!(config.max_connections, 10_000);
        assert!(config.compression_enabled);

        let negative = TunnelConfigPatch {
            max_connections: Some(-1),
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn stored_partial_config_gets_defaults_on_read() {
        let config = TunnelConfig::from_stored(r#"{"compressionEnabled":true}"#).unwrap();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.timeout_ms, 30_000);
        assert!(config.compression_enabled);

        assert_eq!(TunnelConfig::from_stored("{}").unwrap(), TunnelConfig::default());
    }
}
