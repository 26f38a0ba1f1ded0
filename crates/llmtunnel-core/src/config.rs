//! JSON configuration loading.
//!
//! Configuration structs are plain serde types whose sections carry
//! `#[serde(default)]`, so a partial file merges over the built-in defaults
//! in one place. Resolution order:
//! 1. Built-in defaults
//! 2. Global config (`~/.config/llmtunnel/relay.json`)
//! 3. Explicit config file (`--config`)

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Load configuration, falling back to defaults when no file is present.
///
/// An explicit path that does not exist is an error; a missing global file is
/// not.
pub fn load_config<T>(explicit: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        return load_config_file(path);
    }

    if let Some(global) = global_config_path() {
        if global.exists() {
            return load_config_file(&global);
        }
    }

    Ok(T::default())
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("relay.json"))
}

/// Default location for the relay database.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("relay.db"))
}

fn config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("llmtunnel"))
}

fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        interval_secs: u64,
        name: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                interval_secs: 30,
                name: "relay".into(),
            }
        }
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"interval_secs": 5}"#).unwrap();

        let cfg: Sample = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.interval_secs, 5);
        assert_eq!(cfg.name, "relay");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config::<Sample>(Some(Path::new("/nonexistent/relay.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config::<Sample>(Some(&path)).is_err());
    }
}
