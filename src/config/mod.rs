//! Configuration loading.
//!
//! The gateway reads a single JSON config file into a `serde_json::Value`;
//! sections are picked apart by the subsystems that own them (`gateway.auth`,
//! `gateway.nodes`, `agents.*`). Missing file means empty config.

use serde_json::Value;
use std::env;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("failed to parse JSON at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Get the state directory.
/// Priority: CLAWDBOT_STATE_DIR > ~/.clawdbot
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("CLAWDBOT_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    home_dir().join(".clawdbot")
}

/// Get the config file path.
/// Priority: CLAWDBOT_CONFIG_PATH > <state dir>/clawdbot.json
pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("CLAWDBOT_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    state_dir().join("clawdbot.json")
}

fn home_dir() -> PathBuf {
    #[cfg(unix)]
    let var = "HOME";
    #[cfg(windows)]
    let var = "USERPROFILE";
    env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load the config file. A missing file yields an empty object so the
/// gateway can start with defaults.
pub fn load_config() -> Result<Value, ConfigError> {
    let path = config_path();
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let text = fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Walk a dotted key path through a config value.
pub fn get_path<'a>(cfg: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = cfg;
    for part in dotted.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_walks_nested_objects() {
        let cfg = json!({ "gateway": { "auth": { "mode": "token" } } });
        assert_eq!(
            get_path(&cfg, "gateway.auth.mode").and_then(|v| v.as_str()),
            Some("token")
        );
        assert!(get_path(&cfg, "gateway.auth.missing").is_none());
        assert!(get_path(&cfg, "nope").is_none());
    }

    #[test]
    fn test_config_path_defaults_under_state_dir() {
        if env::var("CLAWDBOT_CONFIG_PATH").is_err() {
            assert!(config_path().ends_with("clawdbot.json"));
        }
    }
}
