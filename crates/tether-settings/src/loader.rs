//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::TetherSettings;

/// Resolve the default settings file path (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid value is an
/// error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_overrides_from(
    settings: &mut TetherSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("TETHER_PORT") {
        match v.parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(_) => warn!(key = "TETHER_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("TETHER_LIVENESS_TIMEOUT_MS") {
        match parse_u64_range(&v, 100, 3_600_000) {
            Some(ms) => settings.liveness.timeout_ms = ms,
            None => warn!(
                key = "TETHER_LIVENESS_TIMEOUT_MS",
                value = %v,
                "invalid u64 env var, ignoring"
            ),
        }
    }
    if let Some(v) = read("TETHER_REAP_INTERVAL_MS") {
        match parse_u64_range(&v, 100, 3_600_000) {
            Some(ms) => settings.liveness.reap_interval_ms = ms,
            None => warn!(
                key = "TETHER_REAP_INTERVAL_MS",
                value = %v,
                "invalid u64 env var, ignoring"
            ),
        }
    }
    if let Some(v) = read("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("TETHER_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn!(key = "TETHER_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use serde_json::json;
    use std::collections::HashMap;
    use tether_core::ErrorKind;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn deep_merge_objects_recursively() {
        let a = json!({"server": {"host": "h", "port": 1}});
        let b = json!({"server": {"port": 2}});
        let merged = deep_merge(a, b);
        assert_eq!(merged["server"]["host"], "h");
        assert_eq!(merged["server"]["port"], 2);
    }

    #[test]
    fn deep_merge_skips_null_and_replaces_arrays() {
        let a = json!({"x": 1, "list": [1, 2, 3]});
        let b = json!({"x": null, "list": [9]});
        let merged = deep_merge(a, b);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["list"], json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.server.port, TetherSettings::default().server.port);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "server": {"port": 9001},
                "liveness": {"timeoutMs": 45000},
                "retry": {"policies": {"llm": {"maxAttempts": 5, "retryableErrors": ["timeout"]}}}
            }"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.liveness.timeout_ms, 45_000);
        assert_eq!(settings.liveness.reap_interval_ms, 30_000);
        let llm = &settings.retry.policies["llm"];
        assert_eq!(llm.max_attempts, Some(5));
        assert_eq!(llm.retryable_errors, Some(vec![ErrorKind::Timeout]));
        assert!(llm.base_delay_ms.is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn zero_timeout_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"liveness": {"timeoutMs": 0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = TetherSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("TETHER_HOST", "127.0.0.1"),
                ("TETHER_PORT", "9999"),
                ("TETHER_LIVENESS_TIMEOUT_MS", "5000"),
                ("TETHER_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9999);
        assert_eq!(settings.liveness.timeout_ms, 5000);
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut settings = TetherSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("TETHER_PORT", "not-a-port"),
                ("TETHER_REAP_INTERVAL_MS", "5"),
                ("TETHER_LOG_JSON", "maybe"),
                ("TETHER_HOST", ""),
            ]),
        );
        let defaults = TetherSettings::default();
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(settings.server.host, defaults.server.host);
        assert_eq!(settings.liveness.reap_interval_ms, 30_000);
        assert!(!settings.logging.json);
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("100", 100, 200), Some(100));
        assert_eq!(parse_u64_range("201", 100, 200), None);
        assert_eq!(parse_u64_range("-1", 0, 200), None);
    }
}
