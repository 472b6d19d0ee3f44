use crate::config::Config;
use crate::utils::{atomic_write, get_meao_home};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const ENV_PREFIX: &str = "MEAO_";

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_meao_home()?.join("config.json"))
}

/// Load configuration: file (if present) → env overrides → credentials →
/// validation. A missing file yields the defaults, still env-overridable.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    let mut data: Value = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        check_file_permissions(path);
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?
    } else {
        serde_json::to_value(Config::default())?
    };

    apply_env_overrides(&mut data);

    let mut config: Config =
        serde_json::from_value(data).with_context(|| "Failed to deserialize config")?;

    crate::config::credentials::apply(&mut config)?;

    config
        .validate()
        .map_err(crate::errors::MeaoError::Config)
        .with_context(|| "Configuration validation failed")?;

    Ok(config)
}

pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let default_path = get_config_path()?;
    let path = config_path.unwrap_or(default_path.as_path());
    let content = serde_json::to_string_pretty(config)?;
    atomic_write(path, &content)
}

/// Apply `MEAO_<SECTION>_<FIELD>` environment overrides onto the raw JSON
/// value. A single underscore separates the section from the field; double
/// underscores descend one nesting level deeper. Key matching is
/// case-insensitive and underscore-insensitive, so `MEAO_AGENT_MAX_TOOL_CALLS_PER_TURN`
/// reaches `agent.maxToolCallsPerTurn`.
///
/// Credential variables (`MEAO_*_API_KEY`, `MEAO_*_TOKEN`) are reserved for
/// the credentials layer and skipped here.
fn apply_env_overrides(data: &mut Value) {
    for (key, raw) in std::env::vars() {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if rest == "HOME" || rest.ends_with("_API_KEY") || rest.ends_with("_TOKEN") {
            continue;
        }

        let segments: Vec<&str> = rest.split("__").collect();
        // First segment carries "SECTION_FIELD..."; later segments are one
        // path component each.
        let Some((section, field)) = segments[0].split_once('_') else {
            continue;
        };
        let mut path: Vec<String> = vec![section.to_string(), field.to_string()];
        path.extend(segments[1..].iter().map(|s| (*s).to_string()));

        if set_path(data, &path, coerce(&raw)) {
            tracing::debug!("config override from env: {}", key);
        } else {
            warn!("config override {} does not match any config path", key);
        }
    }
}

/// Normalize a key for matching: lowercase, underscores removed.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Walk `data` along `path` (normalized-key matching) and set the leaf.
/// Returns false when an intermediate segment does not resolve to an object key.
fn set_path(data: &mut Value, path: &[String], new_value: Value) -> bool {
    let mut current = data;
    for (i, segment) in path.iter().enumerate() {
        let Value::Object(map) = current else {
            return false;
        };
        let want = normalize_key(segment);
        let Some(actual) = map.keys().find(|k| normalize_key(k) == want).cloned() else {
            return false;
        };
        if i == path.len() - 1 {
            map.insert(actual, new_value);
            return true;
        }
        current = map.get_mut(&actual).expect("key found above");
    }
    false
}

/// Coerce an env string into a typed JSON value:
/// `true`/`false` → bool, integer and float literals → numbers, JSON
/// objects/arrays parse as-is, everything else stays a string.
fn coerce(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if raw.parse::<f64>().is_ok() && raw.contains('.') {
        if let Some(n) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Value::Number(n);
        }
    }
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Value>(raw) {
            return v;
        }
    }
    Value::String(raw.to_string())
}

/// Warn if the config file has overly permissive permissions.
#[cfg(unix)]
fn check_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "config file {} has permissions {:o} — recommend 0600",
                path.display(),
                mode & 0o777
            );
        }
    }
}

#[cfg(not(unix))]
fn check_file_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_booleans() {
        assert_eq!(coerce("true"), Value::Bool(true));
        assert_eq!(coerce("false"), Value::Bool(false));
    }

    #[test]
    fn coerce_integers_and_floats() {
        assert_eq!(coerce("42"), Value::from(42));
        assert_eq!(coerce("-7"), Value::from(-7));
        assert_eq!(coerce("1.5"), Value::from(1.5));
    }

    #[test]
    fn coerce_json_structures() {
        assert_eq!(coerce(r#"["a","b"]"#), serde_json::json!(["a", "b"]));
        assert_eq!(coerce(r#"{"k":1}"#), serde_json::json!({"k": 1}));
    }

    #[test]
    fn coerce_fallback_string() {
        assert_eq!(coerce("hello"), Value::String("hello".to_string()));
        // Unparseable JSON stays a string
        assert_eq!(coerce("{oops"), Value::String("{oops".to_string()));
    }

    #[test]
    fn set_path_matches_camel_case() {
        let mut data = serde_json::to_value(Config::default()).unwrap();
        let ok = set_path(
            &mut data,
            &["agent".into(), "max_tool_calls_per_turn".into()],
            Value::from(5),
        );
        assert!(ok);
        assert_eq!(data["agent"]["maxToolCallsPerTurn"], Value::from(5));
    }

    #[test]
    fn set_path_unknown_key_fails() {
        let mut data = serde_json::to_value(Config::default()).unwrap();
        let ok = set_path(
            &mut data,
            &["agent".into(), "nonexistent".into()],
            Value::from(5),
        );
        assert!(!ok);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.agent.max_tool_calls_per_turn, 25);
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"agent": {"maxToolCallsPerTurn": 7}}"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.agent.max_tool_calls_per_turn, 7);
        assert_eq!(config.session.max_messages, 200);
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.agent.max_tool_calls_per_turn = 11;
        save_config(&config, Some(&path)).unwrap();
        let back = load_config(Some(&path)).unwrap();
        assert_eq!(back.agent.max_tool_calls_per_turn, 11);
    }
}
