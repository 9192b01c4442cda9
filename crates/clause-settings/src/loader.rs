//! Settings loading: compiled defaults, then the JSON settings file
//! deep-merged on top, then `CLAUSE_*` environment overrides, then
//! [`ClauseSettings::validate`].

use std::path::{Path, PathBuf};

use clause_core::instance::AuthMode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{clause_home, ClauseSettings};

/// `~/.clause/settings.json`.
pub fn settings_path() -> PathBuf {
    clause_home().join("settings.json")
}

pub fn load_settings() -> Result<ClauseSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` (missing file means defaults) and apply the process
/// environment.
pub fn load_settings_from_path(path: &Path) -> Result<ClauseSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    let _ = settings.validate();
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<ClauseSettings> {
    let defaults = serde_json::to_value(ClauseSettings::default())?;
    let merged = if path.exists() {
        debug!(path = %path.display(), "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(path = %path.display(), "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key, arrays and primitives are replaced, nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CLAUSE_*` overrides read through `lookup`.
///
/// Values that fail to parse or fall out of range are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut ClauseSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("CLAUSE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("CLAUSE_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Container ───────────────────────────────────────────────────
    if let Some(v) = env.string("CLAUSE_DATA_DIR") {
        settings.container.data_dir = v;
    }
    if let Some(v) = env.string("CLAUSE_IMAGE") {
        settings.container.image = v;
    }
    if let Some(v) = env.string("CLAUSE_CONTAINER_NAME") {
        settings.container.name = v;
    }
    if let Some(v) = env.u16("CLAUSE_SWISH_PORT", 1, 65535) {
        settings.container.host_port = v;
    }
    if let Some(raw) = env.string("CLAUSE_AUTH_MODE") {
        match AuthMode::parse(&raw) {
            Some(mode) => settings.container.auth_mode = mode,
            None => warn!(key = "CLAUSE_AUTH_MODE", value = %raw, "invalid auth mode, ignoring"),
        }
    }
    if let Some(v) = env.bool("CLAUSE_PULL_IMAGE") {
        settings.container.pull_image = v;
    }

    // ── Query ───────────────────────────────────────────────────────
    if let Some(v) = env.bool("CLAUSE_AUTO_START") {
        settings.query.auto_start = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CLAUSE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing ───────────────────────────────────────────────────────────

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.string(name)?;
        let parsed = parse_u16_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid port env var, ignoring");
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            serde_json::json!({"container": {"hostPort": 3050, "image": "a"}}),
            serde_json::json!({"container": {"hostPort": 4000}}),
        );
        assert_eq!(merged["container"]["hostPort"], 4000);
        assert_eq!(merged["container"]["image"], "a");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(
            serde_json::json!({"xs": [1, 2, 3]}),
            serde_json::json!({"xs": [9]}),
        );
        assert_eq!(merged["xs"], serde_json::json!([9]));
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.server.port, 9850);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"container": {"name": "kb-swish", "authMode": "social"}, "query": {"autoStart": false}}"#,
        )
        .unwrap();
        let s = load_file_layer(&path).unwrap();
        assert_eq!(s.container.name, "kb-swish");
        assert_eq!(s.container.auth_mode, AuthMode::Social);
        assert!(!s.query.auto_start);
        assert_eq!(s.container.image, "swipl/swish:latest");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_file_layer(&path).is_err());
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = ClauseSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("CLAUSE_PORT", "9999"),
                ("CLAUSE_SWISH_PORT", "3051"),
                ("CLAUSE_AUTH_MODE", "always"),
                ("CLAUSE_PULL_IMAGE", "off"),
                ("CLAUSE_DATA_DIR", "/srv/data"),
            ]),
        );
        assert_eq!(s.server.port, 9999);
        assert_eq!(s.container.host_port, 3051);
        assert_eq!(s.container.auth_mode, AuthMode::Always);
        assert!(!s.container.pull_image);
        assert_eq!(s.container.data_dir, "/srv/data");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = ClauseSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("CLAUSE_PORT", "0"),
                ("CLAUSE_SWISH_PORT", "70000"),
                ("CLAUSE_AUTH_MODE", "root"),
                ("CLAUSE_AUTO_START", "maybe"),
                ("CLAUSE_HOST", ""),
            ]),
        );
        assert_eq!(s.server.port, 9850);
        assert_eq!(s.container.host_port, 3050);
        assert_eq!(s.container.auth_mode, AuthMode::Anon);
        assert!(s.query.auto_start);
        assert_eq!(s.server.host, "127.0.0.1");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
        assert_eq!(parse_u16_range("80", 1, 100), Some(80));
        assert_eq!(parse_u16_range("101", 1, 100), None);
        assert_eq!(parse_u16_range("-1", 1, 100), None);
    }
}
