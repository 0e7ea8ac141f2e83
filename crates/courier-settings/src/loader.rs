//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{courier_home, CourierSettings};

/// Resolve the path to the settings file (`~/.courier/settings.json`).
pub fn settings_path() -> PathBuf {
    courier_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides, then validate.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CourierSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COURIER_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are ignored with a warning.
pub fn apply_env_overrides<F>(settings: &mut CourierSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("COURIER_DB_PATH") {
        settings.database.path = PathBuf::from(v);
    }

    if let Some(v) = env.u64("COURIER_WINDOW_HOURS", 1, 24 * 30) {
        settings.compliance.window_hours = v as u32;
    }
    if let Some(v) = env.u64("COURIER_EXPIRING_SOON_MINUTES", 1, 24 * 60) {
        settings.compliance.expiring_soon_minutes = v as u32;
    }

    if let Some(v) = env.u64("COURIER_MAX_ATTEMPTS", 1, 100) {
        settings.queue.max_attempts = v as u32;
    }
    if let Some(v) = env.u64("COURIER_RETENTION_DAYS", 1, 3_650) {
        settings.queue.retention_days = v as u32;
    }
    if let Some(v) = env.u64("COURIER_SEND_TIMEOUT_MS", 100, 300_000) {
        settings.queue.send_timeout_ms = v;
    }
    if let Some(v) = env.u64("COURIER_CLAIM_LEASE_MS", 1_000, 3_600_000) {
        settings.queue.claim_lease_ms = v;
    }

    if let Some(v) = env.u64("COURIER_HOURLY_INTERVAL_SECS", 1, 86_400) {
        settings.reconciler.hourly_interval_secs = v;
    }
    if let Some(v) = env.u64("COURIER_EXPRESS_INTERVAL_SECS", 1, 86_400) {
        settings.reconciler.express_interval_secs = v;
    }
    if let Some(v) = env.u64("COURIER_CLEANUP_INTERVAL_SECS", 1, 7 * 86_400) {
        settings.reconciler.cleanup_interval_secs = v;
    }
    if let Some(v) = env.bool("COURIER_DRAIN_ON_RENEW") {
        settings.reconciler.drain_on_renew = v;
    }

    if let Some(v) = env.string("COURIER_WEBHOOK_URL") {
        settings.transport.webhook_url = Some(v);
    }
    if let Some(v) = env.string("COURIER_WEBHOOK_TOKEN") {
        settings.transport.auth_token = Some(v);
    }

    if let Some(v) = env.string("COURIER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("COURIER_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64("COURIER_SHUTDOWN_TIMEOUT_SECS", 1, 3_600) {
        settings.server.shutdown_timeout_secs = v;
    }

    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("COURIER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, min, max, "invalid numeric env var, ignoring");
        }
        result
    }
}
