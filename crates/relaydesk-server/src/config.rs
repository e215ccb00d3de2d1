//! Server settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with [`ServerSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RELAYDESK_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runtime configuration for the relay server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    /// Port to bind (0 for auto-assign).
    pub port: u16,
    pub db_path: PathBuf,
    /// Per-connection outbound queue depth. Frames beyond it are dropped.
    pub max_send_queue: usize,
    /// Upper bound on a single socket write before the connection is dropped.
    pub delivery_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Connections silent for this long are unregistered.
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Close participants' connections after the terminal frame of `end`.
    pub close_connections_on_end: bool,
    /// Reply used when no assistant is wired in, or the assistant fails.
    pub assistant_fallback_reply: String,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let base = relaydesk_home();
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            db_path: base.join("database").join("relaydesk.db"),
            max_send_queue: 256,
            delivery_timeout_ms: 2_000,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            close_connections_on_end: true,
            assistant_fallback_reply:
                "Thanks for your message. An agent will be with you shortly.".into(),
            log_to_sqlite: true,
            log_db_path: base.join("database").join("logs.db"),
        }
    }
}

impl ServerSettings {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn relaydesk_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relaydesk")
}

/// Default settings file (`~/.relaydesk/settings.json`).
pub fn settings_path() -> PathBuf {
    relaydesk_home().join("settings.json")
}

/// Load settings from `path` (missing file means defaults), then apply
/// process environment overrides.
pub fn load_settings_from_path(path: &Path) -> Result<ServerSettings, SettingsError> {
    let defaults = serde_json::to_value(ServerSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ServerSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Recursive merge: objects merge per key, everything else is replaced,
/// nulls in `source` are skipped.
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

/// Apply overrides read through `lookup`. Invalid values are logged and
/// ignored. `PORT` is honored for platforms that inject it.
pub fn apply_env_overrides(settings: &mut ServerSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAYDESK_HOST") {
        settings.host = v;
    }
    for name in ["PORT", "RELAYDESK_PORT"] {
        if let Some(raw) = read(name) {
            match parse_u16_range(&raw, 0, 65535) {
                Some(port) => settings.port = port,
                None => warn!(key = name, value = %raw, "invalid port env var, ignoring"),
            }
        }
    }
    if let Some(v) = read("RELAYDESK_DB_PATH") {
        settings.db_path = PathBuf::from(v);
    }
    if let Some(raw) = read("RELAYDESK_CLOSE_ON_END") {
        match parse_bool(&raw) {
            Some(b) => settings.close_connections_on_end = b,
            None => warn!(key = "RELAYDESK_CLOSE_ON_END", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(raw) = read("RELAYDESK_LOG_TO_SQLITE") {
        match parse_bool(&raw) {
            Some(b) => settings.log_to_sqlite = b,
            None => warn!(key = "RELAYDESK_LOG_TO_SQLITE", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
}

pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
