//! Layered configuration loading: built-in defaults, optionally overridden by
//! a YAML file, finally overridden by environment variables. Mirrors the
//! deep-merge-then-resolve shape used elsewhere in this codebase for config,
//! scaled down to the flat key set the dispatcher actually needs.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub topic_root: String,
    pub sqlite_path: String,
    pub max_age_ms: i64,
    pub debounce_ms: i64,
    pub watchdog_interval_ms: u64,
    pub initial_dispatch_delay_ms: u64,
}

impl Config {
    pub fn topic_cmd(&self, node_id: i64) -> String {
        format!("{}/cmd/{}", self.topic_root, node_id)
    }

    pub fn topic_ack_wildcard(&self) -> String {
        format!("{}/ack/+", self.topic_root)
    }

    pub fn topic_evt_wildcard(&self) -> String {
        format!("{}/evt/+", self.topic_root)
    }

    pub fn topic_state_wildcard(&self) -> String {
        format!("{}/state/+", self.topic_root)
    }

    pub fn topic_vision_wildcard(&self) -> String {
        format!("{}/vision/#", self.topic_root)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: "disp-daemon".to_string(),
            topic_root: "disp".to_string(),
            sqlite_path: "disp.sqlite3".to_string(),
            max_age_ms: 10_000,
            debounce_ms: 500,
            watchdog_interval_ms: 2_000,
            initial_dispatch_delay_ms: 3_000,
        }
    }
}

/// Mirrors `Config` field-for-field but every field is optional, so a YAML
/// file only needs to specify the keys it wants to override.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileOverrides {
    broker_host: Option<String>,
    broker_port: Option<u16>,
    client_id: Option<String>,
    topic_root: Option<String>,
    sqlite_path: Option<String>,
    max_age_ms: Option<i64>,
    debounce_ms: Option<i64>,
    watchdog_interval_ms: Option<u64>,
    initial_dispatch_delay_ms: Option<u64>,
}

/// Loads configuration: defaults, then an optional YAML file at `file_path`
/// (if it exists), then environment variables (`DISP_*`), each layer
/// overriding the previous for the keys it sets. Fails fast with a
/// descriptive error if a value present in a layer can't be parsed — a bad
/// config should abort startup, not degrade silently at runtime.
pub fn load(file_path: Option<&Path>) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = file_path {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let overrides: FileOverrides = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            apply_file_overrides(&mut cfg, overrides);
        }
    }

    apply_env_overrides(&mut cfg, &env::vars().collect())?;
    Ok(cfg)
}

fn apply_file_overrides(cfg: &mut Config, o: FileOverrides) {
    if let Some(v) = o.broker_host {
        cfg.broker_host = v;
    }
    if let Some(v) = o.broker_port {
        cfg.broker_port = v;
    }
    if let Some(v) = o.client_id {
        cfg.client_id = v;
    }
    if let Some(v) = o.topic_root {
        cfg.topic_root = v;
    }
    if let Some(v) = o.sqlite_path {
        cfg.sqlite_path = v;
    }
    if let Some(v) = o.max_age_ms {
        cfg.max_age_ms = v;
    }
    if let Some(v) = o.debounce_ms {
        cfg.debounce_ms = v;
    }
    if let Some(v) = o.watchdog_interval_ms {
        cfg.watchdog_interval_ms = v;
    }
    if let Some(v) = o.initial_dispatch_delay_ms {
        cfg.initial_dispatch_delay_ms = v;
    }
}

fn apply_env_overrides(cfg: &mut Config, vars: &HashMap<String, String>) -> Result<()> {
    if let Some(v) = vars.get("DISP_BROKER_HOST") {
        cfg.broker_host = v.clone();
    }
    if let Some(v) = vars.get("DISP_BROKER_PORT") {
        cfg.broker_port = v
            .parse()
            .with_context(|| format!("DISP_BROKER_PORT={v:?} is not a valid port"))?;
    }
    if let Some(v) = vars.get("DISP_CLIENT_ID") {
        cfg.client_id = v.clone();
    }
    if let Some(v) = vars.get("DISP_TOPIC_ROOT") {
        cfg.topic_root = v.clone();
    }
    if let Some(v) = vars.get("DISP_SQLITE_PATH") {
        cfg.sqlite_path = v.clone();
    }
    if let Some(v) = vars.get("DISP_MAX_AGE_MS") {
        cfg.max_age_ms = v
            .parse()
            .with_context(|| format!("DISP_MAX_AGE_MS={v:?} is not an integer"))?;
    }
    if let Some(v) = vars.get("DISP_DEBOUNCE_MS") {
        cfg.debounce_ms = v
            .parse()
            .with_context(|| format!("DISP_DEBOUNCE_MS={v:?} is not an integer"))?;
    }
    if let Some(v) = vars.get("DISP_WATCHDOG_INTERVAL_MS") {
        cfg.watchdog_interval_ms = v
            .parse()
            .with_context(|| format!("DISP_WATCHDOG_INTERVAL_MS={v:?} is not an integer"))?;
    }
    if let Some(v) = vars.get("DISP_INITIAL_DISPATCH_DELAY_MS") {
        cfg.initial_dispatch_delay_ms = v
            .parse()
            .with_context(|| format!("DISP_INITIAL_DISPATCH_DELAY_MS={v:?} is not an integer"))?;
    }

    if cfg.broker_host.trim().is_empty() {
        bail!("broker_host must not be empty");
    }
    Ok(())
}
