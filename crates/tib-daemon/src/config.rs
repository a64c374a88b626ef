//! Layered YAML configuration: later files override earlier ones via
//! deep-merge, then the merged result is canonicalized and SHA-256-hashed
//! for provenance logging.

use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use tib_core::gps::GpsFilterConfig;
use tib_core::retention::RetentionConfig;
use tib_core::router::EventsPolicyConfig as RouterEventsConfig;
use tib_core::watchdog::WatchdogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    pub topic_gps: String,
    pub topic_decoded: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
}

fn default_pool_min() -> u32 {
    1
}
fn default_pool_max() -> u32 {
    10
}

impl PostgresConfig {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPolicyConfig {
    #[serde(default)]
    pub default_tolerance: f64,
    #[serde(default)]
    pub default_min_interval_sec: i64,
    #[serde(default)]
    pub default_heartbeat_sec: i64,
    #[serde(default)]
    pub kpi_addrs: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_op_timeout_sec")]
    pub op_timeout_sec: u64,
    #[serde(default = "default_op_retries")]
    pub op_retries: u32,
    /// Backpressure policy when a partition queue is full. `false` (default)
    /// blocks the broker poll loop until room frees up — the spec's
    /// preferred at-least-once-safe mode. `true` drops the oldest queued
    /// message instead, counted and logged, never silent.
    #[serde(default)]
    pub drop_oldest_when_full: bool,
}

fn default_queue_max() -> usize {
    10_000
}
fn default_worker_count() -> usize {
    1
}
fn default_op_timeout_sec() -> u64 {
    10
}
fn default_op_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// Maps 1:1 onto the `events_policy` config table: it governs both the
/// watchdog's offline/stale thresholds and the router's derived-event
/// toggles, so the two `tib-core` configs it feeds are built from one
/// section here rather than split across two YAML tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsPolicySection {
    pub router_offline_sec: i64,
    pub stale_register_sec: i64,
    pub enable_gps_reject_events: bool,
    pub enable_unknown_register_events: bool,
    pub gps_reject_event_throttle_sec: i64,
}

impl Default for EventsPolicySection {
    fn default() -> Self {
        let watchdog_defaults = WatchdogConfig::default();
        let router_defaults = RouterEventsConfig::default();
        Self {
            router_offline_sec: watchdog_defaults.router_offline_sec,
            stale_register_sec: watchdog_defaults.stale_register_sec,
            enable_gps_reject_events: router_defaults.enable_gps_reject_events,
            enable_unknown_register_events: router_defaults.enable_unknown_register_events,
            gps_reject_event_throttle_sec: router_defaults.gps_reject_event_throttle_sec,
        }
    }
}

impl EventsPolicySection {
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            router_offline_sec: self.router_offline_sec,
            stale_register_sec: self.stale_register_sec,
            ..WatchdogConfig::default()
        }
    }

    pub fn router_events_config(&self) -> RouterEventsConfig {
        RouterEventsConfig {
            enable_gps_reject_events: self.enable_gps_reject_events,
            enable_unknown_register_events: self.enable_unknown_register_events,
            gps_reject_event_throttle_sec: self.gps_reject_event_throttle_sec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub gps_filter: GpsFilterConfig,
    #[serde(default)]
    pub history_policy: HistoryPolicyConfig,
    #[serde(default)]
    pub events_policy: EventsPolicySection,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for HistoryPolicyConfig {
    fn default() -> Self {
        Self {
            default_tolerance: 0.5,
            default_min_interval_sec: 10,
            default_heartbeat_sec: 300,
            kpi_addrs: Vec::new(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_max: default_queue_max(),
            worker_count: default_worker_count(),
            op_timeout_sec: default_op_timeout_sec(),
            op_retries: default_op_retries(),
            drop_oldest_when_full: false,
        }
    }
}

/// Result of loading and deep-merging a layered config: the typed config
/// plus a canonical hash so two daemons running the same effective config
/// can prove it in logs/audit trails.
pub struct LoadedConfig {
    pub config: AppConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value = serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    let config: AppConfig = serde_json::from_str(&canonical).context("config does not match expected schema")?;

    Ok(LoadedConfig {
        config,
        canonical_json: canonical,
        config_hash,
    })
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let base = write_temp(
            r#"
mqtt:
  host: broker.local
  port: 1883
  topic_gps: "cg/v1/telemetry/SN/+"
  topic_decoded: "cg/v1/decoded/SN/+/pcc/+"
postgres:
  host: localhost
  port: 5432
  database: tib
  user: tib
  password: tib
"#,
        );
        let override_file = write_temp(
            r#"
mqtt:
  host: broker.prod.internal
"#,
        );

        let loaded = load_layered_yaml(&[base.path().to_str().unwrap(), override_file.path().to_str().unwrap()]).unwrap();
        assert_eq!(loaded.config.mqtt.host, "broker.prod.internal");
        assert_eq!(loaded.config.mqtt.port, 1883);
        assert_eq!(loaded.config_hash.len(), 64);
    }

    #[test]
    fn defaults_fill_in_unspecified_sections() {
        let base = write_temp(
            r#"
mqtt:
  host: broker.local
  port: 1883
  topic_gps: "cg/v1/telemetry/SN/+"
  topic_decoded: "cg/v1/decoded/SN/+/pcc/+"
postgres:
  host: localhost
  port: 5432
  database: tib
  user: tib
  password: tib
"#,
        );
        let loaded = load_layered_yaml(&[base.path().to_str().unwrap()]).unwrap();
        assert_eq!(loaded.config.gps_filter.sats_min, 4);
        assert_eq!(loaded.config.retention.gps_raw_hours, 72);
        assert!(loaded.config.events_policy.enable_gps_reject_events);
    }
}
