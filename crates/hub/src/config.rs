//! TOML config file loading, environment overrides and validation.
//!
//! Every field has a default, so the hub can start without a config file.
//! Environment variables win over the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub liveness: LivenessConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub telemetry_topic: String,
    pub command_topic: String,
    pub keep_alive_secs: u64,
    pub publish_timeout_secs: u64,
    /// Capacity of the queue between the transport loop and ingestion.
    pub queue_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "smartfarm-hub".into(),
            username: None,
            password: None,
            telemetry_topic: "smartfarm/data".into(),
            command_topic: "smartfarm/cmd".into(),
            keep_alive_secs: 60,
            publish_timeout_secs: 5,
            queue_capacity: 64,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub op_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:smartfarm.db?mode=rwc".into(),
            max_connections: 5,
            op_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// A device whose newest reading is at least this old is OFFLINE.
    pub offline_after_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            offline_after_secs: 30,
        }
    }
}

impl LivenessConfig {
    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub model_path: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: "ml_models/model.json".into(),
        }
    }
}

/// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply overrides from `lookup` (normally `std::env::var`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT is not a valid port: {v:?}"))?;
        }
        if let Some(v) = lookup("MQTT_USER") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup("MQTT_TOPIC_DATA") {
            self.mqtt.telemetry_topic = v;
        }
        if let Some(v) = lookup("MQTT_TOPIC_CMD") {
            self.mqtt.command_topic = v;
        }
        if let Some(v) = lookup("DB_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = v
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a valid port: {v:?}"))?;
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.classifier.model_path = v;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_database(&mut errors);

        if self.liveness.offline_after_secs == 0 {
            errors.push("liveness: offline_after_secs must be positive".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt: password given without username".into());
        }

        // ── Topics ──────────────────────────────────────────
        if m.telemetry_topic.trim().is_empty() {
            errors.push("mqtt: telemetry_topic is empty".into());
        }
        if m.command_topic.trim().is_empty() {
            errors.push("mqtt: command_topic is empty".into());
        } else if m.command_topic.contains(&['+', '#'][..]) {
            errors.push(format!(
                "mqtt: command_topic '{}' must not contain wildcards",
                m.command_topic
            ));
        }
        if !m.telemetry_topic.is_empty() && m.telemetry_topic == m.command_topic {
            errors.push(format!(
                "mqtt: telemetry_topic and command_topic are both '{}'",
                m.telemetry_topic
            ));
        }

        // ── Timing / sizing ─────────────────────────────────
        if m.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            errors.push(format!(
                "mqtt: keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                m.keep_alive_secs
            ));
        }
        if m.publish_timeout_secs == 0 {
            errors.push("mqtt: publish_timeout_secs must be positive".into());
        }
        if m.queue_capacity == 0 {
            errors.push("mqtt: queue_capacity must be positive".into());
        }
    }

    fn validate_database(&self, errors: &mut Vec<String>) {
        let d = &self.database;

        if d.url.trim().is_empty() {
            errors.push("database: url is empty".into());
        }
        if d.max_connections == 0 {
            errors.push("database: max_connections must be positive".into());
        }
        if d.op_timeout_secs == 0 {
            errors.push("database: op_timeout_secs must be positive".into());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse `path` (defaults if it does not exist), apply environment
/// overrides, then validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config: Config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_overrides(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        telemetry_topic = %config.mqtt.telemetry_topic,
        command_topic = %config.mqtt.command_topic,
        offline_after_secs = config.liveness.offline_after_secs,
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
