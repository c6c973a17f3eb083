//! Configuration management
//!
//! Handles:
//! - Middleware (SOMIOD REST) endpoint settings
//! - MQTT broker settings and reconnect policy
//! - Application names, archive location and control rules
//! - Loading from TOML with environment overrides

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "SOMIOD_REACTOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "somiod-reactor.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub middleware: MiddlewareConfig,
    pub mqtt: MqttConfig,
    pub application: ApplicationConfig,
    pub archive: ArchiveConfig,
    pub control: ControlConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub base_url: String,
    /// First path segment under `/api`
    pub root: String,
    /// Accept self-signed certificates (local IIS Express / dev servers)
    pub accept_invalid_certs: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub subscribe_timeout_secs: u64,
    /// Capacity of the rumqttc request channel
    pub channel_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

/// What the listener does when the broker connection drops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    Never,
    Retry {
        delay_secs: u64,
        /// Consecutive failures tolerated before giving up; `None` retries forever
        max_attempts: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application owning the archive namespace (this dashboard)
    pub name: String,
    /// Application whose container is watched
    pub source_app: String,
    pub source_container: String,
    pub subscription_name: String,
    /// Topic filter override; defaults to `api/{root}/{source_app}/{source_container}`
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub root_dir: PathBuf,
    pub schema_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub rules: Vec<ControlRule>,
    /// Element (XML) or key (JSON) holding the value; root/bare value when unset
    pub value_field: Option<String>,
    pub command_prefix: String,
    pub command_app: Option<String>,
    pub command_container: Option<String>,
    pub command_content_type: String,
}

/// `value > threshold` fires `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRule {
    pub threshold: f64,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:44346".to_string(),
            root: "somiod".to_string(),
            accept_invalid_certs: true,
            timeout_secs: 10,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id_prefix: "somiod-reactor".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            subscribe_timeout_secs: 10,
            channel_capacity: 10,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Retry {
            delay_secs: 2,
            max_attempts: Some(5),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "dashboard-b".to_string(),
            source_app: "temp-sensor-001".to_string(),
            source_container: "readings".to_string(),
            subscription_name: "sub-dash".to_string(),
            topic: None,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("Notifications"),
            schema_path: PathBuf::from("schemas/notification.schema.json"),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            rules: vec![ControlRule {
                threshold: 25.0,
                action: "FAN_ON".to_string(),
            }],
            value_field: None,
            command_prefix: "cmd".to_string(),
            command_app: None,
            command_container: None,
            command_content_type: "application/xml".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Config {
    /// Load from `$SOMIOD_REACTOR_CONFIG` (or `somiod-reactor.toml`), then apply env overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::load_from(Path::new(&path))?;
        config.apply_env_overrides();
        config.validate()?;
        config.archive.schema_path = locate(&config.archive.schema_path, &search_dirs());
        Ok(config)
    }

    /// Missing file yields defaults, unparseable file is an error
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SOMIOD_MIDDLEWARE_URL") {
            self.middleware.base_url = url;
        }
        if let Ok(host) = std::env::var("SOMIOD_MQTT_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("SOMIOD_MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt.broker_port = port,
                Err(_) => warn!("Ignoring SOMIOD_MQTT_PORT={port}: not a port number"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_empty = [
            ("middleware.base_url", &self.middleware.base_url),
            ("middleware.root", &self.middleware.root),
            ("mqtt.broker_host", &self.mqtt.broker_host),
            ("application.name", &self.application.name),
            ("application.source_app", &self.application.source_app),
            ("application.source_container", &self.application.source_container),
            ("application.subscription_name", &self.application.subscription_name),
            ("control.command_prefix", &self.control.command_prefix),
        ];
        for (field, value) in non_empty {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
        }

        if self.mqtt.channel_capacity == 0 {
            return Err(invalid("mqtt.channel_capacity", "must be greater than zero"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(invalid("pipeline.queue_capacity", "must be greater than zero"));
        }

        for (i, rule) in self.control.rules.iter().enumerate() {
            if !rule.threshold.is_finite() {
                return Err(invalid(&format!("control.rules[{i}].threshold"), "must be finite"));
            }
            if rule.action.trim().is_empty() {
                return Err(invalid(&format!("control.rules[{i}].action"), "must not be empty"));
            }
        }

        Ok(())
    }

    /// Topic filter the listener subscribes to
    pub fn topic_filter(&self) -> String {
        self.application.topic.clone().unwrap_or_else(|| {
            format!(
                "api/{}/{}/{}",
                self.middleware.root, self.application.source_app, self.application.source_container
            )
        })
    }

    /// Endpoint registered in the middleware subscription
    pub fn subscription_endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.mqtt.broker_host, self.mqtt.broker_port)
    }
}

/// Working directory, then the executable's directory, then the crate sources
fn search_dirs() -> Vec<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    std::env::current_dir()
        .ok()
        .into_iter()
        .chain(exe_dir)
        .chain(std::iter::once(PathBuf::from(env!("CARGO_MANIFEST_DIR"))))
        .collect()
}

/// First existing `dir/path` among `dirs`; absolute or unmatched paths come back as-is
pub fn locate(path: &Path, dirs: &[PathBuf]) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match dirs.iter().map(|dir| dir.join(path)).find(|candidate| candidate.exists()) {
        Some(found) => {
            info!("Using {}", found.display());
            found
        }
        None => {
            warn!("{} not found in {} search directories", path.display(), dirs.len());
            path.to_path_buf()
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
