//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::schedule::ScheduleConfig;
use crate::domain::types::DoorId;
use crate::infra::retry::RetryPolicy;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

// Validated ranges for door timing knobs
const MIN_DAY_DELAY_MINS: u64 = 1;
const MAX_DAY_DELAY_MINS: u64 = 240;
const MIN_NIGHT_DELAY_MINS: u64 = 1;
const MAX_NIGHT_DELAY_MINS: u64 = 30;
const MIN_RETRY_COUNT: u32 = 0;
const MAX_RETRY_COUNT: u32 = 5;
const MIN_RETRY_DELAY_SECS: u64 = 3;
const MAX_RETRY_DELAY_SECS: u64 = 60;
const MIN_VERIFICATION_DELAY_SECS: u64 = 2;
const MAX_VERIFICATION_DELAY_SECS: u64 = 10;

/// How lock commands reach the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Mqtt,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { host: "localhost".to_string(), port: 1883, username: None, password: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_enabled() -> bool {
    true
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: default_broker_enabled(),
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Metrics/service HTTP port (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_http_port() -> u16 {
    9184
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), http_port: default_http_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// MQTT topic for persistent notifications (QoS 1)
    #[serde(default = "default_notify_topic")]
    pub topic: String,
    /// Optional push webhook, POSTed the notification JSON
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_notify_topic() -> String {
    "autolock/notify".to_string()
}

fn default_notify_timeout_ms() -> u64 {
    2000
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            topic: default_notify_topic(),
            webhook_url: None,
            timeout_ms: default_notify_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Site identifier used in logs and metric labels
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "autolock".to_string()
}

/// Raw per-door table as written in TOML
#[derive(Debug, Clone, Deserialize)]
pub struct TomlDoorConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_lock_mode")]
    pub mode: LockMode,
    pub lock_state_topic: String,
    #[serde(default)]
    pub lock_command_topic: Option<String>,
    #[serde(default)]
    pub lock_url: Option<String>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub sensor_topic: Option<String>,
    #[serde(default = "default_day_delay_mins")]
    pub day_delay_mins: u64,
    #[serde(default = "default_night_delay_mins")]
    pub night_delay_mins: u64,
    pub night_start: String,
    pub day_start: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_exponential_backoff")]
    pub exponential_backoff: bool,
    #[serde(default = "default_verification_delay_secs")]
    pub verification_delay_secs: u64,
    #[serde(default = "default_enable_on_creation")]
    pub enable_on_creation: bool,
}

fn default_lock_mode() -> LockMode {
    LockMode::Mqtt
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_day_delay_mins() -> u64 {
    5
}

fn default_night_delay_mins() -> u64 {
    2
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_exponential_backoff() -> bool {
    true
}

fn default_verification_delay_secs() -> u64 {
    5
}

fn default_enable_on_creation() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub doors: Vec<TomlDoorConfig>,
}

/// Validated per-door configuration with parsed durations and schedule
#[derive(Debug, Clone)]
pub struct DoorConfig {
    pub id: DoorId,
    pub name: String,
    pub mode: LockMode,
    pub lock_state_topic: String,
    pub lock_command_topic: Option<String>,
    pub lock_url: Option<String>,
    pub lock_timeout: Duration,
    pub sensor_topic: Option<String>,
    /// Topic carrying service commands for this door
    pub command_topic: String,
    pub day_delay: Duration,
    pub night_delay: Duration,
    pub schedule: ScheduleConfig,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    pub verification_delay: Duration,
    pub enable_on_creation: bool,
}

impl DoorConfig {
    /// Retry policy for this door's lock cycle
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_count,
            delay: self.retry_delay,
            exponential_backoff: self.exponential_backoff,
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            jitter: true,
        }
    }

    fn from_toml(raw: TomlDoorConfig) -> anyhow::Result<Self> {
        let ctx = |field: &str| format!("door '{}': invalid {}", raw.id, field);

        if raw.id.is_empty() {
            bail!("door id must not be empty");
        }
        if !(MIN_DAY_DELAY_MINS..=MAX_DAY_DELAY_MINS).contains(&raw.day_delay_mins) {
            bail!(
                "{} (must be {MIN_DAY_DELAY_MINS}-{MAX_DAY_DELAY_MINS} minutes)",
                ctx("day_delay_mins")
            );
        }
        if !(MIN_NIGHT_DELAY_MINS..=MAX_NIGHT_DELAY_MINS).contains(&raw.night_delay_mins) {
            bail!(
                "{} (must be {MIN_NIGHT_DELAY_MINS}-{MAX_NIGHT_DELAY_MINS} minutes)",
                ctx("night_delay_mins")
            );
        }
        if !(MIN_RETRY_COUNT..=MAX_RETRY_COUNT).contains(&raw.retry_count) {
            bail!("{} (must be {MIN_RETRY_COUNT}-{MAX_RETRY_COUNT})", ctx("retry_count"));
        }
        if !(MIN_RETRY_DELAY_SECS..=MAX_RETRY_DELAY_SECS).contains(&raw.retry_delay_secs) {
            bail!(
                "{} (must be {MIN_RETRY_DELAY_SECS}-{MAX_RETRY_DELAY_SECS} seconds)",
                ctx("retry_delay_secs")
            );
        }
        if !(MIN_VERIFICATION_DELAY_SECS..=MAX_VERIFICATION_DELAY_SECS)
            .contains(&raw.verification_delay_secs)
        {
            bail!(
                "{} (must be {MIN_VERIFICATION_DELAY_SECS}-{MAX_VERIFICATION_DELAY_SECS} seconds)",
                ctx("verification_delay_secs")
            );
        }
        match raw.mode {
            LockMode::Mqtt if raw.lock_command_topic.is_none() => {
                bail!("door '{}': mqtt mode requires lock_command_topic", raw.id)
            }
            LockMode::Http if raw.lock_url.is_none() => {
                bail!("door '{}': http mode requires lock_url", raw.id)
            }
            _ => {}
        }

        let schedule = ScheduleConfig::from_strs(&raw.night_start, &raw.day_start)
            .with_context(|| ctx("schedule"))?;

        let command_topic = format!("autolock/{}/set", raw.id);

        Ok(Self {
            id: DoorId(raw.id),
            name: raw.name,
            mode: raw.mode,
            lock_state_topic: raw.lock_state_topic,
            lock_command_topic: raw.lock_command_topic,
            lock_url: raw.lock_url,
            lock_timeout: Duration::from_millis(raw.lock_timeout_ms),
            sensor_topic: raw.sensor_topic,
            command_topic,
            day_delay: Duration::from_secs(raw.day_delay_mins * 60),
            night_delay: Duration::from_secs(raw.night_delay_mins * 60),
            schedule,
            retry_count: raw.retry_count,
            retry_delay: Duration::from_secs(raw.retry_delay_secs),
            exponential_backoff: raw.exponential_backoff,
            verification_delay: Duration::from_secs(raw.verification_delay_secs),
            enable_on_creation: raw.enable_on_creation,
        })
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt: MqttConfig,
    broker: BrokerConfig,
    metrics: MetricsConfig,
    notify: NotifyConfig,
    doors: Vec<DoorConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            mqtt: MqttConfig::default(),
            broker: BrokerConfig::default(),
            metrics: MetricsConfig::default(),
            notify: NotifyConfig::default(),
            doors: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut seen = HashSet::new();
        let mut doors = Vec::with_capacity(toml_config.doors.len());
        for raw in toml_config.doors {
            if !seen.insert(raw.id.clone()) {
                bail!("duplicate door id '{}'", raw.id);
            }
            doors.push(DoorConfig::from_toml(raw)?);
        }

        Ok(Self {
            site_id: toml_config.site.id,
            mqtt: toml_config.mqtt,
            broker: toml_config.broker,
            metrics: toml_config.metrics,
            notify: toml_config.notify,
            doors,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from args/environment, falling back to defaults
    pub fn load(args: &[String]) -> Self {
        let config_path = Self::resolve_config_path(args);
        Self::load_from_path(&config_path)
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {e:#}. Using defaults.");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker.enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker.bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker.port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn http_port(&self) -> u16 {
        self.metrics.http_port
    }

    pub fn notify_topic(&self) -> &str {
        &self.notify.topic
    }

    pub fn notify_webhook_url(&self) -> Option<&str> {
        self.notify.webhook_url.as_deref()
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify.timeout_ms)
    }

    pub fn doors(&self) -> &[DoorConfig] {
        &self.doors
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
