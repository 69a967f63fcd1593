//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing keys take the values the ride was
//! commissioned with. Configuration is fixed at startup.

use crate::services::ride::RideTimings;
use anyhow::{ensure, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Park / site identifier
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "park".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RideConfig {
    /// Ride identifier, included in every published payload
    pub id: String,
    /// Number of seats
    pub capacity: u32,
    /// Boarding closes this long after the most recent entry
    pub boarding_window_ms: u64,
    /// Ride run time
    pub ride_duration_ms: u64,
    /// Entries closer than this form one batch (diagnostic only)
    pub group_gap_ms: u64,
    /// Where to keep the current cycle across restarts (disabled if unset)
    pub checkpoint_file: Option<String>,
}

impl Default for RideConfig {
    fn default() -> Self {
        Self {
            id: "ride1".to_string(),
            capacity: 4,
            boarding_window_ms: 30_000,
            ride_duration_ms: 30_000,
            group_gap_ms: 5_000,
            checkpoint_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Serial device of the sensor bridge (idle probe if unset)
    pub device: Option<String>,
    #[serde(default = "default_probe_baud")]
    pub baud: u32,
}

fn default_probe_baud() -> u32 {
    115_200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    /// Readings at or below this distance mean "person present"
    pub near_threshold_cm: f64,
    /// Minimum spacing between two counted people on one sensor
    pub cooldown_ms: u64,
    /// Control loop period
    pub sample_period_ms: u64,
    /// Upper bound for a single probe read
    pub read_timeout_ms: u64,
    pub entrance: ProbeConfig,
    pub exit: ProbeConfig,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            near_threshold_cm: 60.0,
            cooldown_ms: 1_000,
            sample_period_ms: 50,
            read_timeout_ms: 30,
            entrance: ProbeConfig { device: None, baud: default_probe_baud() },
            exit: ProbeConfig { device: None, baud: default_probe_baud() },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub period_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { period_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic for ride state snapshots (QoS 1)
    pub state_topic: String,
    /// Retained online/offline topic
    pub status_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "pi-ride-ctrl".to_string(),
            keep_alive_secs: 60,
            username: None,
            password: None,
            state_topic: "park/ride1/ride/state".to_string(),
            status_topic: "park/ride1/status/pi-ride-ctrl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub url: String,
    pub push_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8080/api/ride".to_string(),
            push_interval_ms: 1_000,
            timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 60, prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub ride: RideConfig,
    pub sensors: SensorsConfig,
    pub heartbeat: HeartbeatConfig,
    pub mqtt: MqttConfig,
    pub dashboard: DashboardConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    ride_id: String,
    capacity: u32,
    boarding_window_ms: u64,
    ride_duration_ms: u64,
    group_gap_ms: u64,
    checkpoint_file: Option<String>,
    near_threshold_cm: f64,
    cooldown_ms: u64,
    sample_period_ms: u64,
    read_timeout_ms: u64,
    entrance_device: Option<String>,
    entrance_baud: u32,
    exit_device: Option<String>,
    exit_baud: u32,
    heartbeat_period_ms: u64,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_client_id: String,
    mqtt_keep_alive_secs: u64,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_state_topic: String,
    mqtt_status_topic: String,
    dashboard_enabled: bool,
    dashboard_url: String,
    dashboard_push_interval_ms: u64,
    dashboard_timeout_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl From<TomlConfig> for Config {
    fn from(toml_config: TomlConfig) -> Self {
        Self {
            site_id: toml_config.site.id,
            ride_id: toml_config.ride.id,
            capacity: toml_config.ride.capacity,
            boarding_window_ms: toml_config.ride.boarding_window_ms,
            ride_duration_ms: toml_config.ride.ride_duration_ms,
            group_gap_ms: toml_config.ride.group_gap_ms,
            checkpoint_file: toml_config.ride.checkpoint_file,
            near_threshold_cm: toml_config.sensors.near_threshold_cm,
            cooldown_ms: toml_config.sensors.cooldown_ms,
            sample_period_ms: toml_config.sensors.sample_period_ms,
            read_timeout_ms: toml_config.sensors.read_timeout_ms,
            entrance_device: toml_config.sensors.entrance.device,
            entrance_baud: toml_config.sensors.entrance.baud,
            exit_device: toml_config.sensors.exit.device,
            exit_baud: toml_config.sensors.exit.baud,
            heartbeat_period_ms: toml_config.heartbeat.period_ms,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_keep_alive_secs: toml_config.mqtt.keep_alive_secs,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_state_topic: toml_config.mqtt.state_topic,
            mqtt_status_topic: toml_config.mqtt.status_topic,
            dashboard_enabled: toml_config.dashboard.enabled,
            dashboard_url: toml_config.dashboard.url,
            dashboard_push_interval_ms: toml_config.dashboard.push_interval_ms,
            dashboard_timeout_ms: toml_config.dashboard.timeout_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: "default".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from(TomlConfig::default())
    }
}

impl Config {
    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        let config = Self::from(toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    /// Load configuration - defaults when the file does not exist.
    ///
    /// A file that exists but cannot be parsed or fails validation is an
    /// error: running a ride on silently substituted values is worse than
    /// not starting.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config_file_missing_using_defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Check startup constraints on the configured values
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.capacity > 0, "ride.capacity must be positive");
        ensure!(
            self.near_threshold_cm.is_finite() && self.near_threshold_cm > 0.0,
            "sensors.near_threshold_cm must be a positive distance"
        );
        ensure!(self.cooldown_ms > 0, "sensors.cooldown_ms must be positive");
        ensure!(self.sample_period_ms > 0, "sensors.sample_period_ms must be positive");
        ensure!(self.read_timeout_ms > 0, "sensors.read_timeout_ms must be positive");
        ensure!(self.heartbeat_period_ms > 0, "heartbeat.period_ms must be positive");
        ensure!(self.group_gap_ms > 0, "ride.group_gap_ms must be positive");
        ensure!(
            self.boarding_window_ms > self.sample_period_ms,
            "ride.boarding_window_ms ({}) must exceed sensors.sample_period_ms ({})",
            self.boarding_window_ms,
            self.sample_period_ms
        );
        ensure!(
            self.ride_duration_ms > self.sample_period_ms,
            "ride.ride_duration_ms ({}) must exceed sensors.sample_period_ms ({})",
            self.ride_duration_ms,
            self.sample_period_ms
        );
        if self.dashboard_enabled {
            ensure!(self.dashboard_push_interval_ms > 0, "dashboard.push_interval_ms must be positive");
            ensure!(self.dashboard_timeout_ms > 0, "dashboard.timeout_ms must be positive");
        }
        Ok(())
    }

    /// State machine timings
    pub fn ride_timings(&self) -> RideTimings {
        RideTimings {
            boarding_window: Duration::from_millis(self.boarding_window_ms),
            ride_duration: Duration::from_millis(self.ride_duration_ms),
            group_gap: Duration::from_millis(self.group_gap_ms),
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn ride_id(&self) -> &str {
        &self.ride_id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn checkpoint_file(&self) -> Option<&str> {
        self.checkpoint_file.as_deref()
    }

    pub fn near_threshold_cm(&self) -> f64 {
        self.near_threshold_cm
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn entrance_device(&self) -> Option<&str> {
        self.entrance_device.as_deref()
    }

    pub fn entrance_baud(&self) -> u32 {
        self.entrance_baud
    }

    pub fn exit_device(&self) -> Option<&str> {
        self.exit_device.as_deref()
    }

    pub fn exit_baud(&self) -> u32 {
        self.exit_baud
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_keep_alive_secs(&self) -> u64 {
        self.mqtt_keep_alive_secs
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_state_topic(&self) -> &str {
        &self.mqtt_state_topic
    }

    pub fn mqtt_status_topic(&self) -> &str {
        &self.mqtt_status_topic
    }

    pub fn dashboard_enabled(&self) -> bool {
        self.dashboard_enabled
    }

    pub fn dashboard_url(&self) -> &str {
        &self.dashboard_url
    }

    pub fn dashboard_push_interval(&self) -> Duration {
        Duration::from_millis(self.dashboard_push_interval_ms)
    }

    pub fn dashboard_timeout(&self) -> Duration {
        Duration::from_millis(self.dashboard_timeout_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the ride timings
    pub fn with_timings_ms(mut self, boarding_window_ms: u64, ride_duration_ms: u64) -> Self {
        self.boarding_window_ms = boarding_window_ms;
        self.ride_duration_ms = ride_duration_ms;
        self
    }

    /// Builder method for tests to set the checkpoint file
    pub fn with_checkpoint_file(mut self, path: &str) -> Self {
        self.checkpoint_file = Some(path.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.capacity(), 4);
        assert_eq!(config.near_threshold_cm(), 60.0);
        assert_eq!(config.cooldown(), Duration::from_secs(1));
        assert_eq!(config.sample_period(), Duration::from_millis(50));
        assert_eq!(config.heartbeat_period(), Duration::from_secs(1));
        assert_eq!(config.mqtt_state_topic(), "park/ride1/ride/state");
        assert!(config.entrance_device().is_none());
        assert!(!config.dashboard_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ride_timings() {
        let timings = Config::default().ride_timings();
        assert_eq!(timings.boarding_window, Duration::from_secs(30));
        assert_eq!(timings.ride_duration, Duration::from_secs(30));
        assert_eq!(timings.group_gap, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
[ride]
capacity = 8

[sensors.entrance]
device = "/dev/ttyUSB0"
"#,
        )
        .unwrap();

        assert_eq!(config.capacity(), 8);
        assert_eq!(config.entrance_device(), Some("/dev/ttyUSB0"));
        assert_eq!(config.entrance_baud(), 115_200);
        assert_eq!(config.ride_id(), "ride1");
        assert_eq!(config.read_timeout(), Duration::from_millis(30));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let err = Config::from_toml_str("[ride]\ncapacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_validation_rejects_window_shorter_than_sample_period() {
        let err = Config::from_toml_str(
            "[ride]\nboarding_window_ms = 40\n[sensors]\nsample_period_ms = 50\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("boarding_window_ms"));

        let err =
            Config::from_toml_str("[ride]\nride_duration_ms = 50\n").unwrap_err();
        assert!(err.to_string().contains("ride_duration_ms"));
    }

    #[test]
    fn test_validation_rejects_zero_cooldown_and_threshold() {
        assert!(Config::from_toml_str("[sensors]\ncooldown_ms = 0\n").is_err());
        assert!(Config::from_toml_str("[sensors]\nnear_threshold_cm = 0.0\n").is_err());
        assert!(Config::from_toml_str("[heartbeat]\nperiod_ms = 0\n").is_err());
    }

    #[test]
    fn test_resolve_config_path_prefers_cli() {
        assert_eq!(Config::resolve_config_path(Some("config/ride2.toml")), "config/ride2.toml");
    }
}
