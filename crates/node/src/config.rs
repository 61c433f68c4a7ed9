//! TOML config file loading and validation for the node: endpoints,
//! secrets, board wiring and the device → zone table.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub messaging: MessagingSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub board: BoardSection,
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub mqtt: Option<MqttSection>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    /// Feed endpoint. `{channel}` is replaced by `config_channel`; without
    /// the placeholder the channel is sent as a query parameter.
    pub config_url: String,
    pub config_channel: String,
    /// How many recent records to request (K).
    pub results: u32,
    pub upload_url: String,
    pub api_key: String,
    pub http_timeout_secs: u64,
    pub sleep_field: String,
    pub debug_field: String,
    pub samples_field: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            config_url: "https://api.thingspeak.com/channels/{channel}/feeds.json".into(),
            config_channel: String::new(),
            results: 20,
            upload_url: "https://api.thingspeak.com/update".into(),
            api_key: String::new(),
            http_timeout_secs: 15,
            sleep_field: "field1".into(),
            debug_field: "field8".into(),
            samples_field: "field4".into(),
        }
    }
}

impl RemoteSection {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MessagingSection {
    pub bot_url: String,
    pub bot_token: String,
    pub chat_id: String,
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            bot_url: "https://api.telegram.org".into(),
            bot_token: String::new(),
            chat_id: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// `host:port` probed to decide whether the link is up. Empty means
    /// the link is assumed up.
    pub probe_addr: String,
    pub reconnect_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            probe_addr: "api.thingspeak.com:443".into(),
            reconnect_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BoardSection {
    pub watchdog_timeout_secs: u64,
    pub watchdog_device: Option<String>,
    /// Host stand-in for the BOOT button: the node parks if this file exists.
    pub safe_mode_file: Option<String>,
    /// Network interface whose MAC address identifies the device.
    pub identity_iface: String,
    pub power_pin: u8,
    pub data_pin: u8,
    pub safe_mode_pin: u8,
    pub debug_pause_secs: u64,
}

impl Default for BoardSection {
    fn default() -> Self {
        Self {
            watchdog_timeout_secs: 60,
            watchdog_device: None,
            safe_mode_file: None,
            identity_iface: "wlan0".into(),
            power_pin: 5,
            data_pin: 4,
            safe_mode_pin: 0,
            debug_pause_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub stabilize_secs: u64,
    pub sample_delay_secs: u64,
    pub sim_scenario: String,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            stabilize_secs: 2,
            sample_delay_secs: 1,
            sim_scenario: "normal".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub path: String,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: "daily_aggregate.json".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "telemetry-node".into()
}

fn default_topic_prefix() -> String {
    "tele".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub device_id: String,
    pub name: String,
    #[serde(default = "default_alarm_temp_field")]
    pub alarm_temp_field: String,
    #[serde(default = "default_alarm_hum_field")]
    pub alarm_hum_field: String,
    #[serde(default = "default_temp_field")]
    pub temp_field: String,
    #[serde(default = "default_hum_field")]
    pub hum_field: String,
}

fn default_alarm_temp_field() -> String {
    "field2".into()
}

fn default_alarm_hum_field() -> String {
    "field3".into()
}

fn default_temp_field() -> String {
    "field1".into()
}

fn default_hum_field() -> String {
    "field2".into()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Feeds expose exactly eight positional slots.
const MAX_FIELD: u8 = 8;

/// True for `field1` ..= `field8`.
pub fn is_field_name(s: &str) -> bool {
    s.strip_prefix("field")
        .and_then(|n| n.parse::<u8>().ok())
        .is_some_and(|n| (1..=MAX_FIELD).contains(&n))
}

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_remote(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_zones(&mut errors);

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

    fn validate_remote(&self, errors: &mut Vec<String>) {
        let r = &self.remote;

        for (name, url) in [
            ("config_url", &r.config_url),
            ("upload_url", &r.upload_url),
            ("messaging.bot_url", &self.messaging.bot_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("{name} must start with http:// or https://, got {url:?}"));
            }
        }

        if r.results == 0 {
            errors.push("remote.results must be at least 1".into());
        }
        if r.http_timeout_secs == 0 {
            errors.push("remote.http_timeout_secs must be positive".into());
        }

        let globals = [
            ("sleep_field", &r.sleep_field),
            ("debug_field", &r.debug_field),
            ("samples_field", &r.samples_field),
        ];
        let mut seen: HashSet<&str> = HashSet::new();
        for (name, field) in globals {
            if !is_field_name(field) {
                errors.push(format!("remote.{name} {field:?} is not field1..field{MAX_FIELD}"));
            } else if !seen.insert(field) {
                errors.push(format!("remote.{name} {field:?} is already used by another setting"));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.network.reconnect_timeout_secs == 0 {
            errors.push("network.reconnect_timeout_secs must be positive".into());
        }
        if self.board.watchdog_timeout_secs == 0 {
            errors.push("board.watchdog_timeout_secs must be positive".into());
        }
        if self.board.debug_pause_secs >= self.board.watchdog_timeout_secs {
            errors.push(format!(
                "board.debug_pause_secs ({}) must be shorter than the watchdog timeout ({})",
                self.board.debug_pause_secs, self.board.watchdog_timeout_secs
            ));
        }
        if self.sensor.sample_delay_secs == 0 {
            errors.push("sensor.sample_delay_secs must be at least 1 (sensor minimum interval)".into());
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<String> = HashSet::new();
        let reserved: HashSet<&str> = [
            self.remote.sleep_field.as_str(),
            self.remote.debug_field.as_str(),
            self.remote.samples_field.as_str(),
        ]
        .into_iter()
        .collect();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.device_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !seen_ids.insert(crate::identity::normalize_id(&z.device_id)) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Field offsets ───────────────────────────────────
            for (name, field) in [
                ("alarm_temp_field", &z.alarm_temp_field),
                ("alarm_hum_field", &z.alarm_hum_field),
                ("temp_field", &z.temp_field),
                ("hum_field", &z.hum_field),
            ] {
                if !is_field_name(field) {
                    errors.push(format!(
                        "{}: {name} {field:?} is not field1..field{MAX_FIELD}",
                        ctx()
                    ));
                }
            }

            if z.alarm_temp_field == z.alarm_hum_field {
                errors.push(format!(
                    "{}: alarm_temp_field and alarm_hum_field are both {:?}",
                    ctx(),
                    z.alarm_temp_field
                ));
            }
            for field in [&z.alarm_temp_field, &z.alarm_hum_field] {
                if reserved.contains(field.as_str()) {
                    errors.push(format!(
                        "{}: {field:?} collides with a global config field",
                        ctx()
                    ));
                }
            }
            if z.temp_field == z.hum_field {
                errors.push(format!(
                    "{}: temp_field and hum_field are both {:?}",
                    ctx(),
                    z.temp_field
                ));
            }
        }
    }

    /// Apply secret overrides from the environment.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TS_API_KEY") {
            self.remote.api_key = v;
        }
        if let Ok(v) = std::env::var("BOT_TOKEN") {
            self.messaging.bot_token = v;
        }
        if let Ok(v) = std::env::var("BOT_CHAT_ID") {
            self.messaging.chat_id = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// built-in defaults so a fresh node can still boot and report.
pub fn load(path: &str) -> Result<Config> {
    let mut config: Config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        zones = config.zones.len(),
        mqtt = config.mqtt.is_some(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
