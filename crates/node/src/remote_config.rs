//! Remote configuration resolved from an append-only key/value feed.
//!
//! People edit the feed one field at a time, so most records are sparse.
//! Each setting takes the newest non-empty, numeric value within the last
//! K records and only falls back to its default when none exists.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::RemoteSection;
use crate::error::FetchError;
use crate::http::{build_url, Transport};
use crate::identity::DeviceIdentity;

pub const DEFAULT_SLEEP_MINUTES: u32 = 30;
pub const DEFAULT_ALARM_TEMP: i32 = 25;
pub const DEFAULT_ALARM_HUM: i32 = 60;
pub const DEFAULT_DEBUG: bool = true;
pub const DEFAULT_SAMPLES: u32 = 5;

pub const SLEEP_MINUTES_MIN: u32 = 1;
pub const SLEEP_MINUTES_MAX: u32 = 180;
pub const SAMPLES_MIN: u32 = 1;
pub const SAMPLES_MAX: u32 = 10;

/// One cycle's effective settings. Rebuilt every cycle; nothing carries
/// over from a previous fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Minutes of deep sleep between production cycles, within [1, 180].
    pub sleep_interval: u32,
    pub alarm_temp: i32,
    pub alarm_hum: i32,
    pub debug: bool,
    /// Raw samples averaged per reading, within [1, 10].
    pub sampling_count: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            sleep_interval: DEFAULT_SLEEP_MINUTES,
            alarm_temp: DEFAULT_ALARM_TEMP,
            alarm_hum: DEFAULT_ALARM_HUM,
            debug: DEFAULT_DEBUG,
            sampling_count: DEFAULT_SAMPLES,
        }
    }
}

// ---------------------------------------------------------------------------
// Feed payload
// ---------------------------------------------------------------------------

pub type FeedRecord = Map<String, Value>;

/// Either a bare array of records or the channel envelope
/// `{"channel": {...}, "feeds": [...]}`. Records are oldest first.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPayload {
    Records(Vec<FeedRecord>),
    Channel { feeds: Vec<FeedRecord> },
}

impl FeedPayload {
    fn into_records(self) -> Vec<FeedRecord> {
        match self {
            Self::Records(r) | Self::Channel { feeds: r } => r,
        }
    }
}

/// Parse one field value: numbers and numeric strings, truncated toward
/// zero. Empty, null and non-numeric values are treated as absent.
fn parse_value(v: &Value) -> Option<i64> {
    let f = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    f.is_finite().then(|| f.trunc() as i64)
}

/// Newest-to-oldest scan for the first usable value of `field`.
pub fn last_non_empty(records: &[FeedRecord], field: &str) -> Option<i64> {
    records
        .iter()
        .rev()
        .filter_map(|r| r.get(field))
        .find_map(parse_value)
}

fn clamp_to_u32(v: i64, lo: u32, hi: u32) -> u32 {
    v.clamp(i64::from(lo), i64::from(hi)) as u32
}

fn saturate_i32(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Feed slots shared by every zone.
#[derive(Debug, Clone)]
pub struct GlobalFields {
    pub sleep: String,
    pub debug: String,
    pub samples: String,
}

/// Build a config from records, field by field.
pub fn resolve(records: &[FeedRecord], globals: &GlobalFields, identity: &DeviceIdentity) -> RemoteConfig {
    let zone = &identity.zone.config_fields;
    let d = RemoteConfig::default();

    RemoteConfig {
        sleep_interval: last_non_empty(records, &globals.sleep)
            .map(|v| clamp_to_u32(v, SLEEP_MINUTES_MIN, SLEEP_MINUTES_MAX))
            .unwrap_or(d.sleep_interval),
        alarm_temp: last_non_empty(records, &zone.alarm_temp)
            .map(saturate_i32)
            .unwrap_or(d.alarm_temp),
        alarm_hum: last_non_empty(records, &zone.alarm_hum)
            .map(saturate_i32)
            .unwrap_or(d.alarm_hum),
        debug: last_non_empty(records, &globals.debug)
            .map(|v| v >= 1)
            .unwrap_or(d.debug),
        sampling_count: last_non_empty(records, &globals.samples)
            .map(|v| clamp_to_u32(v, SAMPLES_MIN, SAMPLES_MAX))
            .unwrap_or(d.sampling_count),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ConfigClient<T> {
    transport: T,
    url_template: String,
    channel: String,
    results: u32,
    globals: GlobalFields,
}

impl<T: Transport> ConfigClient<T> {
    pub fn new(transport: T, remote: &RemoteSection) -> Self {
        Self {
            transport,
            url_template: remote.config_url.clone(),
            channel: remote.config_channel.clone(),
            results: remote.results.max(1),
            globals: GlobalFields {
                sleep: remote.sleep_field.clone(),
                debug: remote.debug_field.clone(),
                samples: remote.samples_field.clone(),
            },
        }
    }

    /// Fetch this cycle's config. Never fails: any error degrades to the
    /// full default config.
    pub async fn fetch(&self, identity: &DeviceIdentity) -> RemoteConfig {
        match self.try_fetch(identity).await {
            Ok(cfg) => {
                info!(?cfg, "remote config applied");
                cfg
            }
            Err(e) => {
                let cfg = RemoteConfig::default();
                warn!(?cfg, "remote config fetch failed, using defaults: {e}");
                cfg
            }
        }
    }

    pub async fn try_fetch(&self, identity: &DeviceIdentity) -> Result<RemoteConfig, FetchError> {
        let mut params = vec![("results", self.results.to_string())];
        let base = if self.url_template.contains("{channel}") {
            self.url_template.replace("{channel}", &self.channel)
        } else {
            params.insert(0, ("channel", self.channel.clone()));
            self.url_template.clone()
        };
        let url = build_url(&base, &params)?;

        let body = self.transport.get(&url).await?;
        let records = serde_json::from_str::<FeedPayload>(&body)?.into_records();
        if records.is_empty() {
            return Err(FetchError::EmptyFeed);
        }

        Ok(resolve(&records, &self.globals, identity))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
