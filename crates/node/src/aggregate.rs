//! Daily min/max/alert aggregate and its durable record.
//!
//! This is the only state that survives deep sleep. It is rewritten after
//! every update with an atomic replace (temp file + rename), so a power cut
//! leaves either the old record or the new one, never a torn write.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use time::{Date, OffsetDateTime};

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Day bucket for a unix timestamp: whole days since the epoch (UTC).
pub fn day_index(now_unix: i64) -> i64 {
    now_unix.div_euclid(SECONDS_PER_DAY)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub day_index: i64,
    pub min_temp: i32,
    pub max_temp: i32,
    pub min_hum: i32,
    pub max_hum: i32,
    pub alert_count: u32,
}

impl DailyAggregate {
    /// Fresh aggregate seeded from one reading.
    pub fn start(day_index: i64, temp: i32, hum: i32, alerts: u32) -> Self {
        Self {
            day_index,
            min_temp: temp,
            max_temp: temp,
            min_hum: hum,
            max_hum: hum,
            alert_count: alerts,
        }
    }

    /// Widen the bounds and add this cycle's alerts. Same day only.
    pub fn absorb(&mut self, temp: i32, hum: i32, alerts: u32) {
        self.min_temp = self.min_temp.min(temp);
        self.max_temp = self.max_temp.max(temp);
        self.min_hum = self.min_hum.min(hum);
        self.max_hum = self.max_hum.max(hum);
        self.alert_count = self.alert_count.saturating_add(alerts);
    }

    /// Calendar date of the bucket, if representable.
    pub fn date(&self) -> Option<Date> {
        let epoch = OffsetDateTime::UNIX_EPOCH.date().to_julian_day();
        let jd = i32::try_from(i64::from(epoch) + self.day_index).ok()?;
        Date::from_julian_day(jd).ok()
    }

    /// Rollover message for a closed day. ASCII only.
    pub fn summary(&self, zone: &str) -> String {
        let day = match self.date() {
            Some(d) => d.to_string(),
            None => format!("day {}", self.day_index),
        };
        format!(
            "DAILY SUMMARY - {zone}\n\
             Day: {day}\n\
             Temp min/max: {}/{} C\n\
             Hum min/max: {}/{} %\n\
             Alerts: {}",
            self.min_temp, self.max_temp, self.min_hum, self.max_hum, self.alert_count
        )
    }
}

// ---------------------------------------------------------------------------
// Durable record
// ---------------------------------------------------------------------------

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored aggregate, or `None` when absent or unreadable. Corruption is
    /// logged and treated as absence.
    pub fn load(&self) -> Option<DailyAggregate> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no stored daily aggregate");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "cannot read daily aggregate: {e}");
                return None;
            }
        };

        match serde_json::from_str::<DailyAggregate>(&raw) {
            Ok(agg) => {
                tracing::info!(day_index = agg.day_index, alerts = agg.alert_count, "daily aggregate restored");
                Some(agg)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "corrupt daily aggregate ignored: {e}");
                None
            }
        }
    }

    /// Atomically replace the stored record.
    pub fn save(&self, agg: &DailyAggregate) -> Result<()> {
        let json = serde_json::to_vec(agg).context("failed to serialize daily aggregate")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path)
                .with_context(|| format!("failed to create {}", temp_path.display()))?;
            file.write_all(&json)
                .with_context(|| format!("failed to write {}", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", temp_path.display()))?;
        }
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("failed to rename to {}", self.path.display()))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
