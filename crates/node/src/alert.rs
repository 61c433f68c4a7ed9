//! Threshold alerting and the persisted daily aggregate.
//!
//! Per cycle: compare the reading against the thresholds (inclusive), send
//! at most one message per elevated metric, then fold the reading into the
//! day's min/max/alert record and write it back to disk. A new day first
//! closes the old record with a summary message.
//!
//! There is no suppression across cycles: a metric that stays high alerts
//! again on every wake.

use tracing::{debug, info, warn};

use crate::aggregate::{day_index, DailyAggregate, StateStore};
use crate::error::NotifyError;
use crate::identity::DeviceIdentity;
use crate::notify::Notifier;
use crate::remote_config::RemoteConfig;
use crate::sensor::SensorReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Temperature,
    Humidity,
}

/// Anti-spam latch for one cycle: each metric may fire once.
#[derive(Debug, Default)]
struct CycleAlerts {
    temperature: bool,
    humidity: bool,
}

impl CycleAlerts {
    /// `true` the first time a metric is armed this cycle.
    fn arm(&mut self, metric: Metric) -> bool {
        let slot = match metric {
            Metric::Temperature => &mut self.temperature,
            Metric::Humidity => &mut self.humidity,
        };
        !std::mem::replace(slot, true)
    }

    fn count(&self) -> u32 {
        u32::from(self.temperature) + u32::from(self.humidity)
    }
}

pub fn alert_text(metric: Metric, zone: &str, value: i32, threshold: i32) -> String {
    match metric {
        Metric::Temperature => {
            format!("TEMPERATURE ALERT - {zone}\nTemperature: {value} C\nThreshold: {threshold} C")
        }
        Metric::Humidity => {
            format!("HUMIDITY ALERT - {zone}\nHumidity: {value} %\nThreshold: {threshold} %")
        }
    }
}

pub struct AlertEngine<N> {
    notifier: N,
    store: StateStore,
    aggregate: Option<DailyAggregate>,
}

impl<N: Notifier> AlertEngine<N> {
    /// Loads the stored aggregate once; later cycles in the same process
    /// reuse the in-memory copy.
    pub fn new(notifier: N, store: StateStore) -> Self {
        let aggregate = store.load();
        Self {
            notifier,
            store,
            aggregate,
        }
    }

    pub fn aggregate(&self) -> Option<&DailyAggregate> {
        self.aggregate.as_ref()
    }

    /// Alert on the reading, update and persist the day's aggregate, and
    /// return how many thresholds were crossed this cycle. An incomplete
    /// reading changes nothing.
    pub async fn evaluate_and_persist(
        &mut self,
        identity: &DeviceIdentity,
        reading: &SensorReading,
        config: &RemoteConfig,
        now_unix: i64,
    ) -> u32 {
        let Some((temp, hum)) = reading.complete() else {
            debug!("no complete reading, alerting skipped");
            return 0;
        };
        let zone = identity.zone.name.as_str();

        let mut latch = CycleAlerts::default();
        let checks = [
            (Metric::Temperature, temp, config.alarm_temp),
            (Metric::Humidity, hum, config.alarm_hum),
        ];
        for (metric, value, threshold) in checks {
            if value >= threshold && latch.arm(metric) {
                warn!(zone, ?metric, value, threshold, "threshold crossed");
                self.send(&alert_text(metric, zone, value, threshold)).await;
            }
        }
        let alerts = latch.count();

        self.fold(zone, temp, hum, alerts, day_index(now_unix)).await;
        alerts
    }

    async fn fold(&mut self, zone: &str, temp: i32, hum: i32, alerts: u32, today: i64) {
        let next = match self.aggregate.take() {
            Some(mut agg) if agg.day_index == today => {
                agg.absorb(temp, hum, alerts);
                agg
            }
            Some(closed) => {
                info!(zone, closed_day = closed.day_index, today, "day rollover");
                self.send(&closed.summary(zone)).await;
                DailyAggregate::start(today, temp, hum, alerts)
            }
            None => {
                info!(zone, today, "starting daily aggregate");
                DailyAggregate::start(today, temp, hum, alerts)
            }
        };

        if let Err(e) = self.store.save(&next) {
            warn!(path = %self.store.path().display(), "daily aggregate not persisted: {e:#}");
        }
        self.aggregate = Some(next);
    }

    async fn send(&self, text: &str) {
        match self.notifier.notify(text).await {
            Ok(()) => {}
            Err(NotifyError::Disabled) => debug!("message not sent, messaging disabled"),
            Err(e) => warn!("message not sent: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
