//! The wake cycle and the decision that follows it.
//!
//! ```text
//! feed ─▶ network ─▶ config ─▶ sample ─▶ upload ─▶ mirror ─▶ alert/persist
//!                                                               │
//!                         debug ◀─────── decide ────────▶ production
//!                   pause, loop again             suspend N minutes, restart
//! ```
//!
//! Every step degrades instead of failing. The one exception is a network
//! that stays down past its bound, which ends in a hard reset.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alert::AlertEngine;
use crate::board::{fed_sleep, Watchdog};
use crate::error::CycleError;
use crate::http::Transport;
use crate::identity::DeviceIdentity;
use crate::mirror::{MqttMirror, ReadingMsg};
use crate::network::{ensure_connected, NetworkHandle};
use crate::notify::Notifier;
use crate::remote_config::{ConfigClient, RemoteConfig};
use crate::sensor::{SensorHardware, SensorReading, SensorSampler};
use crate::upload::{TelemetryUploader, UploadThrottleState};

/// What to do once a cycle is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Debug mode: wait `pause`, then run again in the same process.
    Repeat { pause: Duration },
    /// Production: deep sleep, then start over from process entry.
    Suspend { minutes: u32 },
}

/// Why [`CycleController::run`] handed control back to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Suspend { minutes: u32 },
    /// The network never came back; reset the device.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub config: RemoteConfig,
    pub reading: SensorReading,
    /// `None` when there was nothing to upload.
    pub uploaded: Option<bool>,
    pub alerts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerTiming {
    pub debug_pause: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            debug_pause: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(20),
        }
    }
}

/// The collaborators one cycle drives.
pub struct Components<T, H, N, Net> {
    pub config: ConfigClient<T>,
    pub sampler: SensorSampler<H>,
    pub uploader: TelemetryUploader<T>,
    pub alerts: AlertEngine<N>,
    pub network: Net,
    pub mirror: Option<MqttMirror>,
}

pub struct CycleController<T, H, N, Net> {
    identity: DeviceIdentity,
    parts: Components<T, H, N, Net>,
    throttle: UploadThrottleState,
    timing: ControllerTiming,
    clock: fn() -> i64,
}

impl<T, H, N, Net> CycleController<T, H, N, Net>
where
    T: Transport,
    H: SensorHardware,
    N: Notifier,
    Net: NetworkHandle,
{
    /// `clock` returns the current unix time in seconds.
    pub fn new(
        identity: DeviceIdentity,
        parts: Components<T, H, N, Net>,
        timing: ControllerTiming,
        clock: fn() -> i64,
    ) -> Self {
        Self {
            identity,
            parts,
            throttle: UploadThrottleState::default(),
            timing,
            clock,
        }
    }

    /// Run cycles until one ends in suspension or reset. In debug mode this
    /// loops in-process, keeping the daily aggregate in memory.
    pub async fn run(&mut self, watchdog: &dyn Watchdog) -> Exit {
        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            let report = match self.run_cycle(watchdog).await {
                Ok(report) => report,
                Err(CycleError::Network(e)) => {
                    error!(cycle, "{e}; resetting");
                    self.parts.network.reset().await;
                    return Exit::Reset;
                }
            };

            match self.decide(&report) {
                CycleOutcome::Repeat { pause } => {
                    info!(cycle, pause_secs = pause.as_secs(), "debug mode, looping");
                    fed_sleep(pause, Duration::from_secs(1), watchdog).await;
                }
                CycleOutcome::Suspend { minutes } => return Exit::Suspend { minutes },
            }
        }
    }

    /// One full pass: config, sample, upload, alert.
    pub async fn run_cycle(&mut self, watchdog: &dyn Watchdog) -> Result<CycleReport, CycleError> {
        watchdog.feed();
        ensure_connected(&mut self.parts.network, watchdog, self.timing.reconnect_timeout).await?;

        let config = self.parts.config.fetch(&self.identity).await;
        info!(
            zone = %self.identity.zone.name,
            sleep_min = config.sleep_interval,
            alarm_temp = config.alarm_temp,
            alarm_hum = config.alarm_hum,
            debug = config.debug,
            samples = config.sampling_count,
            "cycle settings"
        );
        watchdog.feed();

        let reading = self.parts.sampler.read(config.sampling_count, watchdog).await;
        let Some((temperature, humidity)) = reading.complete() else {
            warn!("no valid reading, skipping upload and alerts");
            return Ok(CycleReport {
                config,
                reading,
                uploaded: None,
                alerts: 0,
            });
        };

        let uploaded = self
            .parts
            .uploader
            .send(&mut self.throttle, &self.identity, temperature, humidity, watchdog)
            .await;

        let now = (self.clock)();
        if let Some(mirror) = self.parts.mirror.as_mut() {
            mirror
                .publish_reading(&ReadingMsg {
                    ts: now,
                    zone: &self.identity.zone.name,
                    temperature,
                    humidity,
                })
                .await;
            watchdog.feed();
        }

        let alerts = self
            .parts
            .alerts
            .evaluate_and_persist(&self.identity, &reading, &config, now)
            .await;
        watchdog.feed();
        if let Some(agg) = self.parts.alerts.aggregate() {
            debug!(
                day = agg.day_index,
                temp = format_args!("{}..{}", agg.min_temp, agg.max_temp),
                hum = format_args!("{}..{}", agg.min_hum, agg.max_hum),
                alerts = agg.alert_count,
                "daily aggregate"
            );
        }

        Ok(CycleReport {
            config,
            reading,
            uploaded: Some(uploaded),
            alerts,
        })
    }

    pub fn decide(&self, report: &CycleReport) -> CycleOutcome {
        if report.config.debug {
            CycleOutcome::Repeat {
                pause: self.timing.debug_pause,
            }
        } else {
            CycleOutcome::Suspend {
                minutes: report.config.sleep_interval,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn parts(&self) -> &Components<T, H, N, Net> {
        &self.parts
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::StateStore;
    use crate::board::testing::CountingWatchdog;
    use crate::config::RemoteSection;
    use crate::http::testing::{query, Method, ScriptedTransport};
    use crate::identity::IdentityResolver;
    use crate::network::testing::ScriptedNetwork;
    use crate::notify::testing::RecordingNotifier;
    use crate::sensor::testing::ScriptedSensor;
    use crate::sensor::SamplerTiming;
    use tokio::time::Instant;

    const NOON: i64 = 20_098 * 86_400 + 12 * 3_600;

    fn noon() -> i64 {
        NOON
    }

    fn remote() -> RemoteSection {
        RemoteSection {
            config_url: "https://feed.example.com/channels/{channel}/feeds.json".into(),
            config_channel: "1234".into(),
            upload_url: "https://sink.example.com/update".into(),
            api_key: "WRITEKEY".into(),
            ..RemoteSection::default()
        }
    }

    type TestController = CycleController<ScriptedTransport, ScriptedSensor, RecordingNotifier, ScriptedNetwork>;

    fn controller(
        transport: &ScriptedTransport,
        sensor: ScriptedSensor,
        network: ScriptedNetwork,
        dir: &tempfile::TempDir,
    ) -> (TestController, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let identity = IdentityResolver::new(&[]).lookup("aa:bb:cc:dd:ee:ff");
        let parts = Components {
            config: ConfigClient::new(transport.clone(), &remote()),
            sampler: SensorSampler::new(sensor, SamplerTiming::default()),
            uploader: TelemetryUploader::new(transport.clone(), &remote()),
            alerts: AlertEngine::new(notifier.clone(), StateStore::new(dir.path().join("agg.json"))),
            network,
            mirror: None,
        };
        (CycleController::new(identity, parts, ControllerTiming::default(), noon), notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_with_config_failure_uploads_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new();
        t.fail().respond("1");
        let (mut ctl, notifier) = controller(&t, ScriptedSensor::steady(22, 55), ScriptedNetwork::up(), &dir);
        let wd = CountingWatchdog::default();

        let report = ctl.run_cycle(&wd).await.unwrap();

        assert_eq!(report.config, RemoteConfig::default());
        assert_eq!(report.reading.complete(), Some((22, 55)));
        assert_eq!(report.uploaded, Some(true));
        assert_eq!(report.alerts, 0);
        assert!(notifier.sent().is_empty());
        assert_eq!(
            ctl.decide(&report),
            CycleOutcome::Repeat {
                pause: Duration::from_secs(10)
            }
        );

        let reqs = t.requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(query(&reqs[0].url, "results").as_deref(), Some("20"));
        // Unknown zone uploads into the generic first two fields.
        assert_eq!(query(&reqs[1].url, "field1").as_deref(), Some("22"));
        assert_eq!(query(&reqs[1].url, "field2").as_deref(), Some("55"));

        let agg = ctl.parts().alerts.aggregate().unwrap();
        assert_eq!((agg.min_temp, agg.max_hum, agg.alert_count), (22, 55, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn debug_mode_pauses_then_runs_again() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new();
        t.fail().respond("1");
        let (mut ctl, _) = controller(&t, ScriptedSensor::steady(22, 55), ScriptedNetwork::up(), &dir);
        let wd = CountingWatchdog::default();

        // Debug never ends on its own; stop it after the second cycle began.
        let start = Instant::now();
        let res = tokio::time::timeout(Duration::from_secs(30), ctl.run(&wd)).await;
        assert!(res.is_err());

        let reqs = t.requests();
        // config (t=0), upload (t=6 after settle + 4 gaps), next config
        assert!(reqs.len() >= 3);
        assert_eq!(reqs[0].method, Method::Get);
        assert_eq!(reqs[1].at - start, Duration::from_secs(6));
        assert_eq!(reqs[2].at - reqs[1].at, Duration::from_secs(10));
        assert!(reqs[2].url.path().ends_with("feeds.json"));
    }

    #[tokio::test(start_paused = true)]
    async fn production_mode_suspends_for_remote_interval() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new();
        t.respond(r#"{"feeds":[{"field1":"45","field8":"0","field4":"2"}]}"#)
            .respond("7");
        let (mut ctl, _) = controller(&t, ScriptedSensor::steady(22, 55), ScriptedNetwork::up(), &dir);

        let outcome = ctl.run(&CountingWatchdog::default()).await;
        assert_eq!(outcome, Exit::Suspend { minutes: 45 });
        assert_eq!(t.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_sensor_skips_upload_and_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new();
        t.respond(r#"[{"field8":"0"}]"#);
        let (mut ctl, notifier) = controller(&t, ScriptedSensor::new(vec![]), ScriptedNetwork::up(), &dir);

        let report = ctl.run_cycle(&CountingWatchdog::default()).await.unwrap();
        assert_eq!(report.reading, SensorReading::none());
        assert_eq!(report.uploaded, None);
        assert_eq!(t.requests().len(), 1);
        assert!(notifier.sent().is_empty());
        assert!(ctl.parts().alerts.aggregate().is_none());
        assert_eq!(ctl.decide(&report), CycleOutcome::Suspend { minutes: 30 });
    }

    #[tokio::test(start_paused = true)]
    async fn elevated_reading_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new();
        t.fail().respond("1");
        let (mut ctl, notifier) = controller(&t, ScriptedSensor::steady(27, 65), ScriptedNetwork::up(), &dir);

        let report = ctl.run_cycle(&CountingWatchdog::default()).await.unwrap();
        assert_eq!(report.alerts, 2);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn network_timeout_resets() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new();
        let (mut ctl, _) = controller(&t, ScriptedSensor::steady(22, 55), ScriptedNetwork::never(), &dir);

        let outcome = ctl.run(&CountingWatchdog::default()).await;
        assert_eq!(outcome, Exit::Reset);
        assert_eq!(ctl.parts().network.resets, 1);
        assert!(t.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fed_throughout_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let t = ScriptedTransport::new();
        t.fail().respond("1");
        let (mut ctl, _) = controller(&t, ScriptedSensor::steady(22, 55), ScriptedNetwork::up(), &dir);
        let wd = CountingWatchdog::default();

        ctl.run_cycle(&wd).await.unwrap();
        // top 1, after config 1, sampler 2 + 5 samples, upload 1, after alerts 1
        assert_eq!(wd.count(), 11);
    }
}
