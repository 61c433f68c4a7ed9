mod aggregate;
mod alert;
mod board;
mod config;
mod controller;
mod dht11;
mod error;
mod http;
mod identity;
mod mirror;
mod network;
mod notify;
mod remote_config;
mod sensor;
#[cfg(feature = "sim")]
mod sim;
mod upload;

use anyhow::Result;
use std::{env, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aggregate::StateStore;
use alert::AlertEngine;
use config::Config;
use controller::{Components, ControllerTiming, CycleController, Exit};
use http::HttpTransport;
use identity::{IdentityResolver, MacAddress};
use mirror::MqttMirror;
use network::HostNetwork;
use notify::Messenger;
use remote_config::ConfigClient;
use sensor::{SamplerTiming, SensorSampler};
use upload::TelemetryUploader;

#[cfg(not(any(feature = "sim", feature = "gpio")))]
compile_error!("enable the `sim` or `gpio` feature to pick a sensor");

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(feature = "gpio")]
fn open_sensor(cfg: &Config) -> Result<dht11::Dht11> {
    dht11::Dht11::new(cfg.board.power_pin, cfg.board.data_pin)
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
fn open_sensor(cfg: &Config) -> Result<sim::SimSensor> {
    let sensor = sim::SimSensor::new(sim::Scenario::from_str_lossy(&cfg.sensor.sim_scenario));
    info!(scenario = %sensor.scenario(), "using simulated sensor");
    Ok(sensor)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Static config ───────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Boot checks ─────────────────────────────────────────────────
    // Safe mode is decided before anything touches sensors or network.
    if board::safe_mode_requested(&cfg.board) {
        board::park_in_safe_mode();
    }
    let watchdog = board::start_watchdog(&cfg.board)?;

    let identity = IdentityResolver::new(&cfg.zones).resolve(&MacAddress::new(&cfg.board.identity_iface));

    // ── Components ──────────────────────────────────────────────────
    let transport = HttpTransport::new(cfg.remote.http_timeout())?;
    let timing = SamplerTiming {
        stabilize: Duration::from_secs(cfg.sensor.stabilize_secs),
        sample_delay: Duration::from_secs(cfg.sensor.sample_delay_secs),
    };
    let mirror = cfg.mqtt.as_ref().map(MqttMirror::new);
    if mirror.is_none() {
        info!("mqtt mirror disabled");
    }

    let parts = Components {
        config: ConfigClient::new(transport.clone(), &cfg.remote),
        sampler: SensorSampler::new(open_sensor(&cfg)?, timing),
        uploader: TelemetryUploader::new(transport.clone(), &cfg.remote),
        alerts: AlertEngine::new(
            Messenger::new(transport, &cfg.messaging),
            StateStore::new(&cfg.state.path),
        ),
        network: HostNetwork::new(&cfg.network.probe_addr),
        mirror,
    };
    let mut controller = CycleController::new(
        identity,
        parts,
        ControllerTiming {
            debug_pause: Duration::from_secs(cfg.board.debug_pause_secs),
            reconnect_timeout: Duration::from_secs(cfg.network.reconnect_timeout_secs),
        },
        now_unix,
    );

    // ── Cycle ───────────────────────────────────────────────────────
    match controller.run(watchdog.as_ref()).await {
        Exit::Suspend { minutes } => {
            board::deep_sleep(minutes, watchdog.as_ref()).await;
            board::restart_process()
        }
        Exit::Reset => {
            warn!("hard reset");
            board::restart_process()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_returns_positive() {
        assert!(now_unix() > 0);
    }

    #[test]
    fn now_unix_is_recent() {
        let ts = now_unix();
        // Should be after 2024-01-01 (1704067200) and before 2040-01-01 (2208988800)
        assert!(ts > 1_704_067_200, "timestamp too old: {ts}");
        assert!(ts < 2_208_988_800, "timestamp too far in future: {ts}");
    }

    #[test]
    fn now_unix_matches_day_bucket() {
        let ts = now_unix();
        let agg = aggregate::DailyAggregate::start(aggregate::day_index(ts), 0, 0, 0);
        let today = time::OffsetDateTime::now_utc().date();
        assert!(agg.date() == Some(today) || agg.date() == today.previous_day());
    }
}
