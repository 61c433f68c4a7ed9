//! Rate-limited, retrying delivery of one reading to the telemetry sink.
//!
//! The sink takes `GET <upload_url>?key=<api_key>&<temp_field>=<t>&<hum_field>=<h>`
//! and answers a plain-text entry id, or `0` when it refuses the update.
//! Nothing is queued: after the last failed attempt the reading is dropped.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::board::Watchdog;
use crate::config::RemoteSection;
use crate::error::UploadError;
use crate::http::{build_url, Transport};
use crate::identity::DeviceIdentity;

pub const MAX_ATTEMPTS: u32 = 3;

/// Minimum gap between two requests to the sink, attempted or successful.
pub const MIN_UPLOAD_SPACING: Duration = Duration::from_secs(16);

const THROTTLE_STEP: Duration = Duration::from_secs(1);

/// When the sink was last hit. Lives for the process; a deep sleep starts
/// it over empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct UploadThrottleState {
    last_upload: Option<Instant>,
}

impl UploadThrottleState {
    /// Block until the spacing window has passed, one step at a time,
    /// feeding the watchdog at every step.
    async fn wait_turn(&self, watchdog: &dyn Watchdog) {
        let Some(last) = self.last_upload else {
            watchdog.feed();
            return;
        };
        let ready_at = last + MIN_UPLOAD_SPACING;
        let mut announced = false;
        loop {
            watchdog.feed();
            let now = Instant::now();
            if now >= ready_at {
                return;
            }
            if !announced {
                debug!(wait_ms = (ready_at - now).as_millis() as u64, "upload throttled");
                announced = true;
            }
            sleep((ready_at - now).min(THROTTLE_STEP)).await;
        }
    }

    fn mark(&mut self) {
        self.last_upload = Some(Instant::now());
    }
}

pub struct TelemetryUploader<T> {
    transport: T,
    upload_url: String,
    api_key: String,
}

impl<T: Transport> TelemetryUploader<T> {
    pub fn new(transport: T, remote: &RemoteSection) -> Self {
        Self {
            transport,
            upload_url: remote.upload_url.clone(),
            api_key: remote.api_key.clone(),
        }
    }

    /// Deliver one reading. `true` once the sink accepts it, `false` after
    /// [`MAX_ATTEMPTS`] transport failures or rejections.
    pub async fn send(
        &self,
        throttle: &mut UploadThrottleState,
        identity: &DeviceIdentity,
        temperature: i32,
        humidity: i32,
        watchdog: &dyn Watchdog,
    ) -> bool {
        for attempt in 1..=MAX_ATTEMPTS {
            throttle.wait_turn(watchdog).await;

            let result = self.attempt(identity, temperature, humidity).await;
            throttle.mark();

            match result {
                Ok(entry) => {
                    info!(zone = %identity.zone.name, attempt, entry = %entry, "reading uploaded");
                    return true;
                }
                Err(e) => warn!(zone = %identity.zone.name, attempt, of = MAX_ATTEMPTS, "upload failed: {e}"),
            }
        }
        warn!(zone = %identity.zone.name, "reading dropped after {MAX_ATTEMPTS} attempts");
        false
    }

    async fn attempt(&self, identity: &DeviceIdentity, temperature: i32, humidity: i32) -> Result<String, UploadError> {
        let fields = &identity.zone.data_fields;
        let url = build_url(
            &self.upload_url,
            &[
                ("key", self.api_key.clone()),
                (fields.temp.as_str(), temperature.to_string()),
                (fields.hum.as_str(), humidity.to_string()),
            ],
        )?;

        let body = self.transport.get(&url).await?;
        let body = body.trim();
        if body == "0" {
            return Err(UploadError::Rejected);
        }
        Ok(body.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
