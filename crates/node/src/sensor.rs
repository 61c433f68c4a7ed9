//! Power-gated, averaged temperature/humidity acquisition.
//!
//! ```text
//! power on ─▶ settle ─▶ measure ×N (gap between samples) ─▶ release data ─▶ power off
//! ```
//!
//! The data line is released to high impedance before power is cut, or the
//! sensor back-feeds through it.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::board::Watchdog;
use crate::error::SensorError;
use crate::remote_config::{SAMPLES_MAX, SAMPLES_MIN};

/// One raw measurement as reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub temperature: Option<i32>,
    pub humidity: Option<i32>,
}

/// Low-level sensor operations. Implementations block for at most a few
/// milliseconds; the sampler owns all long waits.
pub trait SensorHardware {
    fn power_on(&mut self);
    /// Put the data line in input / high-impedance mode.
    fn release_data_line(&mut self);
    fn power_off(&mut self);
    fn measure(&mut self) -> Result<Measurement, SensorError>;
}

/// Averaged result of one cycle. Both `None` means no valid sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorReading {
    pub temperature: Option<i32>,
    pub humidity: Option<i32>,
}

impl SensorReading {
    #[cfg(test)]
    pub fn none() -> Self {
        Self::default()
    }

    /// Both values, or `None` if the cycle produced no valid sample.
    pub fn complete(&self) -> Option<(i32, i32)> {
        Some((self.temperature?, self.humidity?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerTiming {
    /// Settling time after power-on before the first measurement.
    pub stabilize: Duration,
    /// Gap between consecutive measurements (sensor minimum is ~1 s).
    pub sample_delay: Duration,
}

impl Default for SamplerTiming {
    fn default() -> Self {
        Self {
            stabilize: Duration::from_secs(2),
            sample_delay: Duration::from_secs(1),
        }
    }
}

/// Arithmetic mean rounded half-up (toward +inf on ties).
pub fn rounded_mean(values: &[i32]) -> Option<i32> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as i64;
    let sum: i64 = values.iter().map(|&v| i64::from(v)).sum();
    Some((2 * sum + n).div_euclid(2 * n) as i32)
}

pub struct SensorSampler<H> {
    hardware: H,
    timing: SamplerTiming,
}

impl<H: SensorHardware> SensorSampler<H> {
    pub fn new(hardware: H, timing: SamplerTiming) -> Self {
        Self { hardware, timing }
    }

    /// Power the sensor, take `samples` measurements and average the valid
    /// ones. Failed measurements are dropped from both sums and counts.
    pub async fn read(&mut self, samples: u32, watchdog: &dyn Watchdog) -> SensorReading {
        let samples = samples.clamp(SAMPLES_MIN, SAMPLES_MAX);

        debug!("sensor power on");
        self.hardware.power_on();
        watchdog.feed();
        sleep(self.timing.stabilize).await;
        watchdog.feed();

        let mut temps = Vec::with_capacity(samples as usize);
        let mut hums = Vec::with_capacity(samples as usize);

        for i in 1..=samples {
            watchdog.feed();
            match self.hardware.measure() {
                Ok(Measurement {
                    temperature: Some(t),
                    humidity: Some(h),
                }) => {
                    debug!(sample = i, of = samples, t, h, "sensor sample");
                    temps.push(t);
                    hums.push(h);
                }
                Ok(m) => warn!(sample = i, of = samples, ?m, "partial sample dropped"),
                Err(e) => warn!(sample = i, of = samples, "sensor sample failed: {e}"),
            }

            if i < samples {
                sleep(self.timing.sample_delay).await;
            }
        }

        // Order matters: data line to high-Z first, then cut power.
        self.hardware.release_data_line();
        self.hardware.power_off();
        debug!("sensor power off");

        let reading = SensorReading {
            temperature: rounded_mean(&temps),
            humidity: rounded_mean(&hums),
        };
        match reading.complete() {
            Some((t, h)) => info!(t, h, valid = temps.len(), of = samples, "sensor average"),
            None => warn!(of = samples, "no valid sensor samples this cycle"),
        }
        reading
    }

    #[cfg(test)]
    pub(crate) fn hardware(&self) -> &H {
        &self.hardware
    }
}

// ---------------------------------------------------------------------------
// Scripted hardware for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Op {
        PowerOn,
        Measure,
        ReleaseData,
        PowerOff,
    }

    /// Replays scripted measurements (then repeats `fallback`) and records
    /// the order and time of every operation.
    pub(crate) struct ScriptedSensor {
        script: VecDeque<Result<Measurement, SensorError>>,
        fallback: Option<(i32, i32)>,
        pub(crate) ops: Vec<(Op, Instant)>,
    }

    impl ScriptedSensor {
        pub(crate) fn new(script: Vec<Option<(i32, i32)>>) -> Self {
            Self {
                script: script
                    .into_iter()
                    .map(|s| match s {
                        Some((t, h)) => Ok(Measurement {
                            temperature: Some(t),
                            humidity: Some(h),
                        }),
                        None => Err(SensorError::Checksum {
                            got: 0x00,
                            expected: 0xff,
                        }),
                    })
                    .collect(),
                fallback: None,
                ops: Vec::new(),
            }
        }

        /// Every measurement returns the same values.
        pub(crate) fn steady(t: i32, h: i32) -> Self {
            Self {
                fallback: Some((t, h)),
                ..Self::new(vec![])
            }
        }

        pub(crate) fn op_names(&self) -> Vec<Op> {
            self.ops.iter().map(|(op, _)| *op).collect()
        }
    }

    impl SensorHardware for ScriptedSensor {
        fn power_on(&mut self) {
            self.ops.push((Op::PowerOn, Instant::now()));
        }

        fn release_data_line(&mut self) {
            self.ops.push((Op::ReleaseData, Instant::now()));
        }

        fn power_off(&mut self) {
            self.ops.push((Op::PowerOff, Instant::now()));
        }

        fn measure(&mut self) -> Result<Measurement, SensorError> {
            self.ops.push((Op::Measure, Instant::now()));
            match self.script.pop_front() {
                Some(r) => r,
                None => match self.fallback {
                    Some((t, h)) => Ok(Measurement {
                        temperature: Some(t),
                        humidity: Some(h),
                    }),
                    None => Err(SensorError::NoResponse),
                },
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::{Op, ScriptedSensor};
    use super::*;
    use crate::board::testing::CountingWatchdog;

    fn sampler(sensor: ScriptedSensor) -> SensorSampler<ScriptedSensor> {
        SensorSampler::new(sensor, SamplerTiming::default())
    }

    // -- rounded_mean -----------------------------------------------------

    #[test]
    fn rounded_mean_half_up() {
        assert_eq!(rounded_mean(&[20, 21, 21]), Some(21));
        assert_eq!(rounded_mean(&[20, 21]), Some(21));
        assert_eq!(rounded_mean(&[20, 20, 21]), Some(20));
        assert_eq!(rounded_mean(&[55]), Some(55));
    }

    #[test]
    fn rounded_mean_negative_ties_round_up() {
        assert_eq!(rounded_mean(&[-3, -2]), Some(-2));
        assert_eq!(rounded_mean(&[-3, -3, -2]), Some(-3));
    }

    #[test]
    fn rounded_mean_empty() {
        assert_eq!(rounded_mean(&[]), None);
    }

    #[test]
    fn reading_complete_requires_both() {
        assert_eq!(SensorReading::none().complete(), None);
        let r = SensorReading {
            temperature: Some(20),
            humidity: None,
        };
        assert_eq!(r.complete(), None);
        let r = SensorReading {
            temperature: Some(20),
            humidity: Some(50),
        };
        assert_eq!(r.complete(), Some((20, 50)));
    }

    // -- SensorSampler ----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn failed_samples_are_excluded_from_the_mean() {
        let sensor = ScriptedSensor::new(vec![
            Some((20, 50)),
            None,
            Some((21, 52)),
            None,
            Some((21, 53)),
        ]);
        let wd = CountingWatchdog::default();
        let mut s = sampler(sensor);

        let reading = s.read(5, &wd).await;
        assert_eq!(reading.temperature, Some(21));
        assert_eq!(reading.humidity, Some(52));
        let measures = s.hardware().op_names().iter().filter(|o| **o == Op::Measure).count();
        assert_eq!(measures, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_valid_samples_returns_none() {
        let sensor = ScriptedSensor::new(vec![None, None, None]);
        let wd = CountingWatchdog::default();
        let reading = sampler(sensor).read(3, &wd).await;
        assert_eq!(reading, SensorReading::none());
    }

    #[tokio::test(start_paused = true)]
    async fn data_line_released_before_power_off() {
        let wd = CountingWatchdog::default();
        let mut s = sampler(ScriptedSensor::steady(22, 55));
        s.read(2, &wd).await;
        assert_eq!(
            s.hardware().op_names(),
            vec![Op::PowerOn, Op::Measure, Op::Measure, Op::ReleaseData, Op::PowerOff]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stabilization_and_inter_sample_delays() {
        let wd = CountingWatchdog::default();
        let mut s = sampler(ScriptedSensor::steady(22, 55));
        s.read(3, &wd).await;

        let ops = &s.hardware().ops;
        let on = ops[0].1;
        let measures: Vec<_> = ops.iter().filter(|(o, _)| *o == Op::Measure).map(|(_, t)| *t).collect();
        assert_eq!(measures[0] - on, Duration::from_secs(2));
        assert_eq!(measures[1] - measures[0], Duration::from_secs(1));
        assert_eq!(measures[2] - measures[1], Duration::from_secs(1));
        // No trailing wait after the last sample.
        let off = ops.last().unwrap().1;
        assert_eq!(off, measures[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_count_is_clamped() {
        let wd = CountingWatchdog::default();
        let mut s = sampler(ScriptedSensor::steady(22, 55));
        s.read(0, &wd).await;
        let measures = s.hardware().op_names().iter().filter(|o| **o == Op::Measure).count();
        assert_eq!(measures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fed_during_sampling() {
        let wd = CountingWatchdog::default();
        sampler(ScriptedSensor::steady(22, 55)).read(5, &wd).await;
        // before and after settling, then once per sample
        assert_eq!(wd.count(), 7);
    }
}
