//! Stateful temperature/humidity sensor simulator for local development.
//!
//! Models a DHT11-class sensor in a room:
//! - Temporal coherence via random walk with mean reversion
//! - Integer resolution and the sensor's physical range
//! - Occasional failed reads (checksum errors, no response)
//! - Refuses to measure while unpowered

use std::fmt;

use crate::error::SensorError;
use crate::sensor::{Measurement, SensorHardware};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `sensor.sim_scenario`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Room around 21 C / 50 %, rare failed reads. Stays below the default
    /// thresholds.
    Normal,
    /// Warm, damp room hovering above the default thresholds. Exercises
    /// alerting every cycle.
    Hot,
    /// Normal climate but ~30 % failed reads. Exercises sample dropping.
    Flaky,
    /// Sensor never answers. Exercises the no-reading path.
    Dead,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "flaky" => Self::Flaky,
            "dead" => Self::Dead,
            _ => Self::Normal, // default
        }
    }

    /// (temp centre, hum centre, failure probability)
    fn params(self) -> (f64, f64, f32) {
        match self {
            Self::Normal => (21.0, 50.0, 0.02),
            Self::Hot => (28.0, 68.0, 0.02),
            Self::Flaky => (21.0, 50.0, 0.30),
            Self::Dead => (21.0, 50.0, 1.0),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Hot => write!(f, "hot"),
            Self::Flaky => write!(f, "flaky"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// DHT11 measuring range.
const TEMP_RANGE: (f64, f64) = (0.0, 50.0);
const HUM_RANGE: (f64, f64) = (20.0, 90.0);

pub struct SimSensor {
    scenario: Scenario,
    temp: f64,
    hum: f64,
    temp_center: f64,
    hum_center: f64,
    fail_prob: f32,
    mean_reversion: f64,
    powered: bool,
    data_released: bool,
}

impl SimSensor {
    pub fn new(scenario: Scenario) -> Self {
        let (temp_center, hum_center, fail_prob) = scenario.params();
        Self {
            scenario,
            temp: temp_center + gaussian(0.0, 1.0),
            hum: hum_center + gaussian(0.0, 3.0),
            temp_center,
            hum_center,
            fail_prob,
            mean_reversion: 0.1,
            powered: false,
            data_released: true,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    fn step(&mut self) {
        self.temp += self.mean_reversion * (self.temp_center - self.temp) + gaussian(0.0, 0.3);
        self.hum += self.mean_reversion * (self.hum_center - self.hum) + gaussian(0.0, 1.0);
        self.temp = self.temp.clamp(TEMP_RANGE.0, TEMP_RANGE.1);
        self.hum = self.hum.clamp(HUM_RANGE.0, HUM_RANGE.1);
    }
}

impl SensorHardware for SimSensor {
    fn power_on(&mut self) {
        self.powered = true;
        self.data_released = false;
        tracing::debug!(scenario = %self.scenario, "[sim] sensor powered");
    }

    fn release_data_line(&mut self) {
        self.data_released = true;
    }

    fn power_off(&mut self) {
        if !self.data_released {
            tracing::warn!("[sim] power cut with data line still driven");
        }
        self.powered = false;
    }

    fn measure(&mut self) -> Result<Measurement, SensorError> {
        if !self.powered {
            return Err(SensorError::Unpowered);
        }
        self.step();

        if fastrand::f32() < self.fail_prob {
            return Err(if fastrand::bool() {
                SensorError::NoResponse
            } else {
                SensorError::Checksum {
                    got: fastrand::u8(..),
                    expected: fastrand::u8(..),
                }
            });
        }

        Ok(Measurement {
            temperature: Some(self.temp.round() as i32),
            humidity: Some(self.hum.round() as i32),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
