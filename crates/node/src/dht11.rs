//! DHT11 temperature/humidity sensor on a power-gated supply.
//!
//! One-wire protocol, bit-banged on a GPIO line:
//!
//! ```text
//! host:   ‾‾‾\______18ms______/‾‾ 30us ‾‾ (release, input + pull-up)
//! sensor:                              \__80us__/‾‾80us‾‾\ 40 bits...
//! bit:    \__50us__/‾‾ 26-28us ‾‾\   = 0
//!         \__50us__/‾‾‾‾ 70us ‾‾‾‾\  = 1
//! ```
//!
//! Frame (MSB first): humidity int, humidity dec, temperature int,
//! temperature dec, checksum (low byte of the sum of the first four).
//! Frame decoding is hardware-independent; the pin driver needs `gpio`.

#![cfg_attr(not(feature = "gpio"), allow(dead_code))]

use crate::error::SensorError;
use crate::sensor::Measurement;

/// Bits in one frame.
pub const FRAME_BITS: usize = 40;

/// High pulses longer than this are a `1`.
pub const ONE_THRESHOLD_US: u32 = 50;

/// Pack 40 high-pulse widths (microseconds) into the five frame bytes.
pub fn pack_bits(high_us: &[u32]) -> Result<[u8; 5], SensorError> {
    if high_us.len() != FRAME_BITS {
        return Err(SensorError::Incomplete);
    }
    let mut frame = [0u8; 5];
    for (i, &width) in high_us.iter().enumerate() {
        if width > ONE_THRESHOLD_US {
            frame[i / 8] |= 0x80 >> (i % 8);
        }
    }
    Ok(frame)
}

/// Validate the checksum and extract whole-degree / whole-percent values.
/// Bit 7 of the temperature decimal byte marks a sub-zero reading.
pub fn decode_frame(frame: [u8; 5]) -> Result<Measurement, SensorError> {
    let expected = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if frame[4] != expected {
        return Err(SensorError::Checksum {
            got: frame[4],
            expected,
        });
    }

    let humidity = i32::from(frame[0]);
    let mut temperature = i32::from(frame[2]);
    if frame[3] & 0x80 != 0 {
        temperature = -temperature;
    }
    Ok(Measurement {
        temperature: Some(temperature),
        humidity: Some(humidity),
    })
}

// ---------------------------------------------------------------------------
// Pin driver
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use driver::Dht11;

#[cfg(feature = "gpio")]
mod driver {
    use rppal::gpio::{Gpio, IoPin, Level, Mode, OutputPin, PullUpDown};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::sensor::SensorHardware;

    const START_LOW: Duration = Duration::from_millis(18);
    const START_RELEASE: Duration = Duration::from_micros(30);
    /// Generous bound for any single level in the exchange.
    const LEVEL_TIMEOUT: Duration = Duration::from_micros(120);

    /// DHT11 driver backed by `rppal::gpio`: one output pin gating the
    /// sensor's supply, one bidirectional data pin.
    pub struct Dht11 {
        power: OutputPin,
        data: IoPin,
        powered: bool,
    }

    impl Dht11 {
        pub fn new(power_pin: u8, data_pin: u8) -> anyhow::Result<Self> {
            let gpio = Gpio::new()?;
            let power = gpio.get(power_pin)?.into_output_low();
            let mut data = gpio.get(data_pin)?.into_io(Mode::Input);
            data.set_pullupdown(PullUpDown::PullUp);

            tracing::info!(power_pin, data_pin, "dht11 initialised");
            Ok(Self {
                power,
                data,
                powered: false,
            })
        }

        /// Spin until the line reaches `level`; returns how long that took.
        fn wait_for(&self, level: Level) -> Option<Duration> {
            let start = Instant::now();
            while self.data.read() != level {
                if start.elapsed() > LEVEL_TIMEOUT {
                    return None;
                }
            }
            Some(start.elapsed())
        }

        fn read_frame(&mut self) -> Result<[u8; 5], SensorError> {
            // Start signal.
            self.data.set_mode(Mode::Output);
            self.data.set_low();
            thread::sleep(START_LOW);
            self.data.set_high();
            thread::sleep(START_RELEASE);
            self.data.set_mode(Mode::Input);

            // Response: low 80us, high 80us, then the first bit's low.
            for level in [Level::Low, Level::High, Level::Low] {
                self.wait_for(level).ok_or(SensorError::NoResponse)?;
            }

            let mut widths = Vec::with_capacity(FRAME_BITS);
            for _ in 0..FRAME_BITS {
                self.wait_for(Level::High).ok_or(SensorError::Incomplete)?;
                let high = self.wait_for(Level::Low).ok_or(SensorError::Incomplete)?;
                widths.push(high.as_micros() as u32);
            }
            pack_bits(&widths)
        }
    }

    impl SensorHardware for Dht11 {
        fn power_on(&mut self) {
            self.power.set_high();
            self.powered = true;
        }

        fn release_data_line(&mut self) {
            self.data.set_mode(Mode::Input);
            self.data.set_pullupdown(PullUpDown::Off);
        }

        fn power_off(&mut self) {
            self.power.set_low();
            self.powered = false;
        }

        fn measure(&mut self) -> Result<Measurement, SensorError> {
            if !self.powered {
                return Err(SensorError::Unpowered);
            }
            self.data.set_pullupdown(PullUpDown::PullUp);
            let frame = self.read_frame()?;
            decode_frame(frame)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn widths_for(frame: [u8; 5]) -> Vec<u32> {
        (0..FRAME_BITS)
            .map(|i| if frame[i / 8] & (0x80 >> (i % 8)) != 0 { 70 } else { 27 })
            .collect()
    }

    // -- Bit packing ----------------------------------------------------------

    #[test]
    fn packs_msb_first() {
        let frame = [0x37, 0x00, 0x16, 0x00, 0x4d];
        assert_eq!(pack_bits(&widths_for(frame)).unwrap(), frame);
    }

    #[test]
    fn threshold_boundary_is_zero() {
        let mut widths = vec![27; FRAME_BITS];
        widths[0] = ONE_THRESHOLD_US;
        widths[1] = ONE_THRESHOLD_US + 1;
        let frame = pack_bits(&widths).unwrap();
        assert_eq!(frame[0], 0b0100_0000);
    }

    #[test]
    fn short_frame_is_incomplete() {
        assert!(matches!(pack_bits(&[27; 39]), Err(SensorError::Incomplete)));
    }

    // -- Frame decoding -------------------------------------------------------

    #[test]
    fn decodes_valid_frame() {
        // 55 %, 22 C, checksum 0x37 + 0x16 = 0x4d
        let m = decode_frame([0x37, 0x00, 0x16, 0x00, 0x4d]).unwrap();
        assert_eq!(m.temperature, Some(22));
        assert_eq!(m.humidity, Some(55));
    }

    #[test]
    fn checksum_wraps() {
        let frame = [0xff, 0x01, 0x10, 0x00, 0x10];
        assert!(decode_frame(frame).is_ok());
    }

    #[test]
    fn checksum_mismatch_rejected() {
        match decode_frame([0x37, 0x00, 0x16, 0x00, 0x4c]) {
            Err(SensorError::Checksum { got, expected }) => {
                assert_eq!(got, 0x4c);
                assert_eq!(expected, 0x4d);
            }
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn sign_bit_gives_negative_temperature() {
        let frame = [0x28, 0x00, 0x03, 0x80, 0xab];
        assert_eq!(decode_frame(frame).unwrap().temperature, Some(-3));
    }
}
