//! SHT31 air temperature / humidity sensor over I2C.
//!
//! Single-shot, high repeatability, no clock stretching.  Each measurement
//! returns two big-endian words, each followed by a CRC-8 byte.

use anyhow::{ensure, Result};

/// Default 7-bit I2C address (ADDR pin low).
pub const DEFAULT_ADDR: u16 = 0x44;

/// Measure command: high repeatability, clock stretching disabled.
const CMD_MEASURE_HIGH: [u8; 2] = [0x24, 0x00];

/// CRC-8 polynomial x^8 + x^5 + x^4 + 1, initial value 0xFF.
const CRC_POLY: u8 = 0x31;
const CRC_INIT: u8 = 0xFF;

pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC_INIT;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decode a 6-byte measurement frame into (°C, % RH).
pub fn decode(frame: &[u8; 6]) -> Result<(f64, f64)> {
    ensure!(crc8(&frame[0..2]) == frame[2], "sht31 temperature crc mismatch");
    ensure!(crc8(&frame[3..5]) == frame[5], "sht31 humidity crc mismatch");

    let t_raw = f64::from(u16::from_be_bytes([frame[0], frame[1]]));
    let rh_raw = f64::from(u16::from_be_bytes([frame[3], frame[4]]));

    let celsius = -45.0 + 175.0 * t_raw / 65535.0;
    let humidity = (100.0 * rh_raw / 65535.0).clamp(0.0, 100.0);
    Ok((celsius, humidity))
}

#[cfg(feature = "hw")]
pub use driver::Sht31;

#[cfg(feature = "hw")]
mod driver {
    use super::*;
    use rppal::i2c::I2c;
    use std::{thread, time::Duration};

    /// Max measurement duration at high repeatability is 15.5 ms.
    const MEASURE_WAIT: Duration = Duration::from_millis(16);

    pub struct Sht31 {
        i2c: I2c,
    }

    impl Sht31 {
        pub fn new(addr: u16) -> Result<Self> {
            let mut i2c = I2c::new()?;
            i2c.set_slave_address(addr)?;
            tracing::info!(addr = format_args!("0x{addr:02x}"), "sht31 initialised");
            Ok(Self { i2c })
        }

        /// One measurement as (°C, % RH).
        pub fn read(&mut self) -> Result<(f64, f64)> {
            self.i2c.write(&CMD_MEASURE_HIGH)?;
            thread::sleep(MEASURE_WAIT);
            let mut frame = [0u8; 6];
            self.i2c.read(&mut frame)?;
            decode(&frame)
        }
    }
}
