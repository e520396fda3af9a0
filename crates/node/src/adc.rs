//! ADS1115 16-bit ADC driver over I2C for the analog probes (light, EC, pH).
//!
//! Reads single-ended channels at PGA ±6.144 V, 128 SPS, single-shot mode,
//! so a probe swinging the full 0–5 V rail stays inside the input range.
//! Results are rescaled to the 10-bit / 5 V count convention the hub's
//! normalization expects.

use anyhow::{anyhow, ensure, Result};

use crate::Channel;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

/// Default 7-bit I2C address (ADDR pin tied to GND).
pub const DEFAULT_ADDR: u16 = 0x48;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       — write 1 to start single-shot conversion
//   [14:12] MUX      — input multiplexer (channel selection)
//   [11:9]  PGA      — programmable gain amplifier
//   [8]     MODE     — 0 = continuous, 1 = single-shot
//   [7:5]   DR       — data rate
//   [4]     COMP_MODE
//   [3]     COMP_POL
//   [2]     COMP_LAT
//   [1:0]   COMP_QUE — 11 = disable comparator (default)

/// Bits common to all channel reads:
///   OS=1 (start), PGA=000 (±6.144 V), MODE=1 (single-shot),
///   DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_000_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: usize = 3;

/// Volts per LSB at PGA ±6.144 V.
const LSB_VOLTS: f64 = 6.144 / 32768.0;

/// The count convention on the wire: 10 bits against a 5 V reference.
const WIRE_COUNTS: f64 = 1024.0;
const WIRE_VREF: f64 = 5.0;

// ── Channel configuration ───────────────────────────────────────────────────

/// Which ADS1115 input carries which analog quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    /// ADS1115 channel index (0 = AIN0, 1 = AIN1, …).
    pub channel: usize,
    pub quantity: Channel,
}

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Rescale a signed 16-bit conversion result to 10-bit counts against 5 V.
pub fn to_wire_counts(raw: i16) -> f64 {
    let volts = f64::from(raw.max(0)) * LSB_VOLTS;
    (volts / WIRE_VREF * WIRE_COUNTS).clamp(0.0, WIRE_COUNTS - 1.0)
}

fn analog_channel(name: &str) -> Option<Channel> {
    match name {
        "light" | "env_light" => Some(Channel::EnvLight),
        "ec" | "water_ec" => Some(Channel::WaterEc),
        "ph" | "water_ph" => Some(Channel::WaterPh),
        _ => None,
    }
}

/// Parse the `ADC_CHANNELS` environment variable.
///
/// Format: comma-separated `quantity=index` pairs, e.g. `"light=0,ec=1,ph=2"`
/// (the default when unset or empty).
pub fn parse_channels(env_val: &str) -> Result<Vec<ChannelMap>> {
    let input = if env_val.trim().is_empty() {
        "light=0,ec=1,ph=2"
    } else {
        env_val
    };
    let mut channels: Vec<ChannelMap> = Vec::new();

    for token in input.split(',') {
        let (name, index) = token
            .split_once('=')
            .ok_or_else(|| anyhow!("expected quantity=index in ADC_CHANNELS, got {token:?}"))?;
        let quantity = analog_channel(name.trim())
            .ok_or_else(|| anyhow!("{:?} is not an analog quantity", name.trim()))?;
        let channel: usize = index
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid channel in ADC_CHANNELS: {token:?}"))?;
        ensure!(
            channel <= MAX_CHANNEL,
            "channel {channel} in ADC_CHANNELS exceeds maximum ({MAX_CHANNEL})"
        );
        ensure!(
            channels.iter().all(|c| c.channel != channel && c.quantity != quantity),
            "duplicate entry in ADC_CHANNELS: {token:?}"
        );
        channels.push(ChannelMap { channel, quantity });
    }

    Ok(channels)
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "hw")]
pub use driver::Ads1115;

#[cfg(feature = "hw")]
mod driver {
    use super::*;
    use crate::Sample;
    use rppal::i2c::I2c;
    use std::{thread, time::Duration};

    /// Conversion time at 128 SPS is ~7.8 ms.  We wait 9 ms for margin.
    const CONVERSION_WAIT: Duration = Duration::from_millis(9);

    /// Bit 15 of the config register: conversion-ready flag when read.
    const OS_READY_BIT: u16 = 1 << 15;

    pub struct Ads1115 {
        i2c: I2c,
        channels: Vec<ChannelMap>,
    }

    impl Ads1115 {
        pub fn new(addr: u16, channels: Vec<ChannelMap>) -> Result<Self> {
            let mut i2c = I2c::new()?;
            i2c.set_slave_address(addr)?;

            tracing::info!(
                addr = format_args!("0x{addr:02x}"),
                channels = ?channels,
                "ads1115 initialised"
            );

            Ok(Self { i2c, channels })
        }

        fn read_channel(&mut self, channel: usize) -> Result<i16> {
            let config = config_for_channel(channel);
            self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

            thread::sleep(CONVERSION_WAIT);

            for _ in 0..3 {
                let mut buf = [0u8; 2];
                self.i2c.block_read(REG_CONFIG, &mut buf)?;
                if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }

            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONVERSION, &mut buf)?;
            Ok(i16::from_be_bytes(buf))
        }

        /// Read every mapped channel.  A failed channel is logged and left out.
        pub fn read_all(&mut self) -> Vec<Sample> {
            let mut samples = Vec::with_capacity(self.channels.len());

            for ch in self.channels.clone() {
                match self.read_channel(ch.channel) {
                    Ok(raw) => samples.push(Sample::new(ch.quantity, to_wire_counts(raw))),
                    Err(e) => tracing::error!(
                        channel = ch.channel,
                        quantity = %ch.quantity,
                        "adc read failed: {e}"
                    ),
                }
            }

            samples
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Config register construction -----------------------------------------

    #[test]
    fn config_register_per_channel() {
        assert_eq!(config_for_channel(0), 0xC183);
        assert_eq!(config_for_channel(1), 0xD183);
        assert_eq!(config_for_channel(2), 0xE183);
        assert_eq!(config_for_channel(3), 0xF183);
    }

    #[test]
    fn config_base_has_full_scale_pga() {
        let pga = (CONFIG_BASE >> 9) & 0b111;
        assert_eq!(pga, 0b000, "PGA should be ±6.144 V");
    }

    #[test]
    fn config_base_is_single_shot_128sps() {
        assert_eq!((CONFIG_BASE >> 8) & 1, 1);
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100);
        assert_eq!((CONFIG_BASE >> 15) & 1, 1);
    }

    // -- Rescaling ------------------------------------------------------------

    #[test]
    fn wire_counts_track_voltage() {
        assert_eq!(to_wire_counts(0), 0.0);
        // 2.5 V -> half scale on the wire.
        let half = (2.5 / LSB_VOLTS).round() as i16;
        assert!((to_wire_counts(half) - 512.0).abs() < 0.1);
    }

    #[test]
    fn wire_counts_clamped() {
        assert_eq!(to_wire_counts(-200), 0.0);
        assert_eq!(to_wire_counts(i16::MAX), 1023.0);
    }

    // -- Channel parsing ------------------------------------------------------

    #[test]
    fn parse_channels_default() {
        let channels = parse_channels("").unwrap();
        assert_eq!(
            channels,
            vec![
                ChannelMap { channel: 0, quantity: Channel::EnvLight },
                ChannelMap { channel: 1, quantity: Channel::WaterEc },
                ChannelMap { channel: 2, quantity: Channel::WaterPh },
            ]
        );
    }

    #[test]
    fn parse_channels_explicit_with_whitespace() {
        let channels = parse_channels(" ph = 3 , water_ec=0 ").unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0], ChannelMap { channel: 3, quantity: Channel::WaterPh });
        assert_eq!(channels[1], ChannelMap { channel: 0, quantity: Channel::WaterEc });
    }

    #[test]
    fn parse_channels_rejects_bad_input() {
        assert!(parse_channels("ph").is_err());
        assert!(parse_channels("ph=x").is_err());
        assert!(parse_channels("ph=4").is_err());
        assert!(parse_channels("ph=-1").is_err());
        assert!(parse_channels("temp=0").is_err());
        assert!(parse_channels("ph=0,ec=0").is_err());
        assert!(parse_channels("ph=0,ph=1").is_err());
    }
}
