//! Sensor normalization: raw transducer samples to calibrated physical units.
//!
//! Every function here is pure and total.  Non-finite inputs produce NaN
//! (or a clamped integer for light) instead of panicking; the caller decides
//! whether a value is usable via [`Normalizer::normalize`].
//!
//! Analog channels (light, EC, pH) arrive as 10-bit ADC counts against a
//! 5 V reference.  Air temperature, humidity and water temperature come
//! from digital transducers that already report °C / % RH.

use serde::Deserialize;

use crate::error::SensorError;
use crate::reading::Quantity;

/// Full-scale count of the 10-bit ADC convention used on the wire.
pub const ADC_COUNTS: f64 = 1024.0;

/// ADC reference voltage.
pub const ADC_VREF: f64 = 5.0;

/// Reference temperature for EC compensation (°C).
const EC_REFERENCE_TEMP_C: f64 = 25.0;

/// Linear EC temperature coefficient (per °C).
const EC_TEMP_COEFFICIENT: f64 = 0.02;

/// pH probe slope (pH per volt).
const PH_SLOPE: f64 = 3.5;

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Where the EC value comes from.
///
/// `Probe` runs the real polynomial.  `Fixed` is the placeholder some
/// deployments use while the probe is uncalibrated; it is selected with a
/// single `ec_fixed_ppm = ...` line in the config file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EcSource {
    Probe,
    Fixed { ppm: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct EcCalibration {
    /// Probe cell constant.
    pub k_value: f64,
    /// EC (µS/cm) to TDS (ppm) conversion factor.
    pub tds_factor: f64,
}

impl Default for EcCalibration {
    fn default() -> Self {
        Self {
            k_value: 1.0,
            tds_factor: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Pure transforms
// ---------------------------------------------------------------------------

/// Round to two decimal places.  NaN stays NaN.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// ADC counts to volts.
pub fn adc_voltage(raw: f64) -> f64 {
    raw * ADC_VREF / ADC_COUNTS
}

/// Light level as an integer percent in `0..=100`.
pub fn env_light(raw: f64) -> u8 {
    // `as u8` saturates and maps NaN to 0.
    (raw / ADC_COUNTS * 100.0).round().clamp(0.0, 100.0) as u8
}

pub fn env_temp(celsius: f64) -> f64 {
    round2(celsius)
}

pub fn env_humidity(relative_humidity: f64) -> f64 {
    round2(relative_humidity)
}

pub fn water_temp(celsius: f64) -> f64 {
    round2(celsius)
}

/// Temperature-compensated EC expressed as TDS ppm.
///
/// `water_temp_c` is the current water temperature; pass NaN when it is
/// unknown and the result is NaN.
pub fn water_ec(raw: f64, water_temp_c: f64, cal: &EcCalibration) -> f64 {
    let v = adc_voltage(raw);
    let ec = (133.42 * v * v * v - 255.86 * v * v + 857.39 * v) * cal.k_value;
    let ec25 = ec / (1.0 + EC_TEMP_COEFFICIENT * (water_temp_c - EC_REFERENCE_TEMP_C));
    round2(ec25 * cal.tds_factor)
}

pub fn water_ph(raw: f64, offset: f64) -> f64 {
    round2(PH_SLOPE * adc_voltage(raw) + offset)
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Calibration bundle that maps a raw sample for any quantity to its
/// normalized value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    pub ec_source: EcSource,
    pub ec: EcCalibration,
    pub ph_offset: f64,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            ec_source: EcSource::Probe,
            ec: EcCalibration::default(),
            ph_offset: 0.75,
        }
    }
}

impl Normalizer {
    /// Normalize `raw` for `quantity`.  `water_temp_c` is only consulted for
    /// EC compensation.
    pub fn normalize(
        &self,
        quantity: Quantity,
        raw: f64,
        water_temp_c: Option<f64>,
    ) -> Result<f64, SensorError> {
        let value = match quantity {
            Quantity::EnvLight if raw.is_finite() => f64::from(env_light(raw)),
            Quantity::EnvLight => f64::NAN,
            Quantity::EnvTemp => env_temp(raw),
            Quantity::EnvHumidity => env_humidity(raw),
            Quantity::WaterTemp => water_temp(raw),
            Quantity::WaterEc => match self.ec_source {
                EcSource::Fixed { ppm } => ppm,
                EcSource::Probe => water_ec(raw, water_temp_c.unwrap_or(f64::NAN), &self.ec),
            },
            Quantity::WaterPh => water_ph(raw, self.ph_offset),
        };

        if value.is_finite() && quantity.physical_range().contains(&value) {
            Ok(value)
        } else {
            Err(SensorError::InvalidReading { quantity, value })
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
