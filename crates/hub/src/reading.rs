//! Measured quantities and the immutable `Reading` snapshot produced by the
//! normalization pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Quantity
// ---------------------------------------------------------------------------

/// One measured quantity.  The serialized form is the measurement name used
/// on the wire, in the store, and in HTTP paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    EnvLight,
    EnvTemp,
    EnvHumidity,
    WaterTemp,
    WaterEc,
    WaterPh,
}

impl Quantity {
    pub const ALL: [Quantity; 6] = [
        Quantity::EnvLight,
        Quantity::EnvTemp,
        Quantity::EnvHumidity,
        Quantity::WaterTemp,
        Quantity::WaterEc,
        Quantity::WaterPh,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Quantity::EnvLight => "env_light",
            Quantity::EnvTemp => "env_temp",
            Quantity::EnvHumidity => "env_humidity",
            Quantity::WaterTemp => "water_temp",
            Quantity::WaterEc => "water_ec",
            Quantity::WaterPh => "water_ph",
        }
    }

    /// Plausible bounds for a normalized value.  Anything outside (or
    /// non-finite) is an invalid reading.
    pub fn physical_range(self) -> RangeInclusive<f64> {
        match self {
            Quantity::EnvLight => 0.0..=100.0,
            Quantity::EnvTemp => -40.0..=125.0,
            Quantity::EnvHumidity => 0.0..=100.0,
            Quantity::WaterTemp => -55.0..=125.0,
            Quantity::WaterEc => 0.0..=10_000.0,
            Quantity::WaterPh => 0.0..=14.0,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Quantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::ALL
            .into_iter()
            .find(|q| q.name() == s)
            .ok_or_else(|| format!("unknown measurement '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Normalized values at one sampling instant.  `None` means the quantity was
/// unavailable or invalid when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub env_light: Option<u8>,
    pub env_temp: Option<f64>,
    pub env_humidity: Option<f64>,
    pub water_temp: Option<f64>,
    pub water_ec: Option<f64>,
    pub water_ph: Option<f64>,
}

impl Reading {
    pub fn empty(ts: OffsetDateTime) -> Self {
        Self {
            ts,
            env_light: None,
            env_temp: None,
            env_humidity: None,
            water_temp: None,
            water_ec: None,
            water_ph: None,
        }
    }

    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        match quantity {
            Quantity::EnvLight => self.env_light.map(f64::from),
            Quantity::EnvTemp => self.env_temp,
            Quantity::EnvHumidity => self.env_humidity,
            Quantity::WaterTemp => self.water_temp,
            Quantity::WaterEc => self.water_ec,
            Quantity::WaterPh => self.water_ph,
        }
    }

    pub(crate) fn set(&mut self, quantity: Quantity, value: f64) {
        match quantity {
            Quantity::EnvLight => self.env_light = Some(value.round().clamp(0.0, 100.0) as u8),
            Quantity::EnvTemp => self.env_temp = Some(value),
            Quantity::EnvHumidity => self.env_humidity = Some(value),
            Quantity::WaterTemp => self.water_temp = Some(value),
            Quantity::WaterEc => self.water_ec = Some(value),
            Quantity::WaterPh => self.water_ph = Some(value),
        }
    }

    /// Present values in `Quantity::ALL` order.
    pub fn measurements(&self) -> impl Iterator<Item = (Quantity, f64)> + '_ {
        Quantity::ALL
            .into_iter()
            .filter_map(|q| self.get(q).map(|v| (q, v)))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_names_round_trip_through_from_str() {
        for q in Quantity::ALL {
            assert_eq!(q.name().parse::<Quantity>().unwrap(), q);
        }
    }

    #[test]
    fn quantity_from_str_unknown() {
        assert!("soil_moisture".parse::<Quantity>().is_err());
        assert!("".parse::<Quantity>().is_err());
    }

    #[test]
    fn quantity_serde_uses_measurement_name() {
        let json = serde_json::to_string(&Quantity::WaterPh).unwrap();
        assert_eq!(json, "\"water_ph\"");
        let q: Quantity = serde_json::from_str("\"env_humidity\"").unwrap();
        assert_eq!(q, Quantity::EnvHumidity);
    }

    #[test]
    fn physical_range_rejects_impossible_ph() {
        assert!(!Quantity::WaterPh.physical_range().contains(&15.0));
        assert!(Quantity::WaterPh.physical_range().contains(&7.0));
    }

    #[test]
    fn measurements_skips_missing_values() {
        let mut r = Reading::empty(OffsetDateTime::UNIX_EPOCH);
        r.set(Quantity::EnvTemp, 23.5);
        r.set(Quantity::WaterPh, 6.1);
        let got: Vec<_> = r.measurements().collect();
        assert_eq!(got, vec![(Quantity::EnvTemp, 23.5), (Quantity::WaterPh, 6.1)]);
    }

    #[test]
    fn light_is_stored_as_integer_percent() {
        let mut r = Reading::empty(OffsetDateTime::UNIX_EPOCH);
        r.set(Quantity::EnvLight, 49.6);
        assert_eq!(r.env_light, Some(50));
        assert_eq!(r.get(Quantity::EnvLight), Some(50.0));
    }

    #[test]
    fn reading_serializes_rfc3339_timestamp() {
        let r = Reading::empty(OffsetDateTime::UNIX_EPOCH);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["ts"], "1970-01-01T00:00:00Z");
        assert!(json["water_ec"].is_null());
    }
}
