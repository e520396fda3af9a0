//! TOML config file loading and validation: thresholds, relay pin map,
//! tick cadences, actuator timing and sensor calibration.
//!
//! Every section is optional; omitted values fall back to the defaults of
//! a single-box deployment.  The file is read once at startup and never
//! reloaded.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::normalize::{EcCalibration, EcSource, Normalizer};
use crate::reading::Quantity;
use crate::relay::Actuator;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub thresholds: Thresholds,
    pub relays: RelayPins,
    pub cadence: Cadence,
    pub timing: Timing,
    pub calibration: Calibration,
    pub persistence: Persistence,
}

/// Static hysteresis bounds.  A missing bound means no corrective action
/// exists in that direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdBand {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ThresholdBand {
    pub const fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    pub env_temp: ThresholdBand,
    pub env_humidity: ThresholdBand,
    /// No water cooling hardware, so only `min` is acted on.
    pub water_temp: ThresholdBand,
    /// No dilution path, so only `min` is acted on.
    pub water_ec: ThresholdBand,
    pub water_ph: ThresholdBand,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            env_temp: ThresholdBand::new(Some(20.0), Some(27.0)),
            env_humidity: ThresholdBand::new(Some(40.0), Some(60.0)),
            water_temp: ThresholdBand::new(Some(18.0), None),
            water_ec: ThresholdBand::new(Some(400.0), None),
            water_ph: ThresholdBand::new(Some(5.2), Some(6.8)),
        }
    }
}

impl Thresholds {
    /// Band for a regulated quantity; light is monitored only.
    pub fn band(&self, quantity: Quantity) -> Option<ThresholdBand> {
        match quantity {
            Quantity::EnvLight => None,
            Quantity::EnvTemp => Some(self.env_temp),
            Quantity::EnvHumidity => Some(self.env_humidity),
            Quantity::WaterTemp => Some(self.water_temp),
            Quantity::WaterEc => Some(self.water_ec),
            Quantity::WaterPh => Some(self.water_ph),
        }
    }
}

/// Actuator -> BCM GPIO pin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RelayPins(pub BTreeMap<Actuator, i64>);

impl Default for RelayPins {
    fn default() -> Self {
        Self(BTreeMap::from([
            (Actuator::Indicator, 3),
            (Actuator::PumpNutrients1, 4),
            (Actuator::PumpNutrients2, 5),
            (Actuator::PumpPhDown, 6),
            (Actuator::PumpPhUp, 7),
            (Actuator::FanHeater, 8),
            (Actuator::FanCooler, 9),
            (Actuator::HeatingPad, 10),
            (Actuator::Mister, 11),
        ]))
    }
}

impl RelayPins {
    /// Pin map in the shape the relay board wants.  Only meaningful after
    /// validation has confirmed every pin is a valid BCM number.
    pub fn pin_map(&self) -> Vec<(Actuator, u8)> {
        self.0
            .iter()
            .filter_map(|(a, p)| u8::try_from(*p).ok().map(|p| (*a, p)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Cadence {
    /// Air climate + water temperature regulation.
    pub climate_sec: u64,
    /// EC / pH dosing.
    pub chemistry_sec: u64,
    /// Reading snapshot + persistence.
    pub emission_sec: u64,
    /// When false, the climate tick regulates everything and no separate
    /// chemistry tick runs.
    pub chemistry_separate: bool,
    /// Raw samples older than this are treated as unavailable.
    pub stale_after_sec: u64,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            climate_sec: 300,
            chemistry_sec: 600,
            emission_sec: 900,
            chemistry_separate: true,
            stale_after_sec: 120,
        }
    }
}

/// Auto-revert durations for duty-limited actuators, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timing {
    pub heater_ms: u64,
    pub mister_ms: u64,
    pub nutrient_pulse_ms: u64,
    pub ph_up_pulse_ms: u64,
    pub ph_down_pulse_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heater_ms: 15_000,
            mister_ms: 15_000,
            nutrient_pulse_ms: 20,
            ph_up_pulse_ms: 25,
            ph_down_pulse_ms: 20,
        }
    }
}

impl Timing {
    /// Auto-revert window for `actuator`, or `None` for level-held ones.
    pub fn duty_limit(&self, actuator: Actuator) -> Option<Duration> {
        let ms = match actuator {
            Actuator::FanHeater => self.heater_ms,
            Actuator::Mister => self.mister_ms,
            Actuator::PumpNutrients1 | Actuator::PumpNutrients2 => self.nutrient_pulse_ms,
            Actuator::PumpPhUp => self.ph_up_pulse_ms,
            Actuator::PumpPhDown => self.ph_down_pulse_ms,
            Actuator::FanCooler | Actuator::HeatingPad | Actuator::Indicator => return None,
        };
        Some(Duration::from_millis(ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Calibration {
    pub ph_offset: f64,
    pub ec_k_value: f64,
    pub tds_factor: f64,
    /// Placeholder EC value used instead of the probe.  Leave unset to run
    /// the real conversion.
    pub ec_fixed_ppm: Option<f64>,
}

impl Default for Calibration {
    fn default() -> Self {
        let ec = EcCalibration::default();
        Self {
            ph_offset: 0.75,
            ec_k_value: ec.k_value,
            tds_factor: ec.tds_factor,
            ec_fixed_ppm: None,
        }
    }
}

impl Calibration {
    pub fn normalizer(&self) -> Normalizer {
        Normalizer {
            ec_source: match self.ec_fixed_ppm {
                Some(ppm) => EcSource::Fixed { ppm },
                None => EcSource::Probe,
            },
            ec: EcCalibration {
                k_value: self.ec_k_value,
                tds_factor: self.tds_factor,
            },
            ph_offset: self.ph_offset,
        }
    }
}

/// With `enabled = false` no reading is ever stored and the history
/// routes are not served.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Persistence {
    pub enabled: bool,
}

impl Default for Persistence {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_thresholds(&mut errors);
        self.validate_relays(&mut errors);
        self.validate_cadence(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_calibration(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        for q in Quantity::ALL {
            let Some(band) = self.thresholds.band(q) else {
                continue;
            };
            for (label, bound) in [("min", band.min), ("max", band.max)] {
                if let Some(v) = bound {
                    if !v.is_finite() {
                        errors.push(format!("thresholds.{q}: {label} must be finite, got {v}"));
                    } else if !q.physical_range().contains(&v) {
                        let r = q.physical_range();
                        errors.push(format!(
                            "thresholds.{q}: {label} {v} outside physical range [{}, {}]",
                            r.start(),
                            r.end()
                        ));
                    }
                }
            }
            if let (Some(min), Some(max)) = (band.min, band.max) {
                if min >= max {
                    errors.push(format!(
                        "thresholds.{q}: min ({min}) must be less than max ({max})"
                    ));
                }
            }
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for actuator in Actuator::ALL {
            let Some(&pin) = self.relays.0.get(&actuator) else {
                errors.push(format!("relays: no pin mapped for {actuator}"));
                continue;
            };
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "relays.{actuator}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "relays.{actuator}: pin {pin} is already used by another relay"
                ));
            }
        }
    }

    fn validate_cadence(&self, errors: &mut Vec<String>) {
        let c = &self.cadence;
        for (label, v) in [
            ("climate_sec", c.climate_sec),
            ("chemistry_sec", c.chemistry_sec),
            ("emission_sec", c.emission_sec),
            ("stale_after_sec", c.stale_after_sec),
        ] {
            if v == 0 {
                errors.push(format!("cadence.{label} must be positive"));
            }
        }
        if c.chemistry_separate && c.chemistry_sec > 0 && c.chemistry_sec < c.climate_sec {
            errors.push(format!(
                "cadence.chemistry_sec ({}) must not be shorter than climate_sec ({})",
                c.chemistry_sec, c.climate_sec
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        for (label, v) in [
            ("heater_ms", t.heater_ms),
            ("mister_ms", t.mister_ms),
            ("nutrient_pulse_ms", t.nutrient_pulse_ms),
            ("ph_up_pulse_ms", t.ph_up_pulse_ms),
            ("ph_down_pulse_ms", t.ph_down_pulse_ms),
        ] {
            if v == 0 {
                errors.push(format!("timing.{label} must be positive"));
            }
        }
        // A duty-limited actuator held longer than a climate tick would
        // never actually be limited.
        let tick_ms = self.cadence.climate_sec.saturating_mul(1000);
        for (label, v) in [("heater_ms", t.heater_ms), ("mister_ms", t.mister_ms)] {
            if tick_ms > 0 && v >= tick_ms {
                errors.push(format!(
                    "timing.{label} ({v}) must be shorter than the climate tick ({tick_ms} ms)"
                ));
            }
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        let c = &self.calibration;
        if !c.ph_offset.is_finite() {
            errors.push(format!("calibration.ph_offset must be finite, got {}", c.ph_offset));
        }
        if !(c.ec_k_value.is_finite() && c.ec_k_value > 0.0) {
            errors.push(format!(
                "calibration.ec_k_value must be positive, got {}",
                c.ec_k_value
            ));
        }
        if !(c.tds_factor.is_finite() && c.tds_factor > 0.0) {
            errors.push(format!(
                "calibration.tds_factor must be positive, got {}",
                c.tds_factor
            ));
        }
        if let Some(ppm) = c.ec_fixed_ppm {
            if !Quantity::WaterEc.physical_range().contains(&ppm) {
                errors.push(format!(
                    "calibration.ec_fixed_ppm {ppm} outside physical range"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate a TOML config document.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config = parse(&contents).with_context(|| format!("invalid config: {path}"))?;

    if config.calibration.ec_fixed_ppm.is_some() {
        tracing::warn!(
            ppm = config.calibration.ec_fixed_ppm,
            "EC probe bypassed: using fixed placeholder value"
        );
    }
    tracing::info!(
        path,
        climate_sec = config.cadence.climate_sec,
        chemistry_sec = config.cadence.chemistry_sec,
        emission_sec = config.cadence.emission_sec,
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[thresholds]
env_temp = { min = 19.5, max = 26.0 }
env_humidity = { min = 45.0, max = 65.0 }
water_temp = { min = 17.0 }
water_ec = { min = 500.0 }
water_ph = { min = 5.5, max = 6.5 }

[relays]
indicator = 3
pump_nutrients1 = 4
pump_nutrients2 = 5
pump_ph_down = 6
pump_ph_up = 7
fan_heater = 8
fan_cooler = 9
heating_pad = 10
mister = 11

[cadence]
climate_sec = 60
chemistry_sec = 120
emission_sec = 300
chemistry_separate = false
stale_after_sec = 30

[timing]
heater_ms = 10000
ph_up_pulse_ms = 40

[calibration]
ph_offset = 0.5
ec_fixed_ppm = 1000.0
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.thresholds.env_temp, ThresholdBand::new(Some(19.5), Some(26.0)));
        assert_eq!(config.thresholds.water_ec.max, None);
        assert_eq!(config.relays.0[&Actuator::Mister], 11);
        assert!(!config.cadence.chemistry_separate);
        assert_eq!(config.timing.heater_ms, 10_000);
        assert_eq!(config.timing.mister_ms, 15_000); // default kept
        assert_eq!(config.timing.ph_up_pulse_ms, 40);
        assert_eq!(
            config.calibration.normalizer().ec_source,
            EcSource::Fixed { ppm: 1000.0 }
        );
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.cadence, Cadence::default());
        assert_eq!(config.relays.pin_map().len(), Actuator::ALL.len());
        assert_eq!(config.calibration.normalizer(), Normalizer::default());
    }

    #[test]
    fn parse_partial_thresholds_keeps_other_defaults() {
        let config = parse("[thresholds]\nwater_ph = { min = 5.8, max = 6.2 }\n").unwrap();
        assert_eq!(config.thresholds.water_ph, ThresholdBand::new(Some(5.8), Some(6.2)));
        assert_eq!(config.thresholds.env_temp, Thresholds::default().env_temp);
    }

    #[test]
    fn parse_unknown_section_rejected() {
        assert!(parse("[influx]\nbucket = \"maya\"\n").is_err());
    }

    #[test]
    fn parse_unknown_actuator_rejected() {
        assert!(parse("[relays]\nsprinkler = 12\n").is_err());
    }

    // -- Thresholds -------------------------------------------------------

    #[test]
    fn persistence_enabled_by_default_and_can_be_switched_off() {
        assert!(parse("").unwrap().persistence.enabled);
        let cfg = parse("[persistence]\nenabled = false\n").unwrap();
        assert!(!cfg.persistence.enabled);
    }

    #[test]
    fn default_config_passes() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn threshold_min_must_be_below_max() {
        let mut cfg = Config::default();
        cfg.thresholds.water_ph = ThresholdBand::new(Some(6.8), Some(5.2));
        assert_validation_err(&cfg, "thresholds.water_ph: min (6.8) must be less than max (5.2)");
    }

    #[test]
    fn threshold_equal_bounds_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.env_temp = ThresholdBand::new(Some(22.0), Some(22.0));
        assert_validation_err(&cfg, "must be less than max");
    }

    #[test]
    fn threshold_nan_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.env_humidity.max = Some(f64::NAN);
        assert_validation_err(&cfg, "thresholds.env_humidity: max must be finite");
    }

    #[test]
    fn threshold_outside_physical_range_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.water_ph.max = Some(15.0);
        assert_validation_err(&cfg, "outside physical range");
    }

    #[test]
    fn threshold_open_bands_accepted() {
        let mut cfg = Config::default();
        cfg.thresholds.env_humidity = ThresholdBand::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn light_has_no_band() {
        assert_eq!(Thresholds::default().band(Quantity::EnvLight), None);
    }

    // -- Relays -----------------------------------------------------------

    #[test]
    fn relay_missing_mapping_rejected() {
        let mut cfg = Config::default();
        cfg.relays.0.remove(&Actuator::PumpPhUp);
        assert_validation_err(&cfg, "no pin mapped for pump_ph_up");
    }

    #[test]
    fn relay_gpio_pin_1_rejected() {
        let mut cfg = Config::default();
        cfg.relays.0.insert(Actuator::Mister, 1);
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn relay_gpio_pin_28_rejected() {
        let mut cfg = Config::default();
        cfg.relays.0.insert(Actuator::Mister, 28);
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn relay_duplicate_pin_rejected() {
        let mut cfg = Config::default();
        cfg.relays.0.insert(Actuator::Mister, 8); // heater's pin
        assert_validation_err(&cfg, "already used by another relay");
    }

    // -- Cadence / timing ---------------------------------------------------

    #[test]
    fn cadence_zero_rejected() {
        let mut cfg = Config::default();
        cfg.cadence.emission_sec = 0;
        assert_validation_err(&cfg, "cadence.emission_sec must be positive");
    }

    #[test]
    fn chemistry_faster_than_climate_rejected() {
        let mut cfg = Config::default();
        cfg.cadence.chemistry_sec = 60;
        assert_validation_err(&cfg, "must not be shorter than climate_sec");
    }

    #[test]
    fn chemistry_cadence_ignored_when_not_separate() {
        let mut cfg = Config::default();
        cfg.cadence.chemistry_separate = false;
        cfg.cadence.chemistry_sec = 60;
        cfg.validate().unwrap();
    }

    #[test]
    fn timing_zero_pulse_rejected() {
        let mut cfg = Config::default();
        cfg.timing.ph_down_pulse_ms = 0;
        assert_validation_err(&cfg, "timing.ph_down_pulse_ms must be positive");
    }

    #[test]
    fn heater_longer_than_tick_rejected() {
        let mut cfg = Config::default();
        cfg.cadence.climate_sec = 10;
        assert_validation_err(&cfg, "timing.heater_ms (15000) must be shorter than the climate tick");
    }

    #[test]
    fn duty_limits_match_actuator_kinds() {
        let t = Timing::default();
        assert_eq!(t.duty_limit(Actuator::FanHeater), Some(Duration::from_secs(15)));
        assert_eq!(t.duty_limit(Actuator::PumpPhUp), Some(Duration::from_millis(25)));
        assert_eq!(t.duty_limit(Actuator::FanCooler), None);
        assert_eq!(t.duty_limit(Actuator::HeatingPad), None);
        assert_eq!(t.duty_limit(Actuator::Indicator), None);
    }

    // -- Calibration --------------------------------------------------------

    #[test]
    fn calibration_negative_tds_factor_rejected() {
        let mut cfg = Config::default();
        cfg.calibration.tds_factor = -0.5;
        assert_validation_err(&cfg, "tds_factor must be positive");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.thresholds.env_temp = ThresholdBand::new(Some(30.0), Some(10.0));
        cfg.relays.0.insert(Actuator::FanCooler, 0);
        cfg.cadence.climate_sec = 0;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("thresholds.env_temp"), "missing threshold error in: {msg}");
        assert!(msg.contains("not a valid BCM GPIO pin"), "missing gpio error in: {msg}");
        assert!(msg.contains("climate_sec must be positive"), "missing cadence error in: {msg}");
    }
}
