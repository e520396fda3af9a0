//! Relay control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock board records state and logs changes.
//!
//! Both boards force every relay OFF when constructed and again when
//! dropped, so the process never exits with an actuator energised.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Actuator identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    PumpNutrients1,
    PumpNutrients2,
    PumpPhDown,
    PumpPhUp,
    FanHeater,
    FanCooler,
    HeatingPad,
    Mister,
    /// Status LED: lit while the enclosure needs intervention.
    Indicator,
}

impl Actuator {
    pub const ALL: [Actuator; 9] = [
        Actuator::PumpNutrients1,
        Actuator::PumpNutrients2,
        Actuator::PumpPhDown,
        Actuator::PumpPhUp,
        Actuator::FanHeater,
        Actuator::FanCooler,
        Actuator::HeatingPad,
        Actuator::Mister,
        Actuator::Indicator,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Actuator::PumpNutrients1 => "pump_nutrients1",
            Actuator::PumpNutrients2 => "pump_nutrients2",
            Actuator::PumpPhDown => "pump_ph_down",
            Actuator::PumpPhUp => "pump_ph_up",
            Actuator::FanHeater => "fan_heater",
            Actuator::FanCooler => "fan_cooler",
            Actuator::HeatingPad => "heating_pad",
            Actuator::Mister => "mister",
            Actuator::Indicator => "indicator",
        }
    }

    /// Everything except the status indicator.
    pub fn is_corrective(self) -> bool {
        self != Actuator::Indicator
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Actuator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Actuator::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| format!("unknown actuator '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Sink seam
// ---------------------------------------------------------------------------

/// Side-effect-only relay output.  `set` must be idempotent.
pub trait ActuatorSink: Send + 'static {
    fn set(&mut self, actuator: Actuator, on: bool) -> Result<()>;
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal and a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: HashMap<Actuator, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(pin_map: &[(Actuator, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (actuator, pin_num) in pin_map {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Keep the pin driven after drop; a floating input would let an
            // active-low relay click on.
            pin.set_reset_on_drop(false);
            pins.insert(*actuator, pin);
        }

        let mut board = Self { pins, active_low };
        board.all_off();
        Ok(board)
    }

    fn drive(&mut self, actuator: Actuator, on: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(&actuator)
            .ok_or_else(|| anyhow!("no relay pin mapped for {actuator}"))?;
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    pub fn all_off(&mut self) {
        let keys: Vec<Actuator> = self.pins.keys().copied().collect();
        for k in keys {
            if let Err(e) = self.drive(k, false) {
                tracing::error!(actuator = %k, "relay all_off failed: {e:#}");
            }
        }
    }
}

#[cfg(feature = "gpio")]
impl ActuatorSink for RelayBoard {
    fn set(&mut self, actuator: Actuator, on: bool) -> Result<()> {
        self.drive(actuator, on)?;
        tracing::debug!(%actuator, state = on_off(on), "relay set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    pub(crate) relays: HashMap<Actuator, bool>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(pin_map: &[(Actuator, u8)], _active_low: bool) -> Result<Self> {
        let mut relays = HashMap::new();
        for (actuator, pin_num) in pin_map {
            tracing::info!(%actuator, gpio = pin_num, "[mock-gpio] registered relay (not wired)");
            relays.insert(*actuator, false);
        }
        tracing::info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self { relays })
    }

    pub fn all_off(&mut self) {
        for on in self.relays.values_mut() {
            *on = false;
        }
    }
}

#[cfg(not(feature = "gpio"))]
impl ActuatorSink for RelayBoard {
    fn set(&mut self, actuator: Actuator, on: bool) -> Result<()> {
        let state = self
            .relays
            .get_mut(&actuator)
            .ok_or_else(|| anyhow!("[mock-gpio] no relay mapped for {actuator}"))?;
        *state = on;
        tracing::info!(%actuator, state = on_off(on), "[mock-gpio] relay set");
        Ok(())
    }
}

impl Drop for RelayBoard {
    fn drop(&mut self) {
        self.all_off();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    fn pin_map() -> Vec<(Actuator, u8)> {
        vec![(Actuator::FanHeater, 8), (Actuator::Mister, 11)]
    }

    #[test]
    fn relay_board_new_registers_relays_off() {
        let board = RelayBoard::new(&pin_map(), true).unwrap();
        assert_eq!(board.relays.len(), 2);
        assert!(!board.relays[&Actuator::FanHeater]);
        assert!(!board.relays[&Actuator::Mister]);
    }

    #[test]
    fn relay_board_set_on_then_off() {
        let mut board = RelayBoard::new(&pin_map(), true).unwrap();
        board.set(Actuator::FanHeater, true).unwrap();
        assert!(board.relays[&Actuator::FanHeater]);
        board.set(Actuator::FanHeater, false).unwrap();
        assert!(!board.relays[&Actuator::FanHeater]);
    }

    #[test]
    fn relay_board_set_is_idempotent() {
        let mut board = RelayBoard::new(&pin_map(), true).unwrap();
        board.set(Actuator::Mister, true).unwrap();
        board.set(Actuator::Mister, true).unwrap();
        assert!(board.relays[&Actuator::Mister]);
    }

    #[test]
    fn relay_board_all_off_resets_everything() {
        let mut board = RelayBoard::new(&pin_map(), true).unwrap();
        board.set(Actuator::FanHeater, true).unwrap();
        board.set(Actuator::Mister, true).unwrap();
        board.all_off();
        assert!(board.relays.values().all(|on| !on));
    }

    #[test]
    fn relay_board_unmapped_actuator_is_an_error() {
        let mut board = RelayBoard::new(&pin_map(), true).unwrap();
        assert!(board.set(Actuator::PumpPhUp, true).is_err());
        assert_eq!(board.relays.len(), 2); // no new entry created
    }

    #[test]
    fn actuator_names_round_trip() {
        for a in Actuator::ALL {
            assert_eq!(a.name().parse::<Actuator>().unwrap(), a);
        }
        assert!("sprinkler".parse::<Actuator>().is_err());
    }

    #[test]
    fn only_indicator_is_not_corrective() {
        let non_corrective: Vec<_> = Actuator::ALL
            .into_iter()
            .filter(|a| !a.is_corrective())
            .collect();
        assert_eq!(non_corrective, vec![Actuator::Indicator]);
    }
}
