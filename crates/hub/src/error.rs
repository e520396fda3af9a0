//! Errors raised at the regulation engine's collaborator seams.  Service
//! plumbing uses `anyhow`; these exist so the engine can tell a missing
//! sensor apart from a failed relay or a failed store write.

use std::borrow::Borrow;
use thiserror::Error;

use crate::reading::Quantity;
use crate::relay::Actuator;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// No fresh sample for this quantity.
    #[error("{0} sensor unavailable")]
    Unavailable(Quantity),

    /// The sample normalized to NaN or to a physically impossible value.
    #[error("{quantity} reading {value} is invalid")]
    InvalidReading { quantity: Quantity, value: f64 },
}

#[derive(Debug, Error)]
pub enum RegulationError {
    #[error("command {actuator} {} failed: {source:#}", on_off(.on))]
    ActuatorCommandFailed {
        actuator: Actuator,
        on: bool,
        #[source]
        source: anyhow::Error,
    },

    #[error("persisting reading failed: {0:#}")]
    PersistenceFailed(#[source] anyhow::Error),
}

fn on_off(on: impl Borrow<bool>) -> &'static str {
    if *on.borrow() {
        "ON"
    } else {
        "OFF"
    }
}
