//! Raw sample intake.  Sensor nodes publish raw transducer samples over
//! MQTT; the hub keeps the newest one per quantity and hands it to the
//! regulation engine on request.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::SensorError;
use crate::reading::Quantity;

/// Source of raw samples.  A quantity with no usable sample is
/// `SensorError::Unavailable`; the engine skips it for the tick.
pub trait SensorSource: Send + 'static {
    fn read(&self, quantity: Quantity) -> Result<f64, SensorError>;
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    raw: f64,
    received: Instant,
}

/// Latest raw sample per quantity, shared between the MQTT loop (writer)
/// and the engine (reader).  The lock is never held across an await.
#[derive(Clone)]
pub struct SampleCache {
    inner: Arc<RwLock<HashMap<Quantity, Sample>>>,
    stale_after: Duration,
}

impl SampleCache {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            stale_after,
        }
    }

    pub fn record(&self, quantity: Quantity, raw: f64) {
        let sample = Sample {
            raw,
            received: Instant::now(),
        };
        match self.inner.write() {
            Ok(mut map) => {
                map.insert(quantity, sample);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(quantity, sample);
            }
        }
    }

    /// Forget every sample, e.g. after the telemetry link drops.
    pub fn clear(&self) {
        match self.inner.write() {
            Ok(mut map) => map.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl SensorSource for SampleCache {
    fn read(&self, quantity: Quantity) -> Result<f64, SensorError> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        match map.get(&quantity) {
            Some(s) if s.received.elapsed() <= self.stale_after => Ok(s.raw),
            _ => Err(SensorError::Unavailable(quantity)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
