//! In-memory collaborators for exercising the engine without hardware.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::Instant;

use crate::db::ReadingStore;
use crate::reading::Reading;
use crate::relay::{Actuator, ActuatorSink};

/// Records every relay write with the (possibly paused) tokio clock.
#[derive(Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<Vec<(Actuator, bool, Instant)>>>,
    failing: Arc<Mutex<HashSet<Actuator>>>,
}

impl RecordingSink {
    pub fn events(&self, actuator: Actuator) -> Vec<(bool, Instant)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _, _)| *a == actuator)
            .map(|(_, on, at)| (*on, *at))
            .collect()
    }

    pub fn fail(&self, actuator: Actuator, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(actuator);
        } else {
            set.remove(&actuator);
        }
    }
}

impl ActuatorSink for RecordingSink {
    fn set(&mut self, actuator: Actuator, on: bool) -> Result<()> {
        if self.failing.lock().unwrap().contains(&actuator) {
            bail!("relay {actuator} not responding");
        }
        self.log.lock().unwrap().push((actuator, on, Instant::now()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    pub rows: Arc<Mutex<Vec<Reading>>>,
    pub failing: bool,
    /// Hold every write this long before completing it.
    pub delay: Option<Duration>,
}

impl ReadingStore for MemoryStore {
    async fn write(&self, reading: &Reading) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            bail!("database is locked");
        }
        self.rows.lock().unwrap().push(reading.clone());
        Ok(())
    }
}

/// Raw ADC counts that normalize to `ph` with the default probe offset.
pub fn ph_raw(ph: f64) -> f64 {
    (ph - 0.75) / 3.5 * 1024.0 / 5.0
}
