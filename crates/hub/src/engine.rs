//! Regulation engine: turns sensor samples into time-bounded actuator
//! activations.
//!
//! Each regulated quantity is classified against its static band every tick
//! and drives its actuators as a level, not an edge:
//!
//! ```text
//! quantity       below min            above max          within
//! env_temp       fan_heater ON        fan_cooler ON      fan_heater OFF
//! env_humidity   mister ON            fan_cooler ON      mister OFF
//! water_temp     heating_pad ON       (no action)        heating_pad OFF
//! water_ec       nutrient pumps ON    (no action)        nutrient pumps OFF
//! water_ph       pump_ph_up ON        pump_ph_down ON    both OFF
//! ```
//!
//! `fan_cooler` is shared: it turns off only once both air temperature and
//! humidity are known and neither is above its max.
//!
//! Heater, mister and the dosing pumps are duty-limited.  Activating one
//! schedules an auto-revert task; activating it again replaces that task
//! (generation-checked) instead of stacking a second one.  A pending
//! revert is only dropped once the OFF write succeeds; a revert whose own
//! OFF write fails tries again after `REVERT_RETRY`.
//!
//! A fixed EC placeholder is classified like a probe value but never
//! drives the nutrient pumps.
//!
//! All state lives behind one async mutex, so two decisions never
//! interleave.  Auto-revert tasks take the same mutex when they fire.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ThresholdBand, Thresholds, Timing};
use crate::db::ReadingStore;
use crate::error::{RegulationError, SensorError};
use crate::normalize::{EcSource, Normalizer};
use crate::reading::{Quantity, Reading};
use crate::relay::{Actuator, ActuatorSink};
use crate::sensors::SensorSource;

/// Quantities with a band and actuators behind them.
pub const REGULATED: [Quantity; 5] = [
    Quantity::EnvTemp,
    Quantity::EnvHumidity,
    Quantity::WaterTemp,
    Quantity::WaterEc,
    Quantity::WaterPh,
];

/// Attempts per actuator when forcing everything off at shutdown.
const SHUTDOWN_ATTEMPTS: usize = 3;

const REVERT_RETRY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Below,
    Within,
    Above,
}

/// `value <= min` is below, else `value >= max` is above, else within.
/// A missing bound never matches.
pub fn classify(value: f64, band: ThresholdBand) -> Level {
    if band.min.is_some_and(|min| value <= min) {
        Level::Below
    } else if band.max.is_some_and(|max| value >= max) {
        Level::Above
    } else {
        Level::Within
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickScope {
    /// Air temperature, humidity, cooler, water temperature.
    Climate,
    /// EC and pH dosing.
    Chemistry,
    /// Everything, in climate-then-chemistry order.
    Full,
}

impl TickScope {
    fn climate(self) -> bool {
        matches!(self, TickScope::Climate | TickScope::Full)
    }

    fn chemistry(self) -> bool {
        matches!(self, TickScope::Chemistry | TickScope::Full)
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Owned handles to everything outside the engine.
pub struct EngineContext<S, A, P> {
    pub sensors: S,
    pub actuators: A,
    pub store: P,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Classified { value: f64, level: Level },
    Skipped(SensorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub actuator: Actuator,
    pub on: bool,
}

/// What one tick saw and did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub outcomes: Vec<(Quantity, Outcome)>,
    /// State changes actually applied, in issue order.
    pub commands: Vec<Command>,
    pub failures: Vec<RegulationError>,
    /// The engine was already shut down; nothing was evaluated.
    pub stopped: bool,
}

impl TickReport {
    pub fn outcome(&self, quantity: Quantity) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(q, _)| *q == quantity)
            .map(|(_, o)| o)
    }

    pub fn summary(&self) -> String {
        if self.stopped {
            return "engine stopped".to_string();
        }
        let mut parts: Vec<String> = self
            .outcomes
            .iter()
            .map(|(q, o)| match o {
                Outcome::Classified { value, level } => format!("{q}={value} ({level:?})"),
                Outcome::Skipped(_) => format!("{q}=skipped"),
            })
            .collect();
        for c in &self.commands {
            parts.push(format!("{}->{}", c.actuator, if c.on { "ON" } else { "OFF" }));
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorStatus {
    pub actuator: Actuator,
    pub on: bool,
    /// Milliseconds until the pending auto-revert fires.
    pub revert_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub stopped: bool,
    pub actuators: Vec<ActuatorStatus>,
    pub levels: BTreeMap<Quantity, Level>,
    pub latest: Option<Reading>,
}

// ---------------------------------------------------------------------------
// Actuator state
// ---------------------------------------------------------------------------

struct PendingRevert {
    deadline: Instant,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ActuatorState {
    on: bool,
    pending: Option<PendingRevert>,
}

impl ActuatorState {
    fn cancel_revert(&mut self) {
        if let Some(p) = self.pending.take() {
            p.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Engine core (always accessed under the mutex)
// ---------------------------------------------------------------------------

struct EngineCore<S, A, P> {
    ctx: EngineContext<S, A, P>,
    thresholds: Thresholds,
    timing: Timing,
    normalizer: Normalizer,
    actuators: BTreeMap<Actuator, ActuatorState>,
    levels: BTreeMap<Quantity, Level>,
    latest: Option<Reading>,
    next_generation: u64,
    stopped: bool,
    this: Weak<Mutex<EngineCore<S, A, P>>>,
}

impl<S, A, P> EngineCore<S, A, P>
where
    S: SensorSource,
    A: ActuatorSink,
    P: ReadingStore,
{
    // -- sampling -----------------------------------------------------------

    fn sample(&self, quantity: Quantity) -> Result<f64, SensorError> {
        let raw = self.ctx.sensors.read(quantity)?;
        let compensation = match quantity {
            Quantity::WaterEc => self.sample(Quantity::WaterTemp).ok(),
            _ => None,
        };
        self.normalizer.normalize(quantity, raw, compensation)
    }

    fn read_all(&self) -> Reading {
        let mut reading = Reading::empty(OffsetDateTime::now_utc());
        for q in Quantity::ALL {
            match self.sample(q) {
                Ok(v) => reading.set(q, v),
                Err(e) => debug!(quantity = %q, "snapshot: {e}"),
            }
        }
        reading
    }

    fn evaluate(&mut self, quantity: Quantity, report: &mut TickReport) -> Option<Level> {
        let band = self.thresholds.band(quantity)?;
        match self.sample(quantity) {
            Ok(value) => {
                let level = classify(value, band);
                self.levels.insert(quantity, level);
                report
                    .outcomes
                    .push((quantity, Outcome::Classified { value, level }));
                Some(level)
            }
            Err(e) => {
                warn!(quantity = %quantity, "regulation skipped: {e}");
                self.levels.remove(&quantity);
                report.outcomes.push((quantity, Outcome::Skipped(e)));
                None
            }
        }
    }

    // -- decisions ----------------------------------------------------------

    fn regulate(&mut self, scope: TickScope) -> TickReport {
        let mut report = TickReport::default();
        if self.stopped {
            report.stopped = true;
            return report;
        }

        if scope.climate() {
            let temp = self.evaluate(Quantity::EnvTemp, &mut report);
            match temp {
                Some(Level::Below) => self.activate(Actuator::FanHeater, &mut report),
                Some(_) => self.deactivate(Actuator::FanHeater, &mut report),
                None => {}
            }

            let humidity = self.evaluate(Quantity::EnvHumidity, &mut report);
            match humidity {
                Some(Level::Below) => self.activate(Actuator::Mister, &mut report),
                Some(_) => self.deactivate(Actuator::Mister, &mut report),
                None => {}
            }

            match (temp, humidity) {
                (Some(Level::Above), _) | (_, Some(Level::Above)) => {
                    self.activate(Actuator::FanCooler, &mut report)
                }
                (Some(_), Some(_)) => self.deactivate(Actuator::FanCooler, &mut report),
                // One side unknown and the other not demanding cooling.
                _ => {}
            }

            match self.evaluate(Quantity::WaterTemp, &mut report) {
                Some(Level::Below) => self.activate(Actuator::HeatingPad, &mut report),
                Some(_) => self.deactivate(Actuator::HeatingPad, &mut report),
                None => {}
            }
        }

        if scope.chemistry() {
            let placeholder = matches!(self.normalizer.ec_source, EcSource::Fixed { .. });
            match self.evaluate(Quantity::WaterEc, &mut report) {
                Some(Level::Below) if placeholder => {
                    debug!("water_ec is a fixed placeholder, not dosing");
                }
                Some(Level::Below) => {
                    self.activate(Actuator::PumpNutrients1, &mut report);
                    self.activate(Actuator::PumpNutrients2, &mut report);
                }
                Some(_) => {
                    self.deactivate(Actuator::PumpNutrients1, &mut report);
                    self.deactivate(Actuator::PumpNutrients2, &mut report);
                }
                None => {}
            }

            match self.evaluate(Quantity::WaterPh, &mut report) {
                Some(Level::Below) => {
                    self.deactivate(Actuator::PumpPhDown, &mut report);
                    self.activate(Actuator::PumpPhUp, &mut report);
                }
                Some(Level::Above) => {
                    self.deactivate(Actuator::PumpPhUp, &mut report);
                    self.activate(Actuator::PumpPhDown, &mut report);
                }
                Some(Level::Within) => {
                    self.deactivate(Actuator::PumpPhUp, &mut report);
                    self.deactivate(Actuator::PumpPhDown, &mut report);
                }
                None => {}
            }
        }

        self.refresh_indicator(Some(&mut report));
        report
    }

    // -- commands -----------------------------------------------------------

    /// Drive the relay if the commanded state differs.  On failure the
    /// commanded state is left as it was, so the next tick retries.
    fn command(&mut self, actuator: Actuator, on: bool) -> Result<bool, RegulationError> {
        let state = self.actuators.entry(actuator).or_default();
        if state.on == on {
            return Ok(false);
        }
        self.ctx
            .actuators
            .set(actuator, on)
            .map_err(|source| RegulationError::ActuatorCommandFailed {
                actuator,
                on,
                source,
            })?;
        state.on = on;
        let label = if on { "ON" } else { "OFF" };
        info!(%actuator, state = label, "actuator switched");
        Ok(true)
    }

    fn apply(&mut self, actuator: Actuator, on: bool, report: &mut TickReport) -> bool {
        match self.command(actuator, on) {
            Ok(changed) => {
                if changed {
                    report.commands.push(Command { actuator, on });
                }
                true
            }
            Err(e) => {
                error!("{e}");
                report.failures.push(e);
                false
            }
        }
    }

    fn activate(&mut self, actuator: Actuator, report: &mut TickReport) {
        if self.apply(actuator, true, report) {
            if let Some(limit) = self.timing.duty_limit(actuator) {
                self.schedule_revert(actuator, limit);
            }
        }
    }

    fn deactivate(&mut self, actuator: Actuator, report: &mut TickReport) {
        // A failed OFF keeps the pending revert as the fallback.
        if self.apply(actuator, false, report) {
            self.actuators.entry(actuator).or_default().cancel_revert();
        }
    }

    /// Replace any pending auto-revert for `actuator` with a fresh one.
    fn schedule_revert(&mut self, actuator: Actuator, after: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = Instant::now() + after;
        let this = self.this.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(core) = this.upgrade() {
                core.lock().await.auto_revert(actuator, generation);
            }
        });

        let state = self.actuators.entry(actuator).or_default();
        state.cancel_revert();
        state.pending = Some(PendingRevert {
            deadline,
            generation,
            task,
        });
        debug!(%actuator, after_ms = after.as_millis() as u64, "auto-revert scheduled");
    }

    fn auto_revert(&mut self, actuator: Actuator, generation: u64) {
        let Some(state) = self.actuators.get_mut(&actuator) else {
            return;
        };
        // Superseded or cancelled while this task waited for the lock.
        if state.pending.as_ref().map(|p| p.generation) != Some(generation) {
            return;
        }
        state.pending = None;

        match self.command(actuator, false) {
            Ok(_) => debug!(%actuator, "auto-revert fired"),
            Err(e) => {
                error!("auto-revert: {e}");
                self.schedule_revert(actuator, REVERT_RETRY);
            }
        }
        self.refresh_indicator(None);
    }

    /// Indicator is lit while any corrective actuator is on, and forced off
    /// only when every regulated quantity was last seen within its band.
    fn refresh_indicator(&mut self, report: Option<&mut TickReport>) {
        let busy = self
            .actuators
            .iter()
            .any(|(a, s)| a.is_corrective() && s.on);
        let all_clear = REGULATED
            .iter()
            .all(|q| self.levels.get(q) == Some(&Level::Within));

        let want = if busy {
            true
        } else if all_clear {
            false
        } else {
            return;
        };

        match report {
            Some(report) => {
                self.apply(Actuator::Indicator, want, report);
            }
            None => {
                if let Err(e) = self.command(Actuator::Indicator, want) {
                    error!("{e}");
                }
            }
        }
    }

    /// Cancel every timer and drive every relay OFF regardless of what was
    /// last commanded.  The commanded state becomes OFF even if the relay
    /// write fails; the failures are returned.
    fn force_all_off(&mut self, attempts: usize) -> Vec<RegulationError> {
        let mut failures = Vec::new();
        for actuator in Actuator::ALL {
            let state = self.actuators.entry(actuator).or_default();
            state.cancel_revert();
            state.on = false;

            let mut last_err = None;
            for _ in 0..attempts.max(1) {
                match self.ctx.actuators.set(actuator, false) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if let Some(source) = last_err {
                let e = RegulationError::ActuatorCommandFailed {
                    actuator,
                    on: false,
                    source,
                };
                error!("{e}");
                failures.push(e);
            }
        }
        failures
    }

    fn status(&self) -> EngineStatus {
        let now = Instant::now();
        EngineStatus {
            stopped: self.stopped,
            actuators: Actuator::ALL
                .into_iter()
                .map(|actuator| {
                    let state = self.actuators.get(&actuator);
                    ActuatorStatus {
                        actuator,
                        on: state.is_some_and(|s| s.on),
                        revert_in_ms: state
                            .and_then(|s| s.pending.as_ref())
                            .map(|p| p.deadline.saturating_duration_since(now).as_millis() as u64),
                    }
                })
                .collect(),
            levels: self.levels.clone(),
            latest: self.latest.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the regulation engine.
pub struct Regulator<S, A, P> {
    core: Arc<Mutex<EngineCore<S, A, P>>>,
}

impl<S, A, P> Clone for Regulator<S, A, P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S, A, P> Regulator<S, A, P>
where
    S: SensorSource,
    A: ActuatorSink,
    P: ReadingStore,
{
    pub fn new(
        ctx: EngineContext<S, A, P>,
        thresholds: Thresholds,
        timing: Timing,
        normalizer: Normalizer,
    ) -> Self {
        let core = Arc::new_cyclic(|this| {
            Mutex::new(EngineCore {
                ctx,
                thresholds,
                timing,
                normalizer,
                actuators: Actuator::ALL
                    .into_iter()
                    .map(|a| (a, ActuatorState::default()))
                    .collect(),
                levels: BTreeMap::new(),
                latest: None,
                next_generation: 0,
                stopped: false,
                this: this.clone(),
            })
        });
        Self { core }
    }

    /// Evaluate `scope` once.  Returns without awaiting any auto-revert.
    pub async fn tick(&self, scope: TickScope) -> TickReport {
        let report = self.core.lock().await.regulate(scope);
        debug!(?scope, "tick: {}", report.summary());
        report
    }

    /// Normalized values right now, without recording them.
    pub async fn read_now(&self) -> Reading {
        self.core.lock().await.read_all()
    }

    /// Normalized value of one quantity right now.
    pub async fn current(&self, quantity: Quantity) -> Result<f64, SensorError> {
        self.core.lock().await.sample(quantity)
    }

    /// Read every quantity and remember the result as the latest reading.
    pub async fn snapshot(&self) -> Reading {
        let mut core = self.core.lock().await;
        let reading = core.read_all();
        core.latest = Some(reading.clone());
        reading
    }

    /// Take a snapshot and hand it to the store on a detached task.  The
    /// returned handle resolves once the write finishes; nobody has to
    /// await it.
    pub async fn emit(&self) -> (Reading, JoinHandle<Result<(), RegulationError>>) {
        let reading = self.snapshot().await;
        let store = self.core.lock().await.ctx.store.clone();

        let to_store = reading.clone();
        let write = tokio::spawn(async move {
            store.write(&to_store).await.map_err(|e| {
                let e = RegulationError::PersistenceFailed(e);
                error!("{e}");
                e
            })
        });
        (reading, write)
    }

    /// Force everything off but keep regulating on later ticks.
    pub async fn deactivate_all(&self, reason: &str) -> usize {
        let mut core = self.core.lock().await;
        let failures = core.force_all_off(1);
        core.levels.clear();
        warn!(reason, failed = failures.len(), "all actuators deactivated");
        failures.len()
    }

    /// Stop regulating and force every actuator off.  Later ticks are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.stopped = true;
        let failures = core.force_all_off(SHUTDOWN_ATTEMPTS);
        if failures.is_empty() {
            info!("regulator shut down, all actuators off");
            Ok(())
        } else {
            let names: Vec<String> = failures
                .iter()
                .map(|e| match e {
                    RegulationError::ActuatorCommandFailed { actuator, .. } => actuator.to_string(),
                    other => other.to_string(),
                })
                .collect();
            bail!("failed to switch off: {}", names.join(", "))
        }
    }

    pub async fn status(&self) -> EngineStatus {
        self.core.lock().await.status()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
