//! Periodic driver for the regulation engine.
//!
//! Three independent cadences share one loop:
//!
//! ```text
//! climate    every climate_sec     air temp, humidity, cooler, water temp
//! chemistry  every chemistry_sec   EC and pH dosing
//! emission   every emission_sec    snapshot -> store (detached)
//! ```
//!
//! With `chemistry_separate = false` the chemistry interval is not created
//! and every climate tick evaluates everything.  With persistence off the
//! emission interval is not created either.  Each interval first fires one
//! full period after start, so telemetry has time to arrive.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::info;

use crate::config::Cadence;
use crate::db::ReadingStore;
use crate::engine::{Regulator, TickScope};
use crate::relay::ActuatorSink;
use crate::sensors::SensorSource;
use crate::state::SharedState;

fn ticker(period: Duration) -> Interval {
    let mut t = interval_at(Instant::now() + period, period);
    // A late tick is not worth a burst of catch-up decisions.
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

async fn next(t: &mut Option<Interval>) {
    match t {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Run until `shutdown` flips.  Intended to be `tokio::spawn`-ed from main;
/// the caller shuts the regulator down afterwards.
pub async fn run<S, A, P>(
    regulator: Regulator<S, A, P>,
    cadence: Cadence,
    persist: bool,
    shared: SharedState,
    mut shutdown: watch::Receiver<bool>,
) where
    S: SensorSource,
    A: ActuatorSink,
    P: ReadingStore,
{
    let mut climate = ticker(Duration::from_secs(cadence.climate_sec));
    let mut chemistry = cadence
        .chemistry_separate
        .then(|| ticker(Duration::from_secs(cadence.chemistry_sec)));
    let mut emission = persist.then(|| ticker(Duration::from_secs(cadence.emission_sec)));

    let climate_scope = if cadence.chemistry_separate {
        TickScope::Climate
    } else {
        TickScope::Full
    };

    info!(
        climate_sec = cadence.climate_sec,
        chemistry_sec = cadence.chemistry_separate.then_some(cadence.chemistry_sec),
        emission_sec = persist.then_some(cadence.emission_sec),
        "scheduler started"
    );
    shared
        .write()
        .await
        .record_system("scheduler started".to_string());

    loop {
        tokio::select! {
            _ = climate.tick() => {
                let report = regulator.tick(climate_scope).await;
                shared.write().await.record_tick(climate_scope, &report);
            }
            _ = next(&mut chemistry) => {
                let report = regulator.tick(TickScope::Chemistry).await;
                shared.write().await.record_tick(TickScope::Chemistry, &report);
            }
            _ = next(&mut emission) => {
                let (reading, write) = regulator.emit().await;
                info!(values = reading.measurements().count(), "reading emitted");

                // Never wait on storage here; a slow disk must not delay a tick.
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Ok(Err(e)) = write.await {
                        shared.write().await.record_error(e.to_string());
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("scheduler stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
