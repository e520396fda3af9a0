mod config;
mod db;
mod engine;
mod error;
mod mqtt;
mod normalize;
mod reading;
mod relay;
mod scheduler;
mod sensors;
mod state;
#[cfg(test)]
mod testing;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, path::Path, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Db;
use engine::{EngineContext, Regulator};
use relay::RelayBoard;
use sensors::SampleCache;
use state::SystemState;

pub type HubRegulator = Regulator<SampleCache, RelayBoard, Option<Db>>;

const DEFAULT_CONFIG_PATH: &str = "growbox.toml";

fn load_config() -> Result<Config> {
    match env::var("CONFIG_PATH") {
        Ok(path) => config::load(&path),
        Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => config::load(DEFAULT_CONFIG_PATH),
        Err(_) => {
            warn!("no {DEFAULT_CONFIG_PATH} found, running with built-in defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:growbox.db?mode=rwc".to_string());
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let cfg = load_config()?;

    // ── Database ────────────────────────────────────────────────────
    let db = if cfg.persistence.enabled {
        let db = Db::connect(&db_url).await?;
        db.migrate().await?;
        info!(db_url, "db ready");
        Some(db)
    } else {
        warn!("persistence disabled, readings will not be stored");
        None
    };

    // ── Relay board + engine ────────────────────────────────────────
    let board = RelayBoard::new(&cfg.relays.pin_map(), active_low)?;
    let cache = SampleCache::new(Duration::from_secs(cfg.cadence.stale_after_sec));

    let regulator: HubRegulator = Regulator::new(
        EngineContext {
            sensors: cache.clone(),
            actuators: board,
            store: db.clone(),
        },
        cfg.thresholds,
        cfg.timing,
        cfg.calibration.normalizer(),
    );

    // ── Shared state (ephemeral, for the web UI) ────────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    let (stop_tx, stop_rx) = watch::channel(false);

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState::new(shared.clone(), regulator.clone(), db.clone());
    let web_stop = stop_rx.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_stop).await {
            error!("web server error: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler_task = tokio::spawn(scheduler::run(
        regulator.clone(),
        cfg.cadence,
        cfg.persistence.enabled,
        shared.clone(),
        stop_rx.clone(),
    ));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("growbox-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    let mqtt_task = tokio::spawn(mqtt::run(
        client,
        eventloop,
        cache,
        regulator.clone(),
        shared.clone(),
        stop_rx,
    ));

    // ── Shutdown ────────────────────────────────────────────────────
    wait_for_signal().await;
    info!("shutdown requested");
    let _ = stop_tx.send(true);

    if let Err(e) = scheduler_task.await {
        error!("scheduler task failed: {e}");
    }
    let result = regulator.shutdown().await;
    if let Err(e) = &result {
        error!("{e:#}");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = mqtt_task.await;
        let _ = web_task.await;
    })
    .await;

    result
}
