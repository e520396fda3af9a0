use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::db::ReadingStore;
use crate::engine::Regulator;
use crate::reading::Quantity;
use crate::relay::ActuatorSink;
use crate::sensors::{SampleCache, SensorSource};
use crate::state::SharedState;

pub const TELEMETRY_TOPIC: &str = "tele/+/reading";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSample {
    pub quantity: Quantity,
    pub raw: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSample {
    pub(crate) quantity: String,
    pub(crate) raw: f64,
}

/// `{"ts":1700000000,"samples":[{"quantity":"water_ph","raw":512.0}]}`
#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) samples: Vec<WireSample>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Decode a telemetry payload.  Samples naming an unknown quantity are
/// dropped with a warning; the rest of the message is still used.
pub(crate) fn parse_telemetry(payload: &[u8]) -> Result<(i64, Vec<RawSample>), String> {
    let msg: ReadingMsg =
        serde_json::from_slice(payload).map_err(|e| format!("bad telemetry json: {e}"))?;

    let samples = msg
        .samples
        .into_iter()
        .filter_map(|s| match s.quantity.parse::<Quantity>() {
            Ok(quantity) => Some(RawSample {
                quantity,
                raw: s.raw,
            }),
            Err(e) => {
                warn!("telemetry: {e}, sample dropped");
                None
            }
        })
        .collect();

    Ok((msg.ts, samples))
}

/// Feed one publish into the sample cache and the UI state.
pub(crate) async fn handle_publish(
    topic: &str,
    payload: &[u8],
    cache: &SampleCache,
    shared: &SharedState,
) {
    let Some(node_id) = extract_node_id(topic) else {
        debug!(topic, "unhandled topic");
        return;
    };

    match parse_telemetry(payload) {
        Ok((ts, samples)) => {
            for s in &samples {
                cache.record(s.quantity, s.raw);
            }
            debug!(node = node_id, ts, count = samples.len(), "telemetry");
            shared.write().await.record_reading(node_id, samples);
        }
        Err(msg) => {
            warn!(topic, "{msg}");
            shared.write().await.record_error(msg);
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive the MQTT connection until `shutdown` flips.  A connection error
/// forces every actuator off and forgets cached samples; regulation resumes
/// on fresh telemetry after the reconnect.
pub async fn run<S, A, P>(
    client: AsyncClient,
    mut eventloop: EventLoop,
    cache: SampleCache,
    regulator: Regulator<S, A, P>,
    shared: SharedState,
    mut shutdown: watch::Receiver<bool>,
) where
    S: SensorSource,
    A: ActuatorSink,
    P: ReadingStore,
{
    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            _ = shutdown.changed() => break,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_publish(&p.topic, &p.payload, &cache, &shared).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean sessions drop subscriptions, so resubscribe on every connect.
                if let Err(e) = client.subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce).await {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                // Best-effort fail-safe: nothing runs blind on stale data.
                regulator.deactivate_all("telemetry link lost").await;
                cache.clear();

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
    info!("mqtt loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EventKind, SystemState};

    // -- extract_node_id ----------------------------------------------------

    #[test]
    fn extract_node_id_valid_topic() {
        assert_eq!(extract_node_id("tele/box-1/reading"), Some("box-1"));
    }

    #[test]
    fn extract_node_id_wrong_prefix() {
        assert_eq!(extract_node_id("cmd/box-1/reading"), None);
    }

    #[test]
    fn extract_node_id_wrong_suffix() {
        assert_eq!(extract_node_id("tele/box-1/status"), None);
    }

    #[test]
    fn extract_node_id_bad_segment_count() {
        assert_eq!(extract_node_id("tele/reading"), None);
        assert_eq!(extract_node_id("tele/a/b/reading"), None);
        assert_eq!(extract_node_id("tele//reading"), None);
        assert_eq!(extract_node_id(""), None);
    }

    // -- payload ------------------------------------------------------------

    #[test]
    fn parse_telemetry_valid() {
        let json = br#"{"ts":1700000000,"samples":[{"quantity":"water_ph","raw":512.0},{"quantity":"env_temp","raw":22.4}]}"#;
        let (ts, samples) = parse_telemetry(json).unwrap();
        assert_eq!(ts, 1700000000);
        assert_eq!(
            samples,
            vec![
                RawSample {
                    quantity: Quantity::WaterPh,
                    raw: 512.0
                },
                RawSample {
                    quantity: Quantity::EnvTemp,
                    raw: 22.4
                },
            ]
        );
    }

    #[test]
    fn parse_telemetry_integer_raw_accepted() {
        let json = br#"{"ts":1,"samples":[{"quantity":"env_light","raw":700}]}"#;
        let (_, samples) = parse_telemetry(json).unwrap();
        assert_eq!(samples[0].raw, 700.0);
    }

    #[test]
    fn parse_telemetry_unknown_quantity_dropped() {
        let json = br#"{"ts":1,"samples":[{"quantity":"co2","raw":400},{"quantity":"water_ec","raw":300}]}"#;
        let (_, samples) = parse_telemetry(json).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].quantity, Quantity::WaterEc);
    }

    #[test]
    fn parse_telemetry_missing_field_fails() {
        assert!(parse_telemetry(br#"{"ts":1}"#).is_err());
        assert!(parse_telemetry(b"not json").is_err());
    }

    #[test]
    fn parse_telemetry_extra_fields_ignored() {
        let (ts, samples) = parse_telemetry(br#"{"ts":1,"samples":[],"fw":"1.2"}"#).unwrap();
        assert_eq!(ts, 1);
        assert!(samples.is_empty());
    }

    // -- handle_publish -----------------------------------------------------

    #[tokio::test]
    async fn publish_feeds_cache_and_state() {
        let cache = SampleCache::new(Duration::from_secs(60));
        let shared = SystemState::shared();
        handle_publish(
            "tele/box-1/reading",
            br#"{"ts":1,"samples":[{"quantity":"env_humidity","raw":48.5}]}"#,
            &cache,
            &shared,
        )
        .await;

        assert_eq!(cache.read(Quantity::EnvHumidity), Ok(48.5));
        let st = shared.read().await;
        assert!(st.nodes.contains_key("box-1"));
    }

    #[tokio::test]
    async fn bad_payload_recorded_as_error() {
        let cache = SampleCache::new(Duration::from_secs(60));
        let shared = SystemState::shared();
        handle_publish("tele/box-1/reading", b"{", &cache, &shared).await;

        let st = shared.read().await;
        assert_eq!(st.events.back().map(|e| e.kind), Some(EventKind::Error));
        assert!(cache.read(Quantity::EnvTemp).is_err());
    }

    #[tokio::test]
    async fn other_topics_ignored() {
        let cache = SampleCache::new(Duration::from_secs(60));
        let shared = SystemState::shared();
        handle_publish(
            "valve/z1/set",
            br#"{"ts":1,"samples":[{"quantity":"env_temp","raw":20}]}"#,
            &cache,
            &shared,
        )
        .await;
        assert!(cache.read(Quantity::EnvTemp).is_err());
        assert!(shared.read().await.events.is_empty());
    }
}
