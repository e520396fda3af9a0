#[cfg(any(feature = "hw", test))]
mod adc;
#[cfg(any(feature = "hw", test))]
mod ds18b20;
#[cfg(feature = "hw")]
mod probes;
#[cfg(any(feature = "hw", test))]
mod sht31;
#[cfg(feature = "sim")]
mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, fmt, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(not(any(feature = "sim", feature = "hw")))]
compile_error!("enable at least one of the `sim` or `hw` features");

/// Quantities this node can publish.  Names match the hub's wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    EnvLight,
    EnvTemp,
    EnvHumidity,
    WaterTemp,
    WaterEc,
    WaterPh,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::EnvLight,
        Channel::EnvTemp,
        Channel::EnvHumidity,
        Channel::WaterTemp,
        Channel::WaterEc,
        Channel::WaterPh,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::EnvLight => "env_light",
            Channel::EnvTemp => "env_temp",
            Channel::EnvHumidity => "env_humidity",
            Channel::WaterTemp => "water_temp",
            Channel::WaterEc => "water_ec",
            Channel::WaterPh => "water_ph",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One raw transducer sample.  Analog channels carry 10-bit counts against
/// 5 V; digital ones carry °C or % RH.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub quantity: &'static str,
    pub raw: f64,
}

impl Sample {
    pub fn new(channel: Channel, raw: f64) -> Self {
        Self {
            quantity: channel.name(),
            raw,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadingMsg {
    ts: i64,
    samples: Vec<Sample>,
}

/// Anything that can produce one round of samples.  A sensor that fails is
/// left out of the round rather than failing it.
pub trait SampleSource {
    fn sample_all(&mut self) -> Vec<Sample>;
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(feature = "hw")]
fn open_source() -> Result<Box<dyn SampleSource>> {
    let channels = adc::parse_channels(&env::var("ADC_CHANNELS").unwrap_or_default())?;
    let probes = probes::Probes::open(channels)?;
    info!("sampling real hardware");
    Ok(Box::new(probes))
}

#[cfg(all(feature = "sim", not(feature = "hw")))]
fn open_source() -> Result<Box<dyn SampleSource>> {
    let scenario = sim::Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    info!(%scenario, "sampling simulator");
    Ok(Box::new(sim::GrowboxSim::new(scenario)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "growbox-node".to_string());

    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(5);

    let mut source = open_source()?;

    let client_id = format!("growbox-node-{node_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // We only publish, but the event loop must run to keep the connection alive.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = format!("tele/{node_id}/reading");
    info!(topic, sample_every_s, "publishing");

    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s));
    loop {
        ticker.tick().await;

        let msg = ReadingMsg {
            ts: now_unix(),
            samples: source.sample_all(),
        };
        if msg.samples.is_empty() {
            warn!("no sensor produced a sample this round");
            continue;
        }

        let payload = serde_json::to_vec(&msg)?;
        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            error!("publish error: {e}");
        } else {
            debug!(ts = msg.ts, count = msg.samples.len(), "published samples");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_is_recent() {
        let ts = now_unix();
        // Should be after 2024-01-01 (1704067200) and before 2040-01-01 (2208988800)
        assert!(ts > 1_704_067_200, "timestamp too old: {ts}");
        assert!(ts < 2_208_988_800, "timestamp too far in future: {ts}");
    }

    #[test]
    fn reading_msg_matches_hub_wire_format() {
        let msg = ReadingMsg {
            ts: 1_700_000_000,
            samples: vec![
                Sample::new(Channel::WaterPh, 512.0),
                Sample::new(Channel::EnvTemp, 22.4),
            ],
        };
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["ts"], 1_700_000_000);
        assert_eq!(json["samples"].as_array().unwrap().len(), 2);
        assert_eq!(json["samples"][0]["quantity"], "water_ph");
        assert_eq!(json["samples"][0]["raw"], 512.0);
        assert_eq!(json["samples"][1]["quantity"], "env_temp");
    }

    #[test]
    fn sample_has_exactly_two_fields() {
        let json = serde_json::to_value(Sample::new(Channel::EnvLight, 700.0)).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn channel_names_are_unique() {
        let mut names: Vec<&str> = Channel::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Channel::ALL.len());
    }
}
