use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::engine::{TickReport, TickScope};
use crate::mqtt::RawSample;
use crate::relay::Actuator;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct NodeState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub samples: Vec<RawSample>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Regulation,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            nodes: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a telemetry message from a node.
    pub fn record_reading(&mut self, node_id: &str, samples: Vec<RawSample>) {
        let detail = format!(
            "{node_id}: {}",
            samples
                .iter()
                .map(|s| format!("{}={}", s.quantity, s.raw))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.nodes.insert(
            node_id.to_string(),
            NodeState {
                last_seen: OffsetDateTime::now_utc(),
                samples,
            },
        );

        self.push_event(EventKind::Reading, detail);
    }

    pub fn record_actuator(&mut self, actuator: Actuator, on: bool) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Actuator, format!("{actuator} set {state_str}"));
    }

    /// Record what one regulation tick saw, then every switch it made and
    /// every relay that refused.
    pub fn record_tick(&mut self, scope: TickScope, report: &TickReport) {
        self.push_event(
            EventKind::Regulation,
            format!("{scope:?} tick: {}", report.summary()),
        );
        for c in &report.commands {
            self.record_actuator(c.actuator, c.on);
        }
        for f in &report.failures {
            self.record_error(f.to_string());
        }
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            nodes: self.nodes.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
