//! JSON record publishing for the downstream consumer.
//!
//! The broker itself lives outside this process. Records are sent as
//! `{topic, payload}` datagrams over UDP so a relay can forward them to the
//! actual transport; publishing is best-effort and must never take down the
//! processing loop.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::net::UdpSocket;

use crate::exercise::{ExerciseKind, Stage};

/// Default relay target.
pub const DEFAULT_PUBLISH_ADDR: &str = "127.0.0.1:49150";

fn iso8601(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Round an angle for the wire: two decimals is plenty for display.
fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}

/// Per-observation sensor state.
#[derive(Debug, Clone, Serialize)]
pub struct StateRecord {
    pub count: u32,
    pub stage: &'static str,
    pub angle: Option<f32>,
    pub exercise_type: &'static str,
    pub timestamp: String,
    pub session_start: String,
}

impl StateRecord {
    pub fn new(
        count: u32,
        stage: Stage,
        angle: Option<f32>,
        kind: ExerciseKind,
        session_start: DateTime<Utc>,
    ) -> Self {
        Self {
            count,
            stage: stage.as_str(),
            angle: angle.map(round2),
            exercise_type: kind.name(),
            timestamp: iso8601(Utc::now()),
            session_start: iso8601(session_start),
        }
    }
}

/// Service availability announcement.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub status: &'static str,
    pub message: String,
    pub timestamp: String,
}

impl StatusRecord {
    pub fn online(message: impl Into<String>) -> Self {
        Self::new("online", message)
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self::new("offline", message)
    }

    fn new(status: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: iso8601(Utc::now()),
        }
    }
}

/// Sensor discovery/announcement payload, published once per connection so
/// the consumer can register the sensor without manual configuration.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryRecord {
    pub name: String,
    pub state_topic: String,
    pub value_template: &'static str,
    pub unit_of_measurement: &'static str,
    pub icon: &'static str,
    pub json_attributes_topic: String,
    pub unique_id: String,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: [&'static str; 1],
    pub name: &'static str,
    pub model: &'static str,
    pub manufacturer: &'static str,
    pub sw_version: &'static str,
}

impl DiscoveryRecord {
    pub fn for_exercise(kind: ExerciseKind, topics: &Topics) -> Self {
        Self {
            name: format!("Taiso {} Counter", kind.display_name()),
            state_topic: topics.state.clone(),
            value_template: "{{ value_json.count }}",
            unit_of_measurement: "reps",
            icon: "mdi:run",
            json_attributes_topic: topics.state.clone(),
            unique_id: format!("taiso_{}_counter", kind.name()),
            device: DeviceInfo {
                identifiers: ["taiso_tracker"],
                name: "Taiso Exercise Tracker",
                model: "MoveNet",
                manufacturer: "taiso-tracker",
                sw_version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

/// Topic names for one tracked exercise.
#[derive(Debug, Clone)]
pub struct Topics {
    pub state: String,
    pub config: String,
    pub status: String,
}

impl Topics {
    pub fn new(prefix: &str, kind: ExerciseKind) -> Self {
        Self {
            state: format!("{}_{}/state", prefix, kind.name()),
            config: format!("{}_{}/config", prefix, kind.name()),
            status: format!("{prefix}_status/state"),
        }
    }
}

/// Publisher boundary. Implementations must not block the processing loop
/// beyond a single send.
pub trait StatePublisher: Send {
    fn publish_state(&mut self, record: &StateRecord) -> Result<()>;
    fn publish_status(&mut self, record: &StatusRecord) -> Result<()>;
    fn publish_discovery(&mut self, kind: ExerciseKind) -> Result<()>;
}

/// UDP datagram publisher.
pub struct UdpPublisher {
    socket: UdpSocket,
    target: String,
    topics: Topics,
}

impl UdpPublisher {
    pub fn new(target: &str, topics: Topics) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            target: target.to_string(),
            topics,
        })
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    fn send(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let envelope = json!({ "topic": topic, "payload": payload });
        let data = serde_json::to_vec(&envelope)?;
        self.socket.send_to(&data, &self.target)?;
        Ok(())
    }
}

impl StatePublisher for UdpPublisher {
    fn publish_state(&mut self, record: &StateRecord) -> Result<()> {
        self.send(&self.topics.state, serde_json::to_value(record)?)
    }

    fn publish_status(&mut self, record: &StatusRecord) -> Result<()> {
        self.send(&self.topics.status, serde_json::to_value(record)?)
    }

    fn publish_discovery(&mut self, kind: ExerciseKind) -> Result<()> {
        let record = DiscoveryRecord::for_exercise(kind, &self.topics);
        self.send(&self.topics.config, serde_json::to_value(&record)?)
    }
}
