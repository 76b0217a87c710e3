use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::actuation::Relay;

/// Topics of the garden network. Every one of them is used at AtLeastOnce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    SensorData,
    LightStatus,
    WaterStatus,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::SensorData, Topic::LightStatus, Topic::WaterStatus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SensorData => "garden/sensorData",
            Topic::LightStatus => "garden/lightStatus",
            Topic::WaterStatus => "garden/waterStatus",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.as_str() == name)
    }

    /// Command topic that drives the given relay.
    pub fn for_relay(relay: Relay) -> Self {
        match relay {
            Relay::Light => Topic::LightStatus,
            Relay::Pump => Topic::WaterStatus,
        }
    }

    /// Relay driven by this topic, `None` for telemetry.
    pub fn relay(&self) -> Option<Relay> {
        match self {
            Topic::SensorData => None,
            Topic::LightStatus => Some(Relay::Light),
            Topic::WaterStatus => Some(Relay::Pump),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the unix epoch with millisecond resolution, the format of every `sent` field.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Light or water command, ordered by `sent`.
///
/// Commands from older controllers carry no `sent` field. They decode with
/// `sent = 0.0` so they can never override a timestamped command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub on: bool,
    #[serde(default)]
    pub sent: f64,
}

impl CommandMessage {
    pub fn new(on: bool, at: DateTime<Utc>) -> Self {
        Self {
            on,
            sent: epoch_seconds(at),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Relay state as reported in telemetry. Numeric so the cloud consumer can store it as a number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub light_relay: u8,
    pub pump_relay: u8,
}

impl RelayStatus {
    pub fn new(light_on: bool, pump_on: bool) -> Self {
        Self {
            light_relay: u8::from(light_on),
            pump_relay: u8::from(pump_on),
        }
    }
}

/// Payload of `garden/sensorData`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub temperature: f32,
    pub capacitance: u16,
    pub status: RelayStatus,
    pub sent: f64,
}

impl SensorSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

impl fmt::Display for SensorSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:.1}°C, capacitance {}, light {}, pump {}",
            self.temperature,
            self.capacitance,
            self.status.light_relay,
            self.status.pump_relay
        )
    }
}
