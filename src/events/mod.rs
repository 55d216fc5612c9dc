pub mod reader;
pub mod tcp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::sensors::{decode_state, derive_point, DecodeError, DeriveError, Sensor, SensorState, TimeseriesPoint};

pub use reader::{LoopState, SensorEventReader, StartError};
pub use tcp::LineEventReader;

/// Resource name of sensor events; everything else is ignored.
pub const SENSOR_RESOURCE: &str = "sensors";

// ---------------------------------------------------------------------------
// RawEvent — one message from the gateway event feed
//
//   {"e":"changed","id":"1","r":"sensors","state":{...},"t":"event"}
//
// `state` stays undecoded until the sensor type is known. Scene events carry
// no `id`, config-only changes carry no `state`; their `config` is ignored.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEvent {
    /// Message type, `"event"` for resource events.
    #[serde(rename = "t", default)]
    pub message_type: String,

    /// Event kind: `"changed"`, `"added"`, `"deleted"`, ...
    #[serde(rename = "e", default)]
    pub event_kind: String,

    /// Resource name: `"sensors"`, `"lights"`, `"groups"`, `"scenes"`.
    #[serde(rename = "r", default)]
    pub resource_name: String,

    /// Resource id; the gateway sends it as a string.
    #[serde(default, deserialize_with = "de_resource_id")]
    pub id: Option<i64>,

    /// Undecoded state payload.
    #[serde(default)]
    pub state: Option<Value>,
}

impl RawEvent {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn is_sensor_event(&self) -> bool {
        self.resource_name == SENSOR_RESOURCE
    }
}

fn de_resource_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    match Option::<RawId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawId::Int(id)) => Ok(Some(id)),
        Some(RawId::Text(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid resource id {s:?}"))),
    }
}

// ---------------------------------------------------------------------------
// SensorEvent — the unit handed to the sink
// ---------------------------------------------------------------------------

/// A sensor event bound to the sensor that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    pub sensor: Sensor,
    pub event: RawEvent,
    state: SensorState,
}

impl SensorEvent {
    /// Decodes the event's state payload using the sensor's type.
    ///
    /// Returns `Ok(None)` for events that carry no state.
    pub fn decode(sensor: Sensor, event: RawEvent) -> Result<Option<Self>, DecodeError> {
        let Some(raw) = event.state.as_ref() else {
            return Ok(None);
        };
        let state = decode_state(raw, &sensor.sensor_type)?;
        Ok(Some(Self { sensor, event, state }))
    }

    pub fn resource_id(&self) -> i64 {
        self.sensor.id
    }

    pub fn resource(&self) -> &str {
        &self.event.resource_name
    }

    pub fn state(&self) -> &SensorState {
        &self.state
    }

    /// Time-series point for the event's state, merged with the sensor config.
    pub fn timeseries(&self, now: DateTime<Utc>) -> Result<TimeseriesPoint, DeriveError> {
        derive_point(&self.sensor, &self.state, now)
    }
}

// ---------------------------------------------------------------------------
// EventReader — transport capability consumed by the event loop
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ReadError {
    /// A single undecodable message; the connection is still usable.
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReadError {
    /// Recoverable errors drop one event; the rest force a redial.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Connection to the gateway event feed.
///
/// `dial` (re)establishes the connection, `read_event` yields the next
/// message, `close` releases the transport. A reader must be dialable again
/// after a connection loss.
#[async_trait]
pub trait EventReader: Send {
    async fn dial(&mut self) -> anyhow::Result<()>;
    async fn read_event(&mut self) -> Result<RawEvent, ReadError>;
    async fn close(&mut self) -> anyhow::Result<()>;
}
