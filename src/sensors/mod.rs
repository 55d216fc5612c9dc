pub mod fields;
pub mod models;
pub mod service;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub use fields::{derive_point, DeriveError, FieldValue, Fields, Tags, TimeseriesPoint};
pub use models::{decode_state, DecodeError, SensorState, SensorType};

/// Gateway format of `lastseen`, minute precision.
const LAST_SEEN_FORMAT: &str = "%Y-%m-%dT%H:%MZ";

/// A gateway sensor: static metadata plus the last decoded state.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    pub id: i64,
    /// Raw type tag, e.g. `"ZHATemperature"`. Kept verbatim so sensors of
    /// unsupported types can still be listed.
    pub sensor_type: String,
    pub name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub config: SensorConfig,
    pub state: SensorState,
}

/// Sensor configuration as reported by the REST API.
///
/// Every value is optional; sensors only report what applies to them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SensorConfig {
    /// Battery level in percent.
    pub battery: Option<u8>,
    /// Hundredths of a degree Celsius.
    pub heatsetpoint: Option<i64>,
    pub mode: Option<String>,
    /// Hundredths of a degree Celsius.
    pub offset: Option<i64>,
    /// Hundredths of a degree Celsius.
    pub externalsensortemp: Option<i64>,
}

#[derive(Debug, Error)]
pub enum SensorParseError {
    #[error("sensor {id}: {source}")]
    Json {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("sensor {id}: invalid lastseen {value:?}")]
    LastSeen {
        id: i64,
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("invalid sensor id {0:?}")]
    Id(String),
}

/// Sensor object as returned by `GET /api/<key>/sensors/<id>`.
#[derive(Debug, Deserialize)]
struct RestSensor {
    #[serde(rename = "type", default)]
    sensor_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    lastseen: Option<String>,
    #[serde(default)]
    state: Value,
    // Both spellings fill one field; a body carrying both is a duplicate field.
    #[serde(default, alias = "Config")]
    config: Option<SensorConfig>,
}

impl Sensor {
    /// Builds a sensor from its REST representation.
    ///
    /// A state that cannot be decoded degrades to `SensorState::Empty`; the
    /// sensor itself is still returned.
    pub fn from_rest(id: i64, raw: &Value) -> Result<Self, SensorParseError> {
        let rest = RestSensor::deserialize(raw).map_err(|source| SensorParseError::Json { id, source })?;

        let last_seen = match rest.lastseen.as_deref() {
            None | Some("") => None,
            Some(value) => Some(parse_last_seen(value).map_err(|source| SensorParseError::LastSeen {
                id,
                value: value.to_owned(),
                source,
            })?),
        };

        let state = match decode_state(&rest.state, &rest.sensor_type) {
            Ok(state) => state,
            Err(e) => {
                warn!(sensor_id = id, error = %e, "Unable to decode sensor state; using empty state");
                SensorState::Empty
            }
        };

        Ok(Self {
            id,
            sensor_type: rest.sensor_type,
            name: rest.name,
            last_seen,
            config: rest.config.unwrap_or_default(),
            state,
        })
    }

    /// Time-series point for the sensor's own (REST) state.
    pub fn timeseries(&self, now: DateTime<Utc>) -> Result<TimeseriesPoint, DeriveError> {
        derive_point(self, &self.state, now)
    }
}

/// Parses the body of `GET /api/<key>/sensors`: an object keyed by sensor id.
///
/// Sensors that fail to parse are skipped with a warning.
pub fn parse_sensors(body: &[u8]) -> serde_json::Result<HashMap<i64, Sensor>> {
    let raw: HashMap<String, Value> = serde_json::from_slice(body)?;

    let sensors = raw
        .iter()
        .filter_map(|(key, value)| {
            let parsed = key
                .parse::<i64>()
                .map_err(|_| SensorParseError::Id(key.clone()))
                .and_then(|id| Sensor::from_rest(id, value));
            match parsed {
                Ok(sensor) => Some((sensor.id, sensor)),
                Err(e) => {
                    warn!(error = %e, "Skipping sensor");
                    None
                }
            }
        })
        .collect();

    Ok(sensors)
}

fn parse_last_seen(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, LAST_SEEN_FORMAT)
        .map(|t| t.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc)))
}
