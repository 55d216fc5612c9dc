use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::{
    models::{SensorState, SensorType, State},
    Sensor,
};

/// Format of `lastupdated`; the fractional part is optional.
const LAST_UPDATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Value of a single time-series field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq)]
pub enum DeriveError {
    #[error("sensor {name} ({sensor_type}) has no time series data")]
    NoTimeseriesData { name: String, sensor_type: String },

    #[error("thermostat {name} is missing config values: {}", .missing.join(", "))]
    IncompleteThermostatConfig {
        name: String,
        missing: Vec<&'static str>,
    },
}

/// One point ready for the time-series sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeseriesPoint {
    pub measurement: String,
    pub tags: Tags,
    pub fields: Fields,
    pub time: DateTime<Utc>,
}

/// Derives tags and fields for `state` as reported by `sensor`.
///
/// The state's own fields take precedence over anything merged in from the
/// sensor config. `now` is both the reference for `age_secs` and the point
/// timestamp, so deriving twice with the same `now` yields the same point.
pub fn derive_point(
    sensor: &Sensor,
    state: &SensorState,
    now: DateTime<Utc>,
) -> Result<TimeseriesPoint, DeriveError> {
    let no_data = || DeriveError::NoTimeseriesData {
        name: sensor.name.clone(),
        sensor_type: sensor.sensor_type.clone(),
    };

    let mut fields = state_fields(state, now).ok_or_else(no_data)?;

    if let Some(battery) = sensor.config.battery {
        fields
            .entry("battery".to_owned())
            .or_insert(FieldValue::Int(i64::from(battery)));
    }

    if sensor.sensor_type == SensorType::Thermostat.as_str() {
        for (key, value) in thermostat_fields(sensor)? {
            fields.entry(key.to_owned()).or_insert(value);
        }
    }

    if fields.is_empty() {
        return Err(no_data());
    }

    let tags = Tags::from([
        ("name".to_owned(), sensor.name.clone()),
        ("type".to_owned(), sensor.sensor_type.clone()),
        ("id".to_owned(), sensor.id.to_string()),
        ("source".to_owned(), "rest".to_owned()),
    ]);

    Ok(TimeseriesPoint {
        measurement: format!("deconz_{}", sensor.sensor_type),
        tags,
        fields,
        time: now,
    })
}

/// Parses `lastupdated`; `None` when empty or unparsable.
pub fn parse_last_updated(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    match NaiveDateTime::parse_from_str(raw, LAST_UPDATED_FORMAT) {
        Ok(t) => Some(t.and_utc()),
        Err(e) => {
            debug!(lastupdated = %raw, error = %e, "Unparsable lastupdated; omitting age_secs");
            None
        }
    }
}

fn base_fields(base: &State, now: DateTime<Utc>) -> Fields {
    let mut fields = Fields::new();
    if let Some(t) = parse_last_updated(&base.lastupdated) {
        fields.insert("age_secs".to_owned(), FieldValue::Int((now - t).num_seconds()));
    }
    fields
}

fn put<V: Into<FieldValue>>(fields: &mut Fields, key: &str, value: Option<V>) {
    if let Some(v) = value {
        fields.insert(key.to_owned(), v.into());
    }
}

/// Hundredths → units, e.g. 2062 → 20.62.
fn hundredths(v: Option<i64>) -> Option<f64> {
    v.map(|v| v as f64 / 100.0)
}

/// Base fields plus the variant's measurements; `None` for the empty state.
fn state_fields(state: &SensorState, now: DateTime<Utc>) -> Option<Fields> {
    let mut f = base_fields(state.base()?, now);

    match state {
        SensorState::ClipPresence(s) => put(&mut f, "presence", s.presence),
        SensorState::Daylight(s) => {
            put(&mut f, "daylight", s.daylight);
            put(&mut f, "status", s.status);
        }
        SensorState::AirQuality(s) => {
            put(&mut f, "airquality", s.airquality.clone());
            put(&mut f, "airqualityppb", s.airqualityppb);
        }
        SensorState::Battery(s) => put(&mut f, "battery", s.battery),
        SensorState::CarbonMonoxide(s) => {
            put(&mut f, "carbonmonoxide", s.carbonmonoxide);
            put(&mut f, "lowbattery", s.lowbattery);
            put(&mut f, "tampered", s.tampered);
        }
        SensorState::Consumption(s) => {
            put(&mut f, "consumption", s.consumption);
            put(&mut f, "power", s.power);
        }
        SensorState::Fire(s) => {
            put(&mut f, "fire", s.fire);
            put(&mut f, "lowbattery", s.lowbattery);
            put(&mut f, "tampered", s.tampered);
        }
        SensorState::Humidity(s) => put(&mut f, "humidity", hundredths(s.humidity)),
        SensorState::LightLevel(s) => {
            put(&mut f, "lightlevel", s.lightlevel);
            put(&mut f, "lux", s.lux);
            put(&mut f, "dark", s.dark);
            put(&mut f, "daylight", s.daylight);
        }
        SensorState::OpenClose(s) => put(&mut f, "open", s.open),
        SensorState::Power(s) => {
            put(&mut f, "current", s.current);
            put(&mut f, "power", s.power);
            put(&mut f, "voltage", s.voltage);
        }
        SensorState::Presence(s) => put(&mut f, "presence", s.presence),
        SensorState::Pressure(s) => put(&mut f, "pressure", s.pressure),
        SensorState::Switch(s) => put(&mut f, "buttonevent", s.buttonevent),
        SensorState::Temperature(s) => put(&mut f, "temperature", hundredths(s.temperature)),
        SensorState::Thermostat(s) => {
            put(&mut f, "temperature", hundredths(s.temperature));
            put(&mut f, "valve", s.valve);
        }
        SensorState::Vibration(s) => {
            put(&mut f, "vibration", s.vibration);
            put(&mut f, "tiltangle", s.tiltangle);
            put(&mut f, "vibrationstrength", s.vibrationstrength);
            if let Some([x, y, z]) = s.orientation {
                put(&mut f, "orientation_x", Some(x));
                put(&mut f, "orientation_y", Some(y));
                put(&mut f, "orientation_z", Some(z));
            }
        }
        SensorState::Water(s) => {
            put(&mut f, "water", s.water);
            put(&mut f, "lowbattery", s.lowbattery);
            put(&mut f, "tampered", s.tampered);
        }
        SensorState::Empty => return None,
    }

    Some(f)
}

/// The four thermostat config fields; all must be present.
fn thermostat_fields(sensor: &Sensor) -> Result<[(&'static str, FieldValue); 4], DeriveError> {
    let c = &sensor.config;
    match (c.heatsetpoint, c.mode.as_ref(), c.offset, c.externalsensortemp) {
        (Some(heatsetpoint), Some(mode), Some(offset), Some(external)) => Ok([
            ("heatsetpoint", FieldValue::Float(heatsetpoint as f64 / 100.0)),
            ("mode", FieldValue::Text(mode.clone())),
            ("offset", FieldValue::Float(offset as f64 / 100.0)),
            ("externalsensortemp", FieldValue::Float(external as f64 / 100.0)),
        ]),
        _ => {
            let missing = [
                ("heatsetpoint", c.heatsetpoint.is_none()),
                ("mode", c.mode.is_none()),
                ("offset", c.offset.is_none()),
                ("externalsensortemp", c.externalsensortemp.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            Err(DeriveError::IncompleteThermostatConfig {
                name: sensor.name.clone(),
                missing,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
