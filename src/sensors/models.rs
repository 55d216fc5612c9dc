use std::{fmt, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// SensorType — the closed set of gateway sensor type tags
// ---------------------------------------------------------------------------

/// Sensor type tags understood by the state decoder.
///
/// Every tag maps to exactly one `SensorState` variant. Tags outside this
/// list are rejected with `DecodeError::UnknownSensorType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    ClipPresence,
    Daylight,
    AirQuality,
    Battery,
    CarbonMonoxide,
    Consumption,
    Fire,
    Humidity,
    LightLevel,
    OpenClose,
    Power,
    Presence,
    Pressure,
    Switch,
    Temperature,
    Thermostat,
    Vibration,
    Water,
}

impl SensorType {
    pub const ALL: [SensorType; 18] = [
        Self::ClipPresence,
        Self::Daylight,
        Self::AirQuality,
        Self::Battery,
        Self::CarbonMonoxide,
        Self::Consumption,
        Self::Fire,
        Self::Humidity,
        Self::LightLevel,
        Self::OpenClose,
        Self::Power,
        Self::Presence,
        Self::Pressure,
        Self::Switch,
        Self::Temperature,
        Self::Thermostat,
        Self::Vibration,
        Self::Water,
    ];

    /// The tag as reported by the gateway.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClipPresence => "CLIPPresence",
            Self::Daylight => "Daylight",
            Self::AirQuality => "ZHAAirQuality",
            Self::Battery => "ZHABattery",
            Self::CarbonMonoxide => "ZHACarbonMonoxide",
            Self::Consumption => "ZHAConsumption",
            Self::Fire => "ZHAFire",
            Self::Humidity => "ZHAHumidity",
            Self::LightLevel => "ZHALightLevel",
            Self::OpenClose => "ZHAOpenClose",
            Self::Power => "ZHAPower",
            Self::Presence => "ZHAPresence",
            Self::Pressure => "ZHAPressure",
            Self::Switch => "ZHASwitch",
            Self::Temperature => "ZHATemperature",
            Self::Thermostat => "ZHAThermostat",
            Self::Vibration => "ZHAVibration",
            Self::Water => "ZHAWater",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownSensorType(s.to_owned()))
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{0} is not a known sensor type")]
    UnknownSensorType(String),

    #[error("malformed {sensor_type} state payload: {source}")]
    MalformedPayload {
        sensor_type: SensorType,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// State variants
//
// Every variant flattens the shared `State` block and adds its own
// measurements. Measurements are optional: the gateway often pushes partial
// state (a single changed value plus `lastupdated`), and an absent value must
// stay absent rather than read as zero. Integers keep the gateway's native
// units; scaling happens only in field derivation.
// ---------------------------------------------------------------------------

/// Properties reported by every sensor state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Gateway-local timestamp, e.g. `"2018-03-08T19:35:24"`; may be empty or `"none"`.
    #[serde(default)]
    pub lastupdated: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipPresence {
    #[serde(flatten)]
    pub base: State,
    pub presence: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Daylight {
    #[serde(flatten)]
    pub base: State,
    pub daylight: Option<bool>,
    /// Sun position code (e.g. 170 = sunrise end).
    pub status: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AirQuality {
    #[serde(flatten)]
    pub base: State,
    /// Qualitative level, e.g. `"good"`, `"moderate"`.
    pub airquality: Option<String>,
    pub airqualityppb: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    #[serde(flatten)]
    pub base: State,
    /// Percent.
    pub battery: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CarbonMonoxide {
    #[serde(flatten)]
    pub base: State,
    pub carbonmonoxide: Option<bool>,
    pub lowbattery: Option<bool>,
    pub tampered: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    #[serde(flatten)]
    pub base: State,
    /// Accumulated energy in Wh.
    pub consumption: Option<i64>,
    /// Watts.
    pub power: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fire {
    #[serde(flatten)]
    pub base: State,
    pub fire: Option<bool>,
    pub lowbattery: Option<bool>,
    pub tampered: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Humidity {
    #[serde(flatten)]
    pub base: State,
    /// Hundredths of a percent: 2985 → 29.85 %.
    pub humidity: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightLevel {
    #[serde(flatten)]
    pub base: State,
    /// Logarithmic light level: 10000 × log10(lux) + 1.
    pub lightlevel: Option<i64>,
    pub lux: Option<i64>,
    pub dark: Option<bool>,
    pub daylight: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenClose {
    #[serde(flatten)]
    pub base: State,
    pub open: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Power {
    #[serde(flatten)]
    pub base: State,
    /// Milliamps.
    pub current: Option<i64>,
    /// Watts.
    pub power: Option<i64>,
    /// Volts.
    pub voltage: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    #[serde(flatten)]
    pub base: State,
    pub presence: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pressure {
    #[serde(flatten)]
    pub base: State,
    /// hPa.
    pub pressure: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    #[serde(flatten)]
    pub base: State,
    /// Button code × 1000 + action, e.g. 1002 = button 1 short release.
    pub buttonevent: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    #[serde(flatten)]
    pub base: State,
    /// Hundredths of a degree Celsius: 2062 → 20.62 °C.
    pub temperature: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thermostat {
    #[serde(flatten)]
    pub base: State,
    /// Hundredths of a degree Celsius.
    pub temperature: Option<i64>,
    /// Valve position in percent.
    pub valve: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vibration {
    #[serde(flatten)]
    pub base: State,
    pub vibration: Option<bool>,
    pub tiltangle: Option<i64>,
    pub vibrationstrength: Option<i64>,
    /// `[x, y, z]`.
    pub orientation: Option<[i64; 3]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Water {
    #[serde(flatten)]
    pub base: State,
    pub water: Option<bool>,
    pub lowbattery: Option<bool>,
    pub tampered: Option<bool>,
}

// ---------------------------------------------------------------------------
// SensorState
// ---------------------------------------------------------------------------

/// Decoded state of one sensor.
///
/// `Empty` marks a sensor whose state could not be decoded or was never
/// reported; it carries no time-series data.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SensorState {
    ClipPresence(ClipPresence),
    Daylight(Daylight),
    AirQuality(AirQuality),
    Battery(Battery),
    CarbonMonoxide(CarbonMonoxide),
    Consumption(Consumption),
    Fire(Fire),
    Humidity(Humidity),
    LightLevel(LightLevel),
    OpenClose(OpenClose),
    Power(Power),
    Presence(Presence),
    Pressure(Pressure),
    Switch(Switch),
    Temperature(Temperature),
    Thermostat(Thermostat),
    Vibration(Vibration),
    Water(Water),
    #[default]
    Empty,
}

impl SensorState {
    /// The type tag this state was decoded for; `None` for `Empty`.
    pub fn sensor_type(&self) -> Option<SensorType> {
        let t = match self {
            Self::ClipPresence(_) => SensorType::ClipPresence,
            Self::Daylight(_) => SensorType::Daylight,
            Self::AirQuality(_) => SensorType::AirQuality,
            Self::Battery(_) => SensorType::Battery,
            Self::CarbonMonoxide(_) => SensorType::CarbonMonoxide,
            Self::Consumption(_) => SensorType::Consumption,
            Self::Fire(_) => SensorType::Fire,
            Self::Humidity(_) => SensorType::Humidity,
            Self::LightLevel(_) => SensorType::LightLevel,
            Self::OpenClose(_) => SensorType::OpenClose,
            Self::Power(_) => SensorType::Power,
            Self::Presence(_) => SensorType::Presence,
            Self::Pressure(_) => SensorType::Pressure,
            Self::Switch(_) => SensorType::Switch,
            Self::Temperature(_) => SensorType::Temperature,
            Self::Thermostat(_) => SensorType::Thermostat,
            Self::Vibration(_) => SensorType::Vibration,
            Self::Water(_) => SensorType::Water,
            Self::Empty => return None,
        };
        Some(t)
    }

    /// The shared state block; `None` for `Empty`.
    pub fn base(&self) -> Option<&State> {
        let base = match self {
            Self::ClipPresence(s) => &s.base,
            Self::Daylight(s) => &s.base,
            Self::AirQuality(s) => &s.base,
            Self::Battery(s) => &s.base,
            Self::CarbonMonoxide(s) => &s.base,
            Self::Consumption(s) => &s.base,
            Self::Fire(s) => &s.base,
            Self::Humidity(s) => &s.base,
            Self::LightLevel(s) => &s.base,
            Self::OpenClose(s) => &s.base,
            Self::Power(s) => &s.base,
            Self::Presence(s) => &s.base,
            Self::Pressure(s) => &s.base,
            Self::Switch(s) => &s.base,
            Self::Temperature(s) => &s.base,
            Self::Thermostat(s) => &s.base,
            Self::Vibration(s) => &s.base,
            Self::Water(s) => &s.base,
            Self::Empty => return None,
        };
        Some(base)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Decodes a raw state payload into the variant selected by `sensor_type`.
///
/// Pure: no I/O, no logging. Callers decide how to degrade on error.
pub fn decode_state(raw: &Value, sensor_type: &str) -> Result<SensorState, DecodeError> {
    let kind: SensorType = sensor_type.parse()?;

    let state = match kind {
        SensorType::ClipPresence => SensorState::ClipPresence(from_raw(raw, kind)?),
        SensorType::Daylight => SensorState::Daylight(from_raw(raw, kind)?),
        SensorType::AirQuality => SensorState::AirQuality(from_raw(raw, kind)?),
        SensorType::Battery => SensorState::Battery(from_raw(raw, kind)?),
        SensorType::CarbonMonoxide => SensorState::CarbonMonoxide(from_raw(raw, kind)?),
        SensorType::Consumption => SensorState::Consumption(from_raw(raw, kind)?),
        SensorType::Fire => SensorState::Fire(from_raw(raw, kind)?),
        SensorType::Humidity => SensorState::Humidity(from_raw(raw, kind)?),
        SensorType::LightLevel => SensorState::LightLevel(from_raw(raw, kind)?),
        SensorType::OpenClose => SensorState::OpenClose(from_raw(raw, kind)?),
        SensorType::Power => SensorState::Power(from_raw(raw, kind)?),
        SensorType::Presence => SensorState::Presence(from_raw(raw, kind)?),
        SensorType::Pressure => SensorState::Pressure(from_raw(raw, kind)?),
        SensorType::Switch => SensorState::Switch(from_raw(raw, kind)?),
        SensorType::Temperature => SensorState::Temperature(from_raw(raw, kind)?),
        SensorType::Thermostat => SensorState::Thermostat(from_raw(raw, kind)?),
        SensorType::Vibration => SensorState::Vibration(from_raw(raw, kind)?),
        SensorType::Water => SensorState::Water(from_raw(raw, kind)?),
    };

    Ok(state)
}

fn from_raw<T: DeserializeOwned>(raw: &Value, sensor_type: SensorType) -> Result<T, DecodeError> {
    T::deserialize(raw).map_err(|source| DecodeError::MalformedPayload { sensor_type, source })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
