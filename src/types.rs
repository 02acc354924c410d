//! This module contains the state records exchanged between the PSU and the pub/sub side.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::Result,
    preset::{PRESET_GROUPS, Preset},
    register::{ModelNumber, OutputMode, ProtectionStatus},
};

/// One complete decoded read of the PSU. Every numeric field is in physical units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub model: ModelNumber,
    pub serial_no: u32,
    pub firmware_version: String,
    pub temp_c: i32,
    pub temp_f: i32,
    pub output_voltage_set: f64,
    pub output_current_set: f64,
    pub ovp: f64,
    pub ocp: f64,
    pub output_voltage_disp: f64,
    pub output_current_disp: f64,
    pub output_power_disp: f64,
    pub input_voltage: f64,
    pub protection_status: ProtectionStatus,
    pub output_mode: OutputMode,
    pub output_enable: bool,
    pub battery_mode: bool,
    pub battery_voltage: f64,
    pub ext_temp_c: i32,
    pub ext_temp_f: i32,
    pub batt_ah: f64,
    pub batt_wh: f64,
    pub presets: Vec<Preset>,
}

/// Payload published on `<base>/psu/<identity>/state`.
///
/// Without a snapshot this is the status-only reply: just `connected` and `period`.
#[derive(Debug, Clone, Serialize)]
pub struct StateMessage {
    pub connected: bool,
    pub period: f64,
    #[serde(flatten)]
    pub snapshot: Option<DeviceSnapshot>,
}

impl StateMessage {
    pub fn status(connected: bool, period: f64) -> Self {
        Self {
            connected,
            period,
            snapshot: None,
        }
    }

    pub fn snapshot(snapshot: DeviceSnapshot, period: f64) -> Self {
        Self {
            connected: true,
            period,
            snapshot: Some(snapshot),
        }
    }
}

/// Entry of the list published on `<base>/psu/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PsuListEntry {
    pub identity: String,
    pub name: String,
    pub model: u16,
    pub serial_no: u32,
}

/// Sparse set of changes to apply to the PSU. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StateSetRequest {
    #[serde(default, deserialize_with = "coerce_preset_index")]
    pub preset_index: Option<u16>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub output_voltage_set: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub output_current_set: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub ovp: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub ocp: Option<f64>,
    #[serde(default, deserialize_with = "coerce_bool")]
    pub output_enable: Option<bool>,
    #[serde(default, deserialize_with = "coerce_bool")]
    pub output_toggle: Option<bool>,
}

impl StateSetRequest {
    /// Decode a set command in one step. Any field failing coercion rejects the lot.
    ///
    /// Keys this record does not know about are ignored.
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(payload.clone()))?)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn coerce_f64<'de, D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Option<f64>, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("{n} is not a float"))),
        Value::Bool(b) => Ok(Some(if b { 1.0 } else { 0.0 })),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("'{s}' is not a float"))),
        other => Err(D::Error::custom(format!("{other} is not a float"))),
    }
}

fn coerce_preset_index<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> core::result::Result<Option<u16>, D::Error> {
    use serde::de::Error;

    let index = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| D::Error::custom(format!("{n} is not an integer")))?,
        Value::Bool(b) => b as i64,
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("'{s}' is not an integer")))?,
        other => return Err(D::Error::custom(format!("{other} is not an integer"))),
    };

    if !(0..PRESET_GROUPS as i64).contains(&index) {
        return Err(D::Error::custom(format!("preset index {index} out of range")));
    }
    Ok(Some(index as u16))
}

fn coerce_bool<'de, D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Option<bool>, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b)),
        Value::Number(n) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Ok(Some(true)),
            "false" | "off" | "0" => Ok(Some(false)),
            _ => Err(D::Error::custom(format!("'{s}' is not a boolean"))),
        },
        other => Err(D::Error::custom(format!("{other} is not a boolean"))),
    }
}
