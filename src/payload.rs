// Calflow - Calibrated sensor derivation pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Payload validation boundary
//!
//! Transport payloads are loosely shaped JSON. This is the one place where
//! they are converted into a typed [`RawReading`]; nothing downstream ever
//! sees an untyped payload.
//!
//! Two layouts are accepted:
//!
//! ```json
//! {"device_id": "tank-01", "timestamp": 1700000000000,
//!  "sensor_type": "ultrasonic", "unit": "adc", "fields": {"level": 512}}
//! ```
//!
//! and the flat form, where every non-metadata key is a raw field:
//!
//! ```json
//! {"deviceId": "tank-01", "ts": 1700000000000, "levelRaw": 512, "flowRaw": 12}
//! ```

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::reading::{FieldKind, RawReading, DEFAULT_SENSOR_TYPE, DEFAULT_UNIT};

const DEVICE_KEYS: [&str; 2] = ["device_id", "deviceId"];
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "timestamp_ms", "ts"];
const SENSOR_TYPE_KEYS: [&str; 2] = ["sensor_type", "sensorType"];
const UNIT_KEYS: [&str; 1] = ["unit"];
const FIELDS_KEY: &str = "fields";

/// Parse a JSON text payload into a validated reading
pub fn parse_json(payload: &str) -> Result<RawReading, ValidationError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    from_value(&value)
}

/// Parse raw JSON bytes into a validated reading
pub fn parse_slice(payload: &[u8]) -> Result<RawReading, ValidationError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    from_value(&value)
}

/// Convert an untyped JSON value into a validated reading
pub fn from_value(value: &Value) -> Result<RawReading, ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

    let device_id = match first_of(obj, &DEVICE_KEYS) {
        Some((_, Value::String(s))) => s.trim().to_string(),
        Some((key, _)) => {
            return Err(ValidationError::InvalidType {
                field: key.to_string(),
                expected: "a string",
            })
        }
        None => return Err(ValidationError::MissingField("device_id")),
    };
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    let timestamp = match first_of(obj, &TIMESTAMP_KEYS) {
        Some((key, v)) => v.as_u64().ok_or_else(|| ValidationError::InvalidType {
            field: key.to_string(),
            expected: "a non-negative integer",
        })?,
        None => return Err(ValidationError::MissingField("timestamp")),
    };

    let sensor_type = optional_string(obj, &SENSOR_TYPE_KEYS)?
        .unwrap_or_else(|| DEFAULT_SENSOR_TYPE.to_string());
    let unit = optional_string(obj, &UNIT_KEYS)?.unwrap_or_else(|| DEFAULT_UNIT.to_string());

    let mut reading = RawReading::new(device_id, timestamp)
        .with_sensor_type(sensor_type)
        .with_unit(unit);

    match obj.get(FIELDS_KEY) {
        Some(Value::Object(fields)) => {
            for (name, v) in fields {
                let (kind, value) = parse_field(name, v)?;
                reading.fields.insert(kind, value);
            }
        }
        Some(_) => {
            return Err(ValidationError::InvalidType {
                field: FIELDS_KEY.to_string(),
                expected: "an object",
            })
        }
        None => {
            for (name, v) in obj {
                if is_metadata_key(name) {
                    continue;
                }
                let (kind, value) = parse_field(name, v)?;
                reading.fields.insert(kind, value);
            }
        }
    }

    reading.validate()?;
    Ok(reading)
}

fn parse_field(name: &str, value: &Value) -> Result<(FieldKind, f64), ValidationError> {
    let kind: FieldKind = name.parse()?;
    let number = value.as_f64().ok_or_else(|| ValidationError::InvalidType {
        field: name.to_string(),
        expected: "a number",
    })?;
    if !number.is_finite() {
        return Err(ValidationError::NonFinite(name.to_string()));
    }
    Ok((kind, number))
}

fn first_of<'a>(obj: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|key| obj.get(*key).map(|value| (*key, value)))
}

fn optional_string(
    obj: &Map<String, Value>,
    keys: &[&'static str],
) -> Result<Option<String>, ValidationError> {
    match first_of(obj, keys) {
        Some((_, Value::String(s))) => Ok(Some(s.clone())),
        Some((_, Value::Null)) | None => Ok(None),
        Some((key, _)) => Err(ValidationError::InvalidType {
            field: key.to_string(),
            expected: "a string",
        }),
    }
}

fn is_metadata_key(key: &str) -> bool {
    DEVICE_KEYS.contains(&key)
        || TIMESTAMP_KEYS.contains(&key)
        || SENSOR_TYPE_KEYS.contains(&key)
        || UNIT_KEYS.contains(&key)
}
