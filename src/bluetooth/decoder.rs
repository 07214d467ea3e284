/// Notification payload decoding
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::models::{MagnetometerReading, MotionReading, SensorRecord};
use crate::utils::capture_timestamp;

/// Decode one notification payload sent by the sensor firmware
///
/// The firmware sends a UTF-8 JSON object shaped like:
///
/// ```text
/// {
///   "MPU1": {"ax": .., "ay": .., "az": .., "gx": .., "gy": .., "gz": ..},
///   "MPU2": {"ax": .., "ay": .., "az": .., "gx": .., "gy": .., "gz": ..},
///   "HMC":  {"x": .., "y": .., "z": .., "heading": ..}
/// }
/// ```
///
/// Any group or field may be absent (the firmware drops readings from a
/// sensor that did not answer in time); such fields decode to `None`.
/// Numbers sent as strings are accepted. The capture timestamp is taken
/// here, not from the payload.
///
/// # Returns
/// The record, or a DecodeError when the bytes are not a JSON object
pub fn decode_payload(data: &[u8]) -> Result<SensorRecord, DecodeError> {
    let text = std::str::from_utf8(data)?;
    let root: Value = serde_json::from_str(text.trim_end_matches('\0'))?;
    let root = root.as_object().ok_or(DecodeError::NotAnObject)?;

    Ok(SensorRecord {
        mpu1: motion_group(root, "MPU1"),
        mpu2: motion_group(root, "MPU2"),
        hmc: magnetometer_group(root, "HMC"),
        captured_at: capture_timestamp(),
    })
}

fn motion_group(root: &Map<String, Value>, key: &str) -> MotionReading {
    let group = root.get(key).and_then(Value::as_object);
    MotionReading {
        ax: number(group, "ax"),
        ay: number(group, "ay"),
        az: number(group, "az"),
        gx: number(group, "gx"),
        gy: number(group, "gy"),
        gz: number(group, "gz"),
    }
}

fn magnetometer_group(root: &Map<String, Value>, key: &str) -> MagnetometerReading {
    let group = root.get(key).and_then(Value::as_object);
    MagnetometerReading {
        x: number(group, "x"),
        y: number(group, "y"),
        z: number(group, "z"),
        heading: number(group, "heading"),
    }
}

fn number(group: Option<&Map<String, Value>>, field: &str) -> Option<f64> {
    let value = match group?.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    // NaN/inf cannot be written back as a JSON number
    value.is_finite().then_some(value)
}
