use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::PrimitiveDateTime;

use crate::error::{SessionError, ValidationError};
use crate::utils::{format_date, format_time};

/// Stable index of one logical device's data stream, starting at 1
pub type Slot = u8;

/// Latest record per slot
pub type Snapshot = BTreeMap<Slot, SensorRecord>;

/// What a session does with its link besides ingesting notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Inbound telemetry only
    Sensor,
    /// Inbound telemetry plus periodic snapshot push back over the link
    Companion,
}

/// Configured binding between a device-name pattern and a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub slot: Slot,
    pub label: String,
    pub pattern: String,
    pub role: DeviceRole,
}

impl DeviceSpec {
    pub fn matches(&self, advertised_name: &str) -> bool {
        advertised_name.contains(&self.pattern)
    }
}

/// Device resolved at discovery time; fixed for the lifetime of its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub label: String,
    pub address: String,
    pub slot: Slot,
}

impl DeviceIdentity {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.address.trim().is_empty() {
            return Err(SessionError::InvalidParameters(format!(
                "{}: empty transport address",
                self.label
            )));
        }
        if self.label.trim().is_empty() {
            return Err(SessionError::InvalidParameters(format!(
                "slot {}: empty label",
                self.slot
            )));
        }
        if self.slot == 0 {
            return Err(SessionError::InvalidParameters(format!(
                "{}: slot indices start at 1",
                self.label
            )));
        }
        Ok(())
    }
}

/// One accelerometer + gyroscope sensor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MotionReading {
    pub ax: Option<f64>,
    pub ay: Option<f64>,
    pub az: Option<f64>,
    pub gx: Option<f64>,
    pub gy: Option<f64>,
    pub gz: Option<f64>,
}

/// Magnetometer axes and the heading computed on the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MagnetometerReading {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub heading: Option<f64>,
}

/// Number of numeric columns in a record
pub const RECORD_VALUE_COUNT: usize = 16;

/// One decoded notification. `None` marks a field the device did not send.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub mpu1: MotionReading,
    pub mpu2: MotionReading,
    pub hmc: MagnetometerReading,
    pub captured_at: PrimitiveDateTime,
}

impl SensorRecord {
    /// Numeric fields in log column order
    pub fn values(&self) -> [Option<f64>; RECORD_VALUE_COUNT] {
        let (m1, m2, h) = (&self.mpu1, &self.mpu2, &self.hmc);
        [
            m1.ax, m1.ay, m1.az, m1.gx, m1.gy, m1.gz, m2.ax, m2.ay, m2.az, m2.gx, m2.gy, m2.gz, h.x,
            h.y, h.z, h.heading,
        ]
    }

    /// Inverse of [`SensorRecord::values`]
    #[cfg(test)]
    pub fn from_values(
        v: [Option<f64>; RECORD_VALUE_COUNT],
        captured_at: PrimitiveDateTime,
    ) -> Self {
        SensorRecord {
            mpu1: MotionReading {
                ax: v[0],
                ay: v[1],
                az: v[2],
                gx: v[3],
                gy: v[4],
                gz: v[5],
            },
            mpu2: MotionReading {
                ax: v[6],
                ay: v[7],
                az: v[8],
                gx: v[9],
                gy: v[10],
                gz: v[11],
            },
            hmc: MagnetometerReading {
                x: v[12],
                y: v[13],
                z: v[14],
                heading: v[15],
            },
            captured_at,
        }
    }

    pub fn grouped(&self) -> GroupedReading<'_> {
        GroupedReading {
            mpu1: &self.mpu1,
            mpu2: &self.mpu2,
            hmc: &self.hmc,
            timestamps: TimestampView {
                date: format_date(self.captured_at.date()),
                time: format_time(self.captured_at.time()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TimestampView {
    pub date: String,
    pub time: String,
}

/// Record reshaped into the sensor groups served to clients
#[derive(Debug, Serialize)]
pub struct GroupedReading<'a> {
    #[serde(rename = "MPU1")]
    pub mpu1: &'a MotionReading,
    #[serde(rename = "MPU2")]
    pub mpu2: &'a MotionReading,
    #[serde(rename = "HMC")]
    pub hmc: &'a MagnetometerReading,
    #[serde(rename = "Timestamps")]
    pub timestamps: TimestampView,
}

/// Re-key a snapshot by device label. Slots without a record are absent.
pub fn group_snapshot<'a>(
    snapshot: &'a Snapshot,
    labels: &BTreeMap<Slot, String>,
) -> BTreeMap<String, GroupedReading<'a>> {
    snapshot
        .iter()
        .map(|(slot, record)| {
            let label = labels
                .get(slot)
                .cloned()
                .unwrap_or_else(|| format!("slot-{}", slot));
            (label, record.grouped())
        })
        .collect()
}

/// Activity label submitted by the companion client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityAnnotation {
    pub activity_label: String,
    pub activity_start_date: String,
    pub activity_start_time: String,
    pub activity_end_date: String,
    pub activity_end_time: String,
}

impl ActivityAnnotation {
    /// Required body fields, also the annotation log's column order
    pub const FIELDS: [&'static str; 5] = [
        "activity_label",
        "activity_start_date",
        "activity_start_time",
        "activity_end_date",
        "activity_end_time",
    ];

    /// Validate a request body. All missing fields are reported at once.
    pub fn from_json(body: &Value) -> Result<Self, ValidationError> {
        let object = body.as_object().ok_or(ValidationError::NotAnObject)?;

        let missing: Vec<&'static str> = Self::FIELDS
            .iter()
            .copied()
            .filter(|field| object.get(*field).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing));
        }

        let field = |name: &'static str| -> Result<String, ValidationError> {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ValidationError::InvalidField(name))
        };

        Ok(ActivityAnnotation {
            activity_label: field("activity_label")?,
            activity_start_date: field("activity_start_date")?,
            activity_start_time: field("activity_start_time")?,
            activity_end_date: field("activity_end_date")?,
            activity_end_time: field("activity_end_time")?,
        })
    }

    pub fn columns(&self) -> [&str; 5] {
        [
            &self.activity_label,
            &self.activity_start_date,
            &self.activity_start_time,
            &self.activity_end_date,
            &self.activity_end_time,
        ]
    }
}
