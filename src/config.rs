use bluer::Uuid;
use log::info;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{DeviceRole, DeviceSpec, Slot};
use crate::session::device::SessionSettings;
use crate::storage::log_file::file_name_for;
use crate::storage::record_store::ANNOTATION_LOG_FILE;

// Defaults match the firmware flashed on the ESP32 sensor boards
const DEFAULT_SERVICE_UUID: &str = "12345678-1234-1234-1234-123456789abc";
const DEFAULT_CHARACTERISTIC_UUID: &str = "abcd1234-5678-1234-5678-123456789abc";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_HTTP_BIND: &str = "0.0.0.0:5000";
const DEFAULT_COMPANION_LABEL: &str = "Companion";
const DEFAULT_SCAN_DURATION_SECS: u64 = 10;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 1;
const DEFAULT_PUSH_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// One entry per slot, in slot order
    pub devices: Vec<DeviceSpec>,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub data_dir: PathBuf,
    pub http_bind: String,
    pub scan_duration: Duration,
    pub reconnect_delay: Duration,
    pub liveness_interval: Duration,
    pub push_interval: Duration,
}

impl CollectorConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut devices = Vec::new();

        // Try DEVICE_PATTERNS format first
        if let Some(patterns) = lookup("DEVICE_PATTERNS") {
            for pair in patterns.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (label, pattern) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid DEVICE_PATTERNS entry '{}'", pair))?;
                let (label, pattern) = (label.trim(), pattern.trim());
                if label.is_empty() || pattern.is_empty() {
                    return Err(format!("Invalid DEVICE_PATTERNS entry '{}'", pair).into());
                }
                devices.push(DeviceSpec {
                    slot: next_slot(&devices)?,
                    label: label.to_string(),
                    pattern: pattern.to_string(),
                    role: DeviceRole::Sensor,
                });
            }
        } else {
            // Fallback to numbered DEVICE_<N>_PATTERN / DEVICE_<N>_LABEL variables
            let mut index = 1;
            while let Some(pattern) = lookup(&format!("DEVICE_{}_PATTERN", index)) {
                let label = lookup(&format!("DEVICE_{}_LABEL", index))
                    .unwrap_or_else(|| format!("ESP32-{}", index));
                devices.push(DeviceSpec {
                    slot: next_slot(&devices)?,
                    label: label.trim().to_string(),
                    pattern: pattern.trim().to_string(),
                    role: DeviceRole::Sensor,
                });
                index += 1;
            }
        }

        if devices.is_empty() {
            return Err("No devices configured. Please set DEVICE_PATTERNS or DEVICE_<N>_PATTERN/DEVICE_<N>_LABEL environment variables".into());
        }

        if let Some(pattern) = lookup("COMPANION_PATTERN").filter(|p| !p.trim().is_empty()) {
            let label = lookup("COMPANION_LABEL")
                .unwrap_or_else(|| DEFAULT_COMPANION_LABEL.to_string());
            devices.push(DeviceSpec {
                slot: next_slot(&devices)?,
                label: label.trim().to_string(),
                pattern: pattern.trim().to_string(),
                role: DeviceRole::Companion,
            });
        }

        // Labels name the log files, so two labels that sanitize to the same
        // file name would share one log
        let mut seen = BTreeMap::new();
        for device in &devices {
            let file_name = file_name_for(&device.label);
            if file_name == ANNOTATION_LOG_FILE {
                return Err(format!(
                    "Label '{}' would overwrite the activity label log",
                    device.label
                )
                .into());
            }
            let previous = seen.insert(file_name.clone(), (&device.label, device.slot));
            if let Some((label, slot)) = previous {
                return Err(format!(
                    "Labels '{}' (slot {}) and '{}' (slot {}) both log to {}",
                    label, slot, device.label, device.slot, file_name
                )
                .into());
            }
        }

        let uuid = |key: &str, default: &str| -> Result<Uuid, Box<dyn std::error::Error>> {
            let value = lookup(key).unwrap_or_else(|| default.to_string());
            Uuid::parse_str(value.trim()).map_err(|e| format!("Invalid {}: {}", key, e).into())
        };
        let seconds = |key: &str, default: u64| -> Result<Duration, Box<dyn std::error::Error>> {
            match lookup(key) {
                Some(value) => {
                    let secs: u64 = value
                        .trim()
                        .parse()
                        .map_err(|e| format!("Invalid {}: {}", key, e))?;
                    if secs == 0 {
                        return Err(format!("{} must be at least 1", key).into());
                    }
                    Ok(Duration::from_secs(secs))
                }
                None => Ok(Duration::from_secs(default)),
            }
        };

        Ok(CollectorConfig {
            devices,
            service_uuid: uuid("SERVICE_UUID", DEFAULT_SERVICE_UUID)?,
            characteristic_uuid: uuid("CHARACTERISTIC_UUID", DEFAULT_CHARACTERISTIC_UUID)?,
            data_dir: PathBuf::from(
                lookup("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            ),
            http_bind: lookup("HTTP_BIND").unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string()),
            scan_duration: seconds("SCAN_DURATION_SECS", DEFAULT_SCAN_DURATION_SECS)?,
            reconnect_delay: seconds("RECONNECT_DELAY_SECS", DEFAULT_RECONNECT_DELAY_SECS)?,
            liveness_interval: seconds("LIVENESS_INTERVAL_SECS", DEFAULT_LIVENESS_INTERVAL_SECS)?,
            push_interval: seconds("PUSH_INTERVAL_SECS", DEFAULT_PUSH_INTERVAL_SECS)?,
        })
    }

    /// Device label for every configured slot
    pub fn labels(&self) -> BTreeMap<Slot, String> {
        self.devices
            .iter()
            .map(|device| (device.slot, device.label.clone()))
            .collect()
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            channel: self.characteristic_uuid,
            reconnect_delay: self.reconnect_delay,
            liveness_interval: self.liveness_interval,
            push_interval: self.push_interval,
        }
    }

    pub fn log_summary(&self) {
        info!("Total devices configured: {}", self.devices.len());
        for device in &self.devices {
            info!(
                "Slot {}: {} <- name contains '{}'{}",
                device.slot,
                device.label,
                device.pattern,
                if device.role == DeviceRole::Companion {
                    " (companion)"
                } else {
                    ""
                }
            );
        }
        info!(
            "Service {} / characteristic {}",
            self.service_uuid, self.characteristic_uuid
        );
    }
}

fn next_slot(devices: &[DeviceSpec]) -> Result<Slot, Box<dyn std::error::Error>> {
    Slot::try_from(devices.len() + 1).map_err(|_| "Too many devices configured".into())
}
