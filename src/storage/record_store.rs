/// Per-device telemetry logs, the latest-value snapshot and the annotation log
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{AnnotationError, StorageError};
use crate::models::{ActivityAnnotation, SensorRecord, Slot, Snapshot};
use crate::storage::log_file::{file_name_for, LogFile};
use crate::utils::{csv_field, csv_line, format_date, format_time, format_value};

/// Header of every per-device log
pub const SENSOR_LOG_HEADER: &str = "mpu1_ax,mpu1_ay,mpu1_az,mpu1_gx,mpu1_gy,mpu1_gz,\
mpu2_ax,mpu2_ay,mpu2_az,mpu2_gx,mpu2_gy,mpu2_gz,\
HMC_x,HMC_y,HMC_z,Heading_degrees,Date,Time";

pub const ANNOTATION_LOG_FILE: &str = "activity_labels.csv";

/// Owner of all shared mutable ingestion state
///
/// Sessions and the HTTP handlers only go through these methods. Writes to a
/// log file are serialized by that file's lock, shared by every slot whose
/// label maps to it; the snapshot table has its own
/// lock which is never held across file I/O, so readers are not delayed by a
/// slow disk.
pub struct RecordStore {
    data_dir: PathBuf,
    labels: BTreeMap<Slot, String>,
    snapshot: RwLock<Snapshot>,
    logs: Mutex<BTreeMap<PathBuf, Arc<AsyncMutex<LogFile>>>>,
    annotations: AsyncMutex<LogFile>,
}

impl RecordStore {
    /// Create the data directory if needed and prepare one log per labelled slot
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        labels: BTreeMap<Slot, String>,
    ) -> std::io::Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let annotation_header = ActivityAnnotation::FIELDS.join(",");
        let annotations = LogFile::new(data_dir.join(ANNOTATION_LOG_FILE), annotation_header);

        let store = RecordStore {
            data_dir,
            labels,
            snapshot: RwLock::new(Snapshot::new()),
            logs: Mutex::new(BTreeMap::new()),
            annotations: AsyncMutex::new(annotations),
        };
        for slot in store.labels.keys() {
            store.slot_log(*slot);
        }
        Ok(store)
    }

    pub fn labels(&self) -> &BTreeMap<Slot, String> {
        &self.labels
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the log that records for `slot` are appended to
    pub fn log_path(&self, slot: Slot) -> PathBuf {
        self.data_dir.join(file_name_for(&self.slot_label(slot)))
    }

    pub fn annotation_log_path(&self) -> PathBuf {
        self.data_dir.join(ANNOTATION_LOG_FILE)
    }

    /// Log `record` for `slot` and make it the slot's snapshot entry
    ///
    /// The snapshot is replaced even when the log write fails, so live
    /// readers keep seeing fresh data through a storage hiccup. The write
    /// error is still returned; the next record retries the file.
    pub async fn append(&self, slot: Slot, record: SensorRecord) -> Result<(), StorageError> {
        let log = self.slot_log(slot);
        let log = log.lock().await;

        let written = log.append_line(&record_line(&record)).await;

        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot, record);

        written
    }

    /// Copy of the latest record for every populated slot
    pub fn read_snapshot(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate an annotation body and append it to the annotation log
    pub async fn append_annotation(
        &self,
        body: &Value,
    ) -> Result<ActivityAnnotation, AnnotationError> {
        let annotation = ActivityAnnotation::from_json(body)?;

        let line = csv_line(annotation.columns().into_iter().map(csv_field));
        self.annotations.lock().await.append_line(&line).await?;

        debug!("Recorded activity '{}'", annotation.activity_label);
        Ok(annotation)
    }

    fn slot_label(&self, slot: Slot) -> String {
        self.labels
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| format!("slot-{}", slot))
    }

    fn slot_log(&self, slot: Slot) -> Arc<AsyncMutex<LogFile>> {
        let path = self.log_path(slot);
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.entry(path)
            .or_insert_with_key(|path| {
                Arc::new(AsyncMutex::new(LogFile::new(path.clone(), SENSOR_LOG_HEADER)))
            })
            .clone()
    }
}

/// Render a record as one log line in header column order
fn record_line(record: &SensorRecord) -> String {
    let values = record.values().into_iter().map(format_value);
    let date = format_date(record.captured_at.date());
    let time = format_time(record.captured_at.time());
    csv_line(values.chain([date.into(), time.into()]))
}
