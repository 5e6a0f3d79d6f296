//! Per-download status records, written by the executor and polled by the
//! HTTP layer.

use std::{collections::HashMap, fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(Uuid);

impl DownloadId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Starting,
    Downloading,
    Finished,
    Error,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRecord {
    pub status: DownloadStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip)]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn starting() -> Self {
        Self {
            status: DownloadStatus::Starting,
            progress: 0.0,
            downloaded: None,
            total: None,
            filename: None,
            path: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// `total` must be non-zero; callers skip samples without a known size.
    pub fn downloading(&self, downloaded: u64, total: u64) -> Self {
        let percentage = (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
        Self {
            status: DownloadStatus::Downloading,
            progress: percentage,
            downloaded: Some(downloaded),
            total: Some(total),
            filename: None,
            path: None,
            error: None,
            created_at: self.created_at,
        }
    }

    pub fn finished(&self, path: PathBuf) -> Self {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string);
        Self {
            status: DownloadStatus::Finished,
            progress: 100.0,
            downloaded: None,
            total: None,
            filename,
            path: Some(path),
            error: None,
            created_at: self.created_at,
        }
    }

    pub fn failed(&self, message: impl Into<String>) -> Self {
        Self {
            status: DownloadStatus::Error,
            progress: self.progress,
            downloaded: None,
            total: None,
            filename: None,
            path: None,
            error: Some(message.into()),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("download {0} is not tracked")]
    UnknownDownload(DownloadId),
    #[error("download {0} already finished or failed")]
    AlreadySettled(DownloadId),
}

pub trait ProgressStore: Send + Sync {
    fn create(&self, id: DownloadId) -> DownloadRecord;
    fn update(&self, id: DownloadId, record: DownloadRecord) -> Result<(), TrackerError>;
    fn get(&self, id: DownloadId) -> Option<DownloadRecord>;
    fn delete(&self, id: DownloadId) -> Option<DownloadRecord>;
}

#[derive(Default)]
pub struct MemoryProgressStore {
    records: RwLock<HashMap<DownloadId, DownloadRecord>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn create(&self, id: DownloadId) -> DownloadRecord {
        let record = DownloadRecord::starting();
        self.records.write().insert(id, record.clone());
        record
    }

    fn update(&self, id: DownloadId, mut record: DownloadRecord) -> Result<(), TrackerError> {
        let mut records = self.records.write();
        let current = records
            .get_mut(&id)
            .ok_or(TrackerError::UnknownDownload(id))?;

        if current.status.is_terminal() {
            return Err(TrackerError::AlreadySettled(id));
        }

        // Separate video and audio streams restart the byte counter.
        if record.status == DownloadStatus::Downloading
            && current.status == DownloadStatus::Downloading
        {
            record.progress = record.progress.max(current.progress);
        }

        *current = record;
        Ok(())
    }

    fn get(&self, id: DownloadId) -> Option<DownloadRecord> {
        self.records.read().get(&id).cloned()
    }

    fn delete(&self, id: DownloadId) -> Option<DownloadRecord> {
        self.records.write().remove(&id)
    }
}
