use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::asset::{InputAsset, OutputAsset};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub media_type: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub converted: bool,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

impl FileRecord {
    /// Record of a freshly received, not yet converted file.
    pub fn uploaded(input: &InputAsset) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.file_name().unwrap_or("input").to_string(),
            size: input.data().len() as u64,
            media_type: input.media_type().to_string(),
            last_modified: chrono::Utc::now().timestamp_millis(),
            converted: false,
            payload: input.data().to_vec(),
        }
    }

    /// The same record after a successful conversion.
    pub fn converted_to(&self, output: &OutputAsset) -> Self {
        Self {
            id: self.id.clone(),
            name: output.file_name_for(Some(&self.name)),
            size: output.data().len() as u64,
            media_type: output.media_type(),
            last_modified: chrono::Utc::now().timestamp_millis(),
            converted: true,
            payload: output.data().to_vec(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Duplicate(String),
    #[error("store file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("can't encode records: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Keyed file records, kept in memory and mirrored to a JSON file.
pub struct FileStore {
    path: Option<PathBuf>,
    records: Mutex<Vec<FileRecord>>,
}

impl FileStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Opens the store at `path`. A missing file is an empty store.
    #[tracing::instrument]
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let records: Vec<FileRecord> = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        tracing::info!(records = records.len(), "store opened");
        Ok(Self {
            path: Some(path.to_path_buf()),
            records: Mutex::new(records),
        })
    }

    /// Adds a new record; the id must not exist yet.
    pub async fn add(&self, record: FileRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        tracing::debug!(id = record.id, name = record.name, "add record");
        let mut next = records.clone();
        next.push(record);
        self.persist(&next).await?;
        *records = next;
        Ok(())
    }

    /// Replaces the record with the same id, or adds it.
    pub async fn update(&self, record: FileRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        tracing::debug!(id = record.id, converted = record.converted, "update record");
        let mut next = records.clone();
        match next.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => next.push(record),
        }
        self.persist(&next).await?;
        *records = next;
        Ok(())
    }

    pub async fn list(&self) -> Vec<FileRecord> {
        self.records.lock().await.clone()
    }

    /// Removes all records and returns how many there were.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        self.persist(&[]).await?;
        let removed = records.len();
        records.clear();
        tracing::info!(removed, "store cleared");
        Ok(removed)
    }

    /// Writes `records` to disk. Memory is only changed after this succeeds.
    async fn persist(&self, records: &[FileRecord]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        let data = serde_json::to_vec(records)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)
    }
}
