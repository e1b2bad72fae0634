use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{write_atomic, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkMeta {
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkRecord {
    pub last_run: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<WatermarkMeta>,
}

/// Watermark records keyed by entity full name.
pub type LastRunMap = BTreeMap<String, WatermarkRecord>;

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Human readable location, used in logs.
    fn describe(&self) -> String;

    async fn read(&self) -> Result<LastRunMap, StoreError>;

    /// Merges `records` into the persisted state and returns what was persisted.
    async fn write(&self, records: &LastRunMap) -> Result<LastRunMap, StoreError>;
}

/// Per entity the newer `updated_at` wins; ties go to `ours`.
pub fn merge_records(stored: LastRunMap, ours: &LastRunMap) -> LastRunMap {
    let mut merged = stored;
    for (entity, record) in ours {
        match merged.get(entity) {
            Some(existing) if existing.updated_at > record.updated_at => {}
            _ => {
                merged.insert(entity.clone(), record.clone());
            }
        }
    }
    merged
}

/// JSON file on the local filesystem.
#[derive(Debug)]
pub struct LocalStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WatermarkStore for LocalStore {
    fn describe(&self) -> String {
        format!("local:{}", self.path.display())
    }

    async fn read(&self) -> Result<LastRunMap, StoreError> {
        read_map(&self.path).await
    }

    async fn write(&self, records: &LastRunMap) -> Result<LastRunMap, StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = read_map(&self.path).await?;
        let merged = merge_records(stored, records);
        let bytes = serde_json::to_vec_pretty(&merged).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), entities = merged.len(), "watermarks written");
        Ok(merged)
    }
}

async fn read_map(path: &Path) -> Result<LastRunMap, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LastRunMap::new()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Dry-run store: reads nothing and never persists.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl WatermarkStore for NullStore {
    fn describe(&self) -> String {
        "null".to_string()
    }

    async fn read(&self) -> Result<LastRunMap, StoreError> {
        Ok(LastRunMap::new())
    }

    async fn write(&self, _records: &LastRunMap) -> Result<LastRunMap, StoreError> {
        Ok(LastRunMap::new())
    }
}
