//! Watermark persistence and report export sinks for cisync.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod exporter;
pub mod last_run;
pub mod store;

pub use exporter::{CompositeExporter, ExportError, ExportFormat, Exporter, LocalExporter};
pub use last_run::LastRunStore;
pub use store::{
    merge_records, LastRunMap, LocalStore, NullStore, WatermarkMeta, WatermarkRecord,
    WatermarkStore,
};

pub const CRATE_NAME: &str = "cisync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("watermark file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("watermark file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Writes `bytes` to `path` through a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);

    let result = match written {
        Ok(()) => fs::rename(&temp_path, path).await,
        Err(err) => Err(err),
    };
    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}
