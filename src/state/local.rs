//! JSON-lines state store for deployments without a state table.
//!
//! Each `put` appends one record line; later lines win. The log is compacted
//! (one line per live record) every time the store is opened.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{BackupRecord, StateStore};
use crate::errors::{BackupError, Result};

struct Inner {
    records: HashMap<String, BackupRecord>,
    log: File,
}

pub struct LocalStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

fn io_error(path: &Path, e: std::io::Error) -> BackupError {
    BackupError::StateStore(format!("{}: {}", path.display(), e))
}

/// Replays the log. A line that does not parse is an error unless it is the
/// unterminated tail left by an interrupted append, which is dropped.
fn replay(path: &Path, raw: &str) -> Result<HashMap<String, BackupRecord>> {
    let mut records = HashMap::new();
    let (complete, tail) = match raw.rfind('\n') {
        Some(end) => raw.split_at(end + 1),
        None => ("", raw),
    };

    for (index, line) in complete.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: BackupRecord = serde_json::from_str(line).map_err(|e| {
            BackupError::StateStore(format!("Corrupt state file {} at line {}: {}", path.display(), index + 1, e))
        })?;
        records.insert(record.entry_id.clone(), record);
    }

    if !tail.trim().is_empty() {
        match serde_json::from_str::<BackupRecord>(tail) {
            Ok(record) => {
                records.insert(record.entry_id.clone(), record);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Dropping truncated last line of state file"),
        }
    }
    Ok(records)
}

fn encode(record: &BackupRecord) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(record).map_err(|e| BackupError::StateStore(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

impl LocalStateStore {
    /// Loads `path` if it exists, drops expired records and rewrites the log
    /// with one line per remaining record.
    pub async fn open(path: &Path) -> Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(BackupError::StateStore(format!(
                    "Failed to read state file {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let records = replay(path, &raw)?;

        let now = Utc::now();
        let total = records.len();
        let records: HashMap<String, BackupRecord> =
            records.into_iter().filter(|(_, r)| !r.is_expired(now)).collect();
        info!(path = %path.display(), records = records.len(), expired = total - records.len(), "Loaded state file");

        compact(path, &records).await?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| io_error(path, e))?;

        Ok(LocalStateStore {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { records, log }),
        })
    }
}

async fn compact(path: &Path, records: &HashMap<String, BackupRecord>) -> Result<()> {
    let mut body = Vec::new();
    for record in records.values() {
        body.extend(encode(record)?);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(path, e))?;
    }
    // Write-then-rename keeps the previous log intact if we die mid-write.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await.map_err(|e| io_error(path, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))?;
    Ok(())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, entry_id: &str) -> Result<Option<BackupRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(entry_id)
            .filter(|r| !r.is_expired(Utc::now()))
            .cloned())
    }

    async fn put(&self, record: &BackupRecord) -> Result<()> {
        let line = encode(record)?;
        let mut inner = self.inner.lock().await;
        inner.log.write_all(&line).await.map_err(|e| io_error(&self.path, e))?;
        inner.log.flush().await.map_err(|e| io_error(&self.path, e))?;
        // Only visible once it is on disk.
        inner.records.insert(record.entry_id.clone(), record.clone());
        Ok(())
    }
}
