//! Durable "last successfully backed up" records, one per entry.

pub(crate) mod dynamo;
pub(crate) mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub entry_id: String,
    /// Absent on records written before local hashing existed.
    pub content_hash: Option<String>,
    pub modified_time: Option<DateTime<Utc>>,
    pub destination_key: String,
    pub size: u64,
    pub remote_checksum: Option<String>,
    pub last_backup_time: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl BackupRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// Stores enforce expiry themselves: an expired record is returned as `None`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, entry_id: &str) -> Result<Option<BackupRecord>>;

    /// Upserts the record for `record.entry_id` atomically.
    async fn put(&self, record: &BackupRecord) -> Result<()>;
}
