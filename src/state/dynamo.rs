//! DynamoDB-backed state table.
//!
//! Item layout: `fileId` (partition key), `contentHash`, `modifiedTime`,
//! `s3Key`, `size`, `remoteChecksum`, `lastBackupTime`, `ttl` (epoch seconds,
//! also usable as the table's TTL attribute).

use async_trait::async_trait;
use aws_sdk_dynamodb as dynamodb;
use chrono::{DateTime, TimeZone, Utc};
use dynamodb::error::DisplayErrorContext;
use dynamodb::types::AttributeValue;
use std::collections::HashMap;
use tracing::debug;

use super::{BackupRecord, StateStore};
use crate::errors::{BackupError, Result};

type Item = HashMap<String, AttributeValue>;

pub struct DynamoStateStore {
    client: dynamodb::Client,
    table: String,
}

impl DynamoStateStore {
    pub fn new(sdk_config: &aws_config::SdkConfig, table: &str) -> Self {
        DynamoStateStore {
            client: dynamodb::Client::new(sdk_config),
            table: table.to_string(),
        }
    }
}

fn string_attr(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn number_attr(item: &Item, name: &str) -> Option<i64> {
    item.get(name).and_then(|v| v.as_n().ok()).and_then(|n| n.parse().ok())
}

fn time_attr(item: &Item, name: &str) -> Option<DateTime<Utc>> {
    string_attr(item, name).and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc)))
}

pub(crate) fn record_to_item(record: &BackupRecord) -> Item {
    let mut item = Item::new();
    item.insert("fileId".into(), AttributeValue::S(record.entry_id.clone()));
    item.insert("s3Key".into(), AttributeValue::S(record.destination_key.clone()));
    item.insert("size".into(), AttributeValue::N(record.size.to_string()));
    item.insert("lastBackupTime".into(), AttributeValue::S(record.last_backup_time.to_rfc3339()));
    item.insert("ttl".into(), AttributeValue::N(record.expiry.timestamp().to_string()));
    if let Some(hash) = &record.content_hash {
        item.insert("contentHash".into(), AttributeValue::S(hash.clone()));
    }
    if let Some(modified) = &record.modified_time {
        item.insert("modifiedTime".into(), AttributeValue::S(modified.to_rfc3339()));
    }
    if let Some(checksum) = &record.remote_checksum {
        item.insert("remoteChecksum".into(), AttributeValue::S(checksum.clone()));
    }
    item
}

/// Returns `None` for items missing required attributes or already past `ttl`.
pub(crate) fn item_to_record(item: &Item, now: DateTime<Utc>) -> Option<BackupRecord> {
    let expiry = number_attr(item, "ttl").and_then(|ttl| Utc.timestamp_opt(ttl, 0).single())?;
    let record = BackupRecord {
        entry_id: string_attr(item, "fileId")?,
        content_hash: string_attr(item, "contentHash"),
        modified_time: time_attr(item, "modifiedTime"),
        destination_key: string_attr(item, "s3Key").unwrap_or_default(),
        size: number_attr(item, "size").unwrap_or(0).max(0) as u64,
        remote_checksum: string_attr(item, "remoteChecksum"),
        last_backup_time: time_attr(item, "lastBackupTime").unwrap_or(expiry),
        expiry,
    };
    (!record.is_expired(now)).then_some(record)
}

#[async_trait]
impl StateStore for DynamoStateStore {
    async fn get(&self, entry_id: &str) -> Result<Option<BackupRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("fileId", AttributeValue::S(entry_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| BackupError::StateStore(format!("GetItem {}: {}", entry_id, DisplayErrorContext(&e))))?;

        let record = output.item().and_then(|item| item_to_record(item, Utc::now()));
        debug!(entry_id, found = record.is_some(), "State lookup");
        Ok(record)
    }

    async fn put(&self, record: &BackupRecord) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(record_to_item(record)))
            .send()
            .await
            .map_err(|e| {
                BackupError::StateStore(format!("PutItem {}: {}", record.entry_id, DisplayErrorContext(&e)))
            })?;
        Ok(())
    }
}
