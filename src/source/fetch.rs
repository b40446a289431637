//! Content retrieval with export renditions and content hashing.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ContentKind, RemoteEntry, SourceClient};
use crate::errors::{BackupError, Result};
use crate::utils::retry::{RetryPolicy, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportTarget {
    pub mime_type: &'static str,
    pub suffix: &'static str,
}

const PDF: ExportTarget = ExportTarget {
    mime_type: "application/pdf",
    suffix: ".pdf",
};

/// Export rendition for native document kinds; `None` means unsupported.
pub fn export_target(mime_type: &str) -> Option<ExportTarget> {
    match mime_type {
        "application/vnd.google-apps.document" => Some(PDF),
        "application/vnd.google-apps.spreadsheet" => Some(ExportTarget {
            mime_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            suffix: ".xlsx",
        }),
        "application/vnd.google-apps.presentation" => Some(ExportTarget {
            mime_type: "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            suffix: ".pptx",
        }),
        "application/vnd.google-apps.drawing" => Some(PDF),
        _ => None,
    }
}

/// Name the entry is stored under, known before any content is fetched.
pub fn effective_name(entry: &RemoteEntry) -> String {
    match (entry.content_kind, export_target(&entry.mime_type)) {
        (ContentKind::Virtual, Some(target)) => format!("{}{}", entry.name, target.suffix),
        _ => entry.name.clone(),
    }
}

/// Hex SHA-256 over exactly the bytes that get transferred.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedContent {
    pub bytes: Bytes,
    pub effective_name: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(FetchedContent),
    /// No export rendition exists; counted as skipped.
    Unsupported(String),
}

pub struct ContentFetcher {
    source: Arc<dyn SourceClient>,
    retry: RetryPolicy,
}

impl ContentFetcher {
    pub fn new(source: Arc<dyn SourceClient>, retry: RetryPolicy) -> Self {
        ContentFetcher { source, retry }
    }

    pub async fn fetch(&self, entry: &RemoteEntry) -> Result<FetchOutcome> {
        let (bytes, effective_name) = match entry.content_kind {
            ContentKind::Container => return Ok(FetchOutcome::Unsupported(entry.mime_type.clone())),
            ContentKind::Regular => {
                let bytes = with_retry(&self.retry, "download", |_| self.source.download(&entry.entry_id)).await?;
                (bytes, entry.name.clone())
            }
            ContentKind::Virtual => {
                let Some(target) = export_target(&entry.mime_type) else {
                    info!(entry_id = %entry.entry_id, mime_type = %entry.mime_type, "No export rendition, skipping");
                    return Ok(FetchOutcome::Unsupported(entry.mime_type.clone()));
                };
                let exported = with_retry(&self.retry, "export", |_| {
                    self.source.export(&entry.entry_id, target.mime_type)
                })
                .await;
                match exported {
                    Ok(bytes) => (bytes, effective_name(entry)),
                    Err(BackupError::UnsupportedContentKind(reason)) => {
                        info!(entry_id = %entry.entry_id, %reason, "Source refused export, skipping");
                        return Ok(FetchOutcome::Unsupported(entry.mime_type.clone()));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let content_hash = content_hash(&bytes);
        debug!(entry_id = %entry.entry_id, bytes = bytes.len(), %content_hash, "Fetched content");
        Ok(FetchOutcome::Fetched(FetchedContent {
            bytes,
            effective_name,
            content_hash,
        }))
    }
}
