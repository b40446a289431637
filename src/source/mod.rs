//! Remote entries and the interface to the source file store.

pub(crate) mod drive;
pub(crate) mod fetch;
pub(crate) mod path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::config::SharedDrive;
use crate::errors::Result;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const VIRTUAL_MIME_PREFIX: &str = "application/vnd.google-apps.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Plain bytes, downloaded as-is.
    Regular,
    /// Native document that only exists as an export rendition.
    Virtual,
    Container,
}

impl ContentKind {
    pub fn from_mime_type(mime_type: &str) -> Self {
        if mime_type == FOLDER_MIME_TYPE {
            ContentKind::Container
        } else if mime_type.starts_with(VIRTUAL_MIME_PREFIX) {
            ContentKind::Virtual
        } else {
            ContentKind::Regular
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub entry_id: String,
    pub name: String,
    pub mime_type: String,
    pub content_kind: ContentKind,
    pub size: Option<u64>,
    pub modified_time: Option<DateTime<Utc>>,
    pub owner_identity: String,
    pub parent_id: Option<String>,
    pub remote_checksum: Option<String>,
}

/// What one listing pass enumerates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Everything visible to the account outside shared drives.
    UserFiles,
    SharedDrive(SharedDrive),
}

impl Scope {
    pub fn shared_collection(&self) -> Option<&str> {
        match self {
            Scope::UserFiles => None,
            Scope::SharedDrive(drive) => Some(&drive.name),
        }
    }
}

/// Name and parent link of a node, used for path reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub parent_id: Option<String>,
}

impl From<&RemoteEntry> for NodeInfo {
    fn from(entry: &RemoteEntry) -> Self {
        NodeInfo {
            name: entry.name.clone(),
            parent_id: entry.parent_id.clone(),
        }
    }
}

pub type EntryStream<'a> = BoxStream<'a, Result<RemoteEntry>>;

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Lazily enumerates every entry of `scope`, restartable only from the start.
    fn list(&self, scope: Scope) -> EntryStream<'_>;

    async fn node_info(&self, entry_id: &str) -> Result<NodeInfo>;

    async fn download(&self, entry_id: &str) -> Result<Bytes>;

    async fn export(&self, entry_id: &str, export_mime_type: &str) -> Result<Bytes>;
}
