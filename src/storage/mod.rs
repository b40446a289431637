//! Destination object store interface.

pub(crate) mod s3_upload;
pub(crate) mod transport;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

use crate::errors::Result;

/// User metadata written alongside an object.
pub type ObjectAttributes = BTreeMap<String, String>;

/// Acknowledgement of one uploaded part, needed to finalize the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAck {
    pub part_number: i32,
    pub e_tag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, attributes: &ObjectAttributes) -> Result<()>;

    /// Returns the upload id of a new multipart upload.
    async fn create_multipart_upload(&self, key: &str, attributes: &ObjectAttributes) -> Result<String>;

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> Result<PartAck>;

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: &[PartAck]) -> Result<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}
