// drivemirror/src/storage/s3_upload.rs
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{ObjectAttributes, ObjectStore, PartAck};
use crate::config::SpacesConfig;
use crate::errors::{BackupError, Result};

/// S3-compatible destination (AWS S3, DigitalOcean Spaces, MinIO).
pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
    server_side_encryption: Option<ServerSideEncryption>,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &aws_config::SdkConfig, spaces_config: &SpacesConfig) -> Self {
        let mut builder = s3::config::Builder::from(sdk_config);
        // Custom endpoints only apply to the object store, not to the state table.
        if let Some(endpoint) = &spaces_config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        S3ObjectStore {
            client: s3::Client::from_conf(builder.build()),
            bucket: spaces_config.bucket_name.clone(),
            server_side_encryption: spaces_config
                .server_side_encryption
                .as_deref()
                .map(ServerSideEncryption::from),
        }
    }

    /// Verifies the target bucket is reachable before any work is dispatched.
    pub async fn check_bucket_access(&self) -> AnyResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Target bucket is accessible");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Could not access target bucket '{}' with HEAD request: {}",
                self.bucket,
                DisplayErrorContext(&e)
            )),
        }
    }
}

fn write_error<E>(operation: &str, key: &str, err: E) -> BackupError
where
    E: std::error::Error,
{
    BackupError::DestinationWrite(format!(
        "{} failed for key {}: {}",
        operation,
        key,
        DisplayErrorContext(&err)
    ))
}

fn metadata(attributes: &ObjectAttributes) -> HashMap<String, String> {
    attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Bytes, attributes: &ObjectAttributes) -> Result<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_metadata(Some(metadata(attributes)))
            .set_server_side_encryption(self.server_side_encryption.clone())
            .send()
            .await
            .map_err(|e| write_error("PutObject", key, e))?;

        debug!(bucket = %self.bucket, key, size, "PutObject completed");
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str, attributes: &ObjectAttributes) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata(attributes)))
            .set_server_side_encryption(self.server_side_encryption.clone())
            .send()
            .await
            .map_err(|e| write_error("CreateMultipartUpload", key, e))?;

        output.upload_id().map(str::to_string).ok_or_else(|| {
            BackupError::DestinationWrite(format!("CreateMultipartUpload returned no upload id for {}", key))
        })
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> Result<PartAck> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| write_error("UploadPart", key, e))?;

        let e_tag = output.e_tag().ok_or_else(|| {
            BackupError::DestinationWrite(format!("UploadPart {} for {} returned no ETag", part_number, key))
        })?;
        Ok(PartAck {
            part_number,
            e_tag: e_tag.to_string(),
        })
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: &[PartAck]) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(&p.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| write_error("CompleteMultipartUpload", key, e))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| {
                warn!(key, upload_id, "AbortMultipartUpload failed");
                write_error("AbortMultipartUpload", key, e)
            })?;
        Ok(())
    }
}
