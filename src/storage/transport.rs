//! Single-write or multipart transfer of object content.

use bytes::Bytes;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{ObjectAttributes, ObjectStore, PartAck};
use crate::errors::Result;
use crate::utils::retry::{RetryPolicy, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Single,
    Multipart { parts: usize },
}

pub struct ChunkedTransporter {
    store: Arc<dyn ObjectStore>,
    large_object_threshold: u64,
    part_size: u64,
    retry: RetryPolicy,
}

/// 1-based part numbers with the byte range each part covers.
fn part_ranges(len: usize, part_size: usize) -> Vec<(i32, Range<usize>)> {
    (0..len.div_ceil(part_size))
        .map(|i| {
            let start = i * part_size;
            (i as i32 + 1, start..(start + part_size).min(len))
        })
        .collect()
}

impl ChunkedTransporter {
    pub fn new(store: Arc<dyn ObjectStore>, large_object_threshold: u64, part_size: u64, retry: RetryPolicy) -> Self {
        ChunkedTransporter {
            store,
            large_object_threshold,
            part_size,
            retry,
        }
    }

    pub async fn transport(&self, body: Bytes, key: &str, attributes: &ObjectAttributes) -> Result<TransportMode> {
        if body.len() as u64 > self.large_object_threshold {
            return self.transport_multipart(body, key, attributes).await;
        }

        with_retry(&self.retry, "put_object", |_| {
            self.store.put_object(key, body.clone(), attributes)
        })
        .await?;
        Ok(TransportMode::Single)
    }

    async fn transport_multipart(&self, body: Bytes, key: &str, attributes: &ObjectAttributes) -> Result<TransportMode> {
        let upload_id = with_retry(&self.retry, "create_multipart_upload", |_| {
            self.store.create_multipart_upload(key, attributes)
        })
        .await?;

        let ranges = part_ranges(body.len(), self.part_size as usize);
        info!(key, size = body.len(), parts = ranges.len(), "Starting multipart upload");

        let mut acks: Vec<PartAck> = Vec::with_capacity(ranges.len());
        for (part_number, range) in ranges {
            // Zero-copy view; only the current part is in flight.
            let part = body.slice(range);
            let uploaded = with_retry(&self.retry, "upload_part", |_| {
                self.store.upload_part(key, &upload_id, part_number, part.clone())
            })
            .await;

            match uploaded {
                Ok(ack) => {
                    debug!(key, part_number, "Part uploaded");
                    acks.push(ack);
                }
                Err(e) => {
                    error!(key, part_number, error = %e, "Part upload failed, aborting multipart upload");
                    if let Err(abort_err) = self.store.abort_multipart_upload(key, &upload_id).await {
                        warn!(key, %upload_id, error = %abort_err, "Abort failed; upload left for lifecycle cleanup");
                    }
                    return Err(e);
                }
            }
        }

        acks.sort_by_key(|ack| ack.part_number);
        let parts = acks.len();
        // A failed completion is left in place; the bucket lifecycle policy reaps it.
        with_retry(&self.retry, "complete_multipart_upload", |_| {
            self.store.complete_multipart_upload(key, &upload_id, &acks)
        })
        .await?;

        Ok(TransportMode::Multipart { parts })
    }
}
