//! S3 client wrapper
//!
//! Streaming multipart uploads with a bounded in-flight window, ranged
//! reads, and head-object. Any failure after parts have been committed
//! aborts the whole multipart upload so no orphaned parts are left
//! accruing storage.

use crate::key::{part_size_for, tagging_header};
use crate::{Result, StoreError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart, ServerSideEncryption,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

/// Ranged GET chunk size (8 MiB)
const RANGE_CHUNK: u64 = 8 * 1024 * 1024;

/// Server-side encryption request
#[derive(Debug, Clone)]
pub struct SseParams {
    /// Algorithm (`AES256` or `aws:kms`)
    pub algorithm: String,
    /// KMS key id, only meaningful with `aws:kms`
    pub kms_key_id: Option<String>,
}

/// Everything one multipart upload needs besides the bytes
#[derive(Debug, Clone)]
pub struct PutParams {
    /// Object key
    pub key: String,
    /// Object metadata (snapshot provenance, uncompressed size)
    pub metadata: HashMap<String, String>,
    /// Sanitized object tags
    pub tags: Vec<(String, String)>,
    /// Optional server-side encryption
    pub sse: Option<SseParams>,
    /// Pre-compression size estimate (lower bound), drives part sizing
    pub estimate: u64,
    /// Maximum part uploads in flight
    pub streams: usize,
}

/// Result of a head-object call
#[derive(Debug, Clone)]
pub struct HeadInfo {
    /// Object size in bytes
    pub content_length: u64,
    /// User metadata
    pub metadata: HashMap<String, String>,
}

/// Object store handle bound to one bucket
#[derive(Debug, Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
}

impl ObjectStore {
    /// Wrap an S3 client for one destination bucket
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Destination bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Head an object; `None` when it does not exist
    pub async fn head(&self, key: &str) -> Result<Option<HeadInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(Some(HeadInfo {
                content_length: resp.content_length().unwrap_or(0).max(0) as u64,
                metadata: resp.metadata().cloned().unwrap_or_default(),
            })),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(None)
                } else {
                    Err(StoreError::Api {
                        op: "head",
                        key: key.to_string(),
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    /// Stream an object into `writer` with sequential ranged GETs.
    ///
    /// Reports each chunk to `on_bytes` and returns the object size.
    pub async fn read_to<W, F>(&self, key: &str, writer: &mut W, mut on_bytes: F) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(u64),
    {
        let info = self.head(key).await?.ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        let total = info.content_length;
        let mut offset = 0u64;
        while offset < total {
            let (start, end) = range_bounds(offset, total, RANGE_CHUNK);
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(format!("bytes={start}-{end}"))
                .send()
                .await
                .map_err(|e| StoreError::Api {
                    op: "get",
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
            let mut body = resp.body;
            while let Some(chunk) = body.try_next().await.map_err(|e| StoreError::Api {
                op: "get",
                key: key.to_string(),
                message: e.to_string(),
            })? {
                writer.write_all(&chunk).await?;
                on_bytes(chunk.len() as u64);
                offset += chunk.len() as u64;
            }
        }
        writer.shutdown().await?;
        Ok(total)
    }

    /// Begin a multipart upload
    pub async fn start_upload(&self, params: PutParams) -> Result<MultipartUpload> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&params.key)
            .checksum_algorithm(ChecksumAlgorithm::Crc32)
            .set_metadata(Some(params.metadata.clone()));
        if !params.tags.is_empty() {
            req = req.tagging(tagging_header(&params.tags));
        }
        if let Some(sse) = &params.sse {
            req = req.server_side_encryption(ServerSideEncryption::from(sse.algorithm.as_str()));
            if let Some(kms_key) = &sse.kms_key_id {
                req = req.ssekms_key_id(kms_key);
            }
        }
        let resp = req.send().await.map_err(|e| StoreError::Api {
            op: "create_multipart",
            key: params.key.clone(),
            message: e.to_string(),
        })?;
        let upload_id = resp
            .upload_id()
            .ok_or_else(|| StoreError::Api {
                op: "create_multipart",
                key: params.key.clone(),
                message: "response carried no upload id".to_string(),
            })?
            .to_string();
        tracing::debug!(
            key = %params.key,
            upload_id = %upload_id,
            part_size = part_size_for(params.estimate),
            "multipart upload started"
        );
        Ok(MultipartUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: params.key,
            upload_id,
            part_size: part_size_for(params.estimate),
            next_part: 1,
            max_in_flight: params.streams.max(1),
            in_flight: JoinSet::new(),
            parts: Vec::new(),
        })
    }
}

/// Inclusive byte range for the next GET
fn range_bounds(offset: u64, total: u64, chunk: u64) -> (u64, u64) {
    (offset, (offset + chunk).min(total) - 1)
}

/// One in-progress multipart upload.
///
/// Feed it part-sized chunks with [`put_part`](Self::put_part), then
/// either [`finish`](Self::finish) or [`abort`](Self::abort). Dropping
/// without finishing leaves the multipart upload open on the server, so
/// callers must settle one way or the other.
#[derive(Debug)]
pub struct MultipartUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_size: u64,
    next_part: i32,
    max_in_flight: usize,
    in_flight: JoinSet<Result<CompletedPart>>,
    parts: Vec<CompletedPart>,
}

impl MultipartUpload {
    /// Part size chosen for this upload
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Object key being written
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Upload one part. Blocks when the in-flight window is full.
    ///
    /// On error the caller must [`abort`](Self::abort).
    pub async fn put_part(&mut self, data: Bytes) -> Result<()> {
        while self.in_flight.len() >= self.max_in_flight {
            self.join_one().await?;
        }
        let part_number = self.next_part;
        self.next_part += 1;
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let upload_id = self.upload_id.clone();
        self.in_flight.spawn(async move {
            let resp = client
                .upload_part()
                .bucket(bucket)
                .key(&key)
                .upload_id(upload_id)
                .part_number(part_number)
                .checksum_algorithm(ChecksumAlgorithm::Crc32)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| StoreError::Api {
                    op: "upload_part",
                    key,
                    message: e.to_string(),
                })?;
            let mut part = CompletedPart::builder().part_number(part_number);
            if let Some(etag) = resp.e_tag() {
                part = part.e_tag(etag);
            }
            if let Some(crc) = resp.checksum_crc32() {
                part = part.checksum_crc32(crc);
            }
            Ok(part.build())
        });
        Ok(())
    }

    async fn join_one(&mut self) -> Result<()> {
        if let Some(joined) = self.in_flight.join_next().await {
            let part = joined.map_err(|e| StoreError::Task(e.to_string()))??;
            self.parts.push(part);
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        while !self.in_flight.is_empty() {
            self.join_one().await?;
        }
        Ok(())
    }

    async fn complete_inner(&mut self) -> Result<()> {
        self.parts
            .sort_by_key(|part| part.part_number().unwrap_or(0));
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| StoreError::Api {
                op: "complete_multipart",
                key: self.key.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn abort_inner(&mut self) -> Result<()> {
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| StoreError::Api {
                op: "abort_multipart",
                key: self.key.clone(),
                message: e.to_string(),
            })?;
        tracing::info!(key = %self.key, "multipart upload aborted");
        Ok(())
    }

    /// Wait for all parts and complete the object.
    ///
    /// A zero-byte stream still completes (S3 requires at least one
    /// part, so an empty one is sent). Any failure aborts the multipart
    /// upload before the error is returned.
    pub async fn finish(mut self) -> Result<()> {
        let result = self.finish_inner().await;
        if let Err(err) = result {
            if let Err(abort_err) = self.abort_inner().await {
                tracing::warn!(key = %self.key, "abort after failed upload also failed: {abort_err}");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn finish_inner(&mut self) -> Result<()> {
        if self.next_part == 1 {
            self.put_part(Bytes::new()).await?;
        }
        self.drain().await?;
        self.complete_inner().await
    }

    /// Abort the upload, discarding every committed part
    pub async fn abort(mut self) -> Result<()> {
        self.abort_inner().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        assert_eq!(range_bounds(0, 10, 4), (0, 3));
        assert_eq!(range_bounds(4, 10, 4), (4, 7));
        assert_eq!(range_bounds(8, 10, 4), (8, 9));
        // Final short range ends exactly at the last byte
        assert_eq!(range_bounds(0, 3, 1024), (0, 2));
    }
}
