//! Object store client for snapferry
//!
//! Multipart uploads with server-side encryption and tagging, ranged
//! reads, head-object, and the deterministic object key shapes derived
//! from a snapshot.

pub mod client;
pub mod key;

pub use client::{HeadInfo, MultipartUpload, ObjectStore, PutParams, SseParams};
pub use key::{
    object_tags, partition_tar_key, raw_image_key, sanitize_tag, tagging_header, part_size_for,
    MAX_PARTS, MIN_PART_SIZE, SIZE_SLACK,
};

use thiserror::Error;

/// Result type for object store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the object store
#[derive(Debug, Error)]
pub enum StoreError {
    /// An S3 API call failed
    #[error("S3 {op} failed for {key}: {message}")]
    Api {
        op: &'static str,
        key: String,
        message: String,
    },

    /// Object does not exist
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// I/O error while streaming
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A part upload task died
    #[error("upload task failed: {0}")]
    Task(String),
}
