//! Pipeline options
//!
//! Raw option values arrive from the command line and are normalized
//! here: the mount root gains its trailing slash, the compression level
//! and stream count are rounded into range, and disallowed
//! combinations are rejected before anything touches the cloud.

use crate::{CoreError, Result};

/// External tools the pipelines shell out to; checked at startup
pub const REQUIRED_TOOLS: &[&str] = &["lsblk", "lz4", "tar", "du", "mount", "umount", "sort"];

/// Validated pipeline options
#[derive(Debug, Clone)]
pub struct Options {
    /// User tag key driving the claim protocol
    pub tag: String,
    /// Root under which per-partition mountpoints live, trailing slash
    pub mount_root: String,
    /// Destination bucket
    pub bucket: String,
    /// Temporary volume type
    pub volume_type: String,
    /// lz4 compression level, 1..=9
    pub compression_level: u32,
    /// Multipart upload concurrency
    pub upload_streams: usize,
    /// Leave temporary volumes attached and mounted
    pub keep_temp_volumes: bool,
    /// Raw-image mode instead of per-partition tar
    pub dd: bool,
    /// Hash-compare right after each upload
    pub validate: bool,
    /// Server-side encryption algorithm
    pub sse: Option<String>,
    /// KMS key id, only valid with `aws:kms`
    pub sse_kms_key_id: Option<String>,
    /// Partition-name substrings to skip in tar mode
    pub skip_partitions: Vec<String>,
}

impl Options {
    /// Normalize and validate raw option values.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tag: String,
        mount_point: String,
        bucket: String,
        volume_type: String,
        compression_level: f64,
        upload_streams: f64,
        keep_temp_volumes: bool,
        dd: bool,
        validate: bool,
        sse: Option<String>,
        sse_kms_key_id: Option<String>,
        skip_partitions: Vec<String>,
    ) -> Result<Self> {
        if tag.is_empty() {
            return Err(CoreError::Config("tag must not be empty".to_string()));
        }
        if bucket.is_empty() {
            return Err(CoreError::Config("bucket must not be empty".to_string()));
        }
        if sse_kms_key_id.is_some() && sse.as_deref() != Some("aws:kms") {
            return Err(CoreError::Config(
                "sse-kms-key-id requires sse to be aws:kms".to_string(),
            ));
        }
        Ok(Self {
            tag,
            mount_root: normalize_mount_root(&mount_point)?,
            bucket,
            volume_type,
            compression_level: clamp_compression_level(compression_level),
            upload_streams: normalize_upload_streams(upload_streams),
            keep_temp_volumes,
            dd,
            validate,
            sse,
            sse_kms_key_id,
            skip_partitions: skip_partitions
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }

    /// Should this partition be skipped?
    pub fn skips_partition(&self, partition_name: &str) -> bool {
        !partition_name.is_empty()
            && self
                .skip_partitions
                .iter()
                .any(|deny| partition_name.contains(deny.as_str()))
    }
}

/// The mount root must name a real subtree and ends with exactly one
/// slash.
pub fn normalize_mount_root(mount_point: &str) -> Result<String> {
    let trimmed = mount_point.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(CoreError::Config(
            "mount-point must not be empty or /".to_string(),
        ));
    }
    Ok(format!("{trimmed}/"))
}

/// Round and clamp the lz4 level into 1..=9
pub fn clamp_compression_level(level: f64) -> u32 {
    level.round().clamp(1.0, 9.0) as u32
}

/// Round the stream count, floor 1
pub fn normalize_upload_streams(streams: f64) -> usize {
    (streams.round().max(1.0)) as usize
}
