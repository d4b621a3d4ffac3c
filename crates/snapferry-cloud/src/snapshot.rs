//! Snapshot lookup
//!
//! Normalizes EC2 snapshot records into the fields the pipelines use
//! and answers the two queries they need: specific ids (with precise
//! missing-id reporting) and the eligible set for a claim-tag value.

use crate::{CloudError, Result};
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::Filter;
use aws_sdk_ec2::Client;
use chrono::{DateTime, Utc};

/// One snapshot, as the pipelines see it
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Snapshot id
    pub id: String,
    /// Source volume id
    pub volume_id: String,
    /// Volume size in GiB
    pub size_gib: i32,
    /// Creation timestamp
    pub start_time: DateTime<Utc>,
    /// Human description, possibly empty
    pub description: String,
    /// All tags on the snapshot
    pub tags: Vec<(String, String)>,
}

impl Snapshot {
    /// Value of a tag, if present
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Size in bytes (GiB tag on the API)
    pub fn size_bytes(&self) -> u64 {
        self.size_gib.max(0) as u64 * 1024 * 1024 * 1024
    }

    fn from_api(s: &aws_sdk_ec2::types::Snapshot) -> Option<Self> {
        let start = s.start_time()?;
        Some(Self {
            id: s.snapshot_id()?.to_string(),
            volume_id: s.volume_id().unwrap_or_default().to_string(),
            size_gib: s.volume_size().unwrap_or(0),
            start_time: DateTime::from_timestamp(start.secs(), start.subsec_nanos())?,
            description: s.description().unwrap_or_default().to_string(),
            tags: s
                .tags()
                .iter()
                .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                .collect(),
        })
    }
}

/// Snapshot query interface
#[derive(Debug, Clone)]
pub struct Snapshots {
    ec2: Client,
}

impl Snapshots {
    /// Bind to an EC2 client
    pub fn new(ec2: Client) -> Self {
        Self { ec2 }
    }

    /// Describe one snapshot; `None` when EC2 does not know the id
    pub async fn describe(&self, id: &str) -> Result<Option<Snapshot>> {
        let resp = self
            .ec2
            .describe_snapshots()
            .snapshot_ids(id)
            .send()
            .await;
        match resp {
            Ok(out) => Ok(out.snapshots().iter().find_map(Snapshot::from_api)),
            Err(err) => {
                // Unknown ids surface as InvalidSnapshot.NotFound
                let not_found = err.code().is_some_and(|code| code.contains("NotFound"));
                if not_found {
                    Ok(None)
                } else {
                    Err(CloudError::Api {
                        op: "describe_snapshots",
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    /// Describe a list of requested ids, failing with the complete set
    /// of missing ids if any are unknown.
    pub async fn describe_all(&self, ids: &[String]) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.describe(id).await? {
                Some(snapshot) => snapshots.push(snapshot),
                None => missing.push(id.clone()),
            }
        }
        if missing.is_empty() {
            Ok(snapshots)
        } else {
            Err(CloudError::SnapshotsMissing { ids: missing })
        }
    }

    /// Owned snapshots whose claim tag carries `value`.
    ///
    /// Re-queried between snapshots so a fleet of workers drains the
    /// pool without a shared queue.
    pub async fn eligible(&self, tag_key: &str, value: &str) -> Result<Vec<Snapshot>> {
        let out = self
            .ec2
            .describe_snapshots()
            .owner_ids("self")
            .filters(
                Filter::builder()
                    .name(format!("tag:{tag_key}"))
                    .values(value)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "describe_snapshots",
                message: e.to_string(),
            })?;
        Ok(out.snapshots().iter().filter_map(Snapshot::from_api).collect())
    }
}
