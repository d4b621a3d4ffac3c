//! Cloud collaborators for snapferry
//!
//! Wraps the EC2 snapshot/volume APIs and the instance metadata
//! service: the tag-based claim protocol that serializes competing
//! workers, and the lifecycle of the temporary volumes that expose
//! snapshot contents to this instance.

pub mod claim;
pub mod metadata;
pub mod snapshot;
pub mod volume;

pub use claim::{Claim, ClaimOutcome, Coordinator, SnapState, SETTLE_INTERVAL};
pub use metadata::{instance_identity, InstanceIdentity};
pub use snapshot::{Snapshot, Snapshots};
pub use volume::{mountpoint_for, Attachment, Volume, VolumeManager};

use thiserror::Error;

/// Result type for cloud operations
pub type Result<T> = std::result::Result<T, CloudError>;

/// Errors from EC2 and the metadata service
#[derive(Debug, Error)]
pub enum CloudError {
    /// An EC2 API call failed
    #[error("EC2 {op} failed: {message}")]
    Api { op: &'static str, message: String },

    /// Requested snapshot ids that describe did not return
    #[error("snapshots not found: {}", ids.join(", "))]
    SnapshotsMissing { ids: Vec<String> },

    /// Another worker won the claim race
    #[error("claim lost for {snapshot_id}: {reason}")]
    ClaimLost {
        snapshot_id: String,
        reason: String,
    },

    /// A long-poll budget ran out
    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    /// Every reserved attachment letter is in use
    #[error("no free attachment device letter on this instance")]
    NoFreeDevice,

    /// Instance metadata service failure
    #[error("instance metadata unavailable: {0}")]
    Metadata(String),

    /// Mountpoint preparation failed
    #[error("mount failed: {0}")]
    Mount(String),

    /// External tool failure (lsblk, mount, umount)
    #[error(transparent)]
    Proc(#[from] snapferry_proc::ProcError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
