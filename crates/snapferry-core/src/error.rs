//! Pipeline error types
//!
//! Migration of a list halts at the first failing snapshot so its
//! temporary volume can be inspected; validation keeps going and
//! reports everything at the end.

use snapferry_hash::HashDiff;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors from the migration and validation pipelines
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid or inconsistent configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// External tool failure
    #[error(transparent)]
    Proc(#[from] snapferry_proc::ProcError),

    /// EC2 / metadata failure
    #[error(transparent)]
    Cloud(#[from] snapferry_cloud::CloudError),

    /// Object store failure
    #[error(transparent)]
    Store(#[from] snapferry_store::StoreError),

    /// Hashing failure
    #[error(transparent)]
    Hash(#[from] snapferry_hash::HashError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupt delivered mid-upload; the multipart upload was aborted
    #[error("upload interrupted")]
    Interrupted,

    /// Stream wiring failure
    #[error("pipeline failed: {0}")]
    Pipeline(String),

    /// The copy does not reproduce the original
    #[error("validation failed: {0}")]
    Validation(ValidationFailure),

    /// A failure tagged with the snapshot it belongs to
    #[error(transparent)]
    Snapshot(#[from] Box<SnapshotError>),
}

/// Why a validation rejected a copy
#[derive(Debug)]
pub enum ValidationFailure {
    /// Whole-stream hashes disagree
    HashMismatch {
        key: String,
        local: String,
        remote: String,
    },
    /// The expected object does not exist
    MissingObject { key: String },
    /// Per-file listings disagree
    ListMismatch { key: String, diffs: Vec<HashDiff> },
    /// The comparator's matched count disagrees with the producers;
    /// a defect in the comparator itself, not in the data
    CountMismatch {
        key: String,
        matched: u64,
        local_count: u64,
        remote_count: u64,
    },
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HashMismatch { key, local, remote } => {
                write!(f, "{key}: hash mismatch (local {local}, remote {remote})")
            }
            Self::MissingObject { key } => write!(f, "{key}: object not found"),
            Self::ListMismatch { key, diffs } => {
                write!(f, "{key}: {} file(s) differ:", diffs.len())?;
                for diff in diffs {
                    write!(f, "\n  {diff}")?;
                }
                Ok(())
            }
            Self::CountMismatch {
                key,
                matched,
                local_count,
                remote_count,
            } => write!(
                f,
                "{key}: comparator matched {matched} but local listed {local_count} and remote {remote_count}"
            ),
        }
    }
}

/// An error tagged with the snapshot it affected
#[derive(Debug, Error)]
#[error("{operation} of {snapshot_id} failed: {source}")]
pub struct SnapshotError {
    /// "migration" or "validation"
    pub operation: &'static str,
    /// Affected snapshot
    pub snapshot_id: String,
    /// Underlying failure
    #[source]
    pub source: CoreError,
}

impl SnapshotError {
    /// Tag `source` with the snapshot it affected
    pub fn new(operation: &'static str, snapshot_id: impl Into<String>, source: CoreError) -> Self {
        Self {
            operation,
            snapshot_id: snapshot_id.into(),
            source,
        }
    }
}

/// Outcome of validating a list of snapshots.
///
/// Failures accumulate instead of halting; the successful set is
/// preserved alongside them.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Snapshots that validated clean
    pub succeeded: Vec<String>,
    /// Snapshots whose validation failed, with why
    pub failed: Vec<SnapshotError>,
    /// Snapshots another worker claimed first
    pub skipped: Vec<String>,
}

impl ValidationReport {
    /// True when nothing failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
