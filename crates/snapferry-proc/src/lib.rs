//! External tool plumbing for snapferry
//!
//! Wraps the external tools the pipelines lean on (lz4, tar, dd, mount,
//! lsblk, du, sort) behind spawn/wait helpers with piped stdio, and
//! parses the kernel's block device view.

pub mod lsblk;
pub mod pipeline;

pub use lsblk::{
    filesystems, parse_lsblk, partition_label, probe_device, raw_disk, BlockDevice, DeviceKind,
};
pub use pipeline::{preflight, run_tool, run_tool_with_env, FailureFlag, Tool, ToolChild};

use thiserror::Error;

/// Result type for tool operations
pub type Result<T> = std::result::Result<T, ProcError>;

/// Errors from external tool pipelines and device probing
#[derive(Debug, Error)]
pub enum ProcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tool could not be started
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Tool exited with a non-zero status
    #[error("{tool} exited with {status}{detail}")]
    Exit {
        tool: String,
        status: std::process::ExitStatus,
        detail: String,
    },

    /// Required tools are not on PATH
    #[error("required tools missing from PATH: {0}")]
    MissingTools(String),

    /// Block device enumeration produced an unusable result
    #[error("device probe failed: {0}")]
    Probe(String),

    /// lsblk output could not be parsed
    #[error("failed to parse lsblk output: {0}")]
    Parse(#[from] serde_json::Error),
}
