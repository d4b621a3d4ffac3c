//! snapferry pipelines
//!
//! The migration pipeline streams snapshot contents, compressed,
//! into the object store; the validation pipeline independently proves
//! the copies reproduce the originals. Snapshots are processed strictly
//! in sequence so the eligible set can be re-queried between them.

pub mod config;
pub mod error;
pub mod migrate;
pub mod progress;
pub mod upload;
pub mod validate;

pub use config::{Options, REQUIRED_TOOLS};
pub use error::{CoreError, Result, SnapshotError, ValidationFailure, ValidationReport};
pub use migrate::Migrator;
pub use progress::{ByteCounter, CountingReader, Progress};
pub use validate::{validate_device_against_object, validate_directory_against_tar, Validator};
