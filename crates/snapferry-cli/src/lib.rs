//! snapferry CLI definitions
//!
//! Command-line surface for migrating EBS snapshots to S3 and
//! validating the copies.

pub mod commands;

use clap::Parser;

#[derive(Parser)]
#[command(name = "snapferry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by both pipelines
#[derive(Debug, clap::Args)]
pub struct StoreOpts {
    /// Tag key driving the claim protocol
    #[arg(long)]
    pub tag: String,

    /// Root directory for temporary mountpoints (not / )
    #[arg(long = "mount-point")]
    pub mount_point: String,

    /// Destination S3 bucket
    #[arg(long)]
    pub bucket: String,

    /// Temporary volume type
    #[arg(long = "volume-type", default_value = "standard")]
    pub volume_type: String,

    /// lz4 compression level (clamped to 1..9)
    #[arg(long = "compression-level", default_value_t = 1.0)]
    pub compression_level: f64,

    /// Concurrent multipart upload streams
    #[arg(long = "upload-streams", default_value_t = 4.0)]
    pub upload_streams: f64,

    /// Leave temporary volumes attached and mounted (debugging aid)
    #[arg(long = "keep-temp-volumes")]
    pub keep_temp_volumes: bool,

    /// Upload whole-volume raw images instead of per-partition tars
    #[arg(long)]
    pub dd: bool,

    /// Hash-compare each object right after uploading it
    #[arg(long)]
    pub validate: bool,

    /// Server-side encryption algorithm (AES256 or aws:kms)
    #[arg(long)]
    pub sse: Option<String>,

    /// KMS key id (requires --sse aws:kms)
    #[arg(long = "sse-kms-key-id")]
    pub sse_kms_key_id: Option<String>,

    /// Partition-name substrings to skip in tar mode
    #[arg(long = "skip-partitions", value_delimiter = ',')]
    pub skip_partitions: Vec<String>,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Upload snapshots to the bucket
    Migrate {
        #[command(flatten)]
        opts: StoreOpts,
        /// Process every owned snapshot tagged `migrate`
        #[arg(long)]
        all: bool,
        /// Specific snapshot ids to migrate
        snapshot_ids: Vec<String>,
    },
    /// Verify uploaded objects against their snapshots
    Validate {
        #[command(flatten)]
        opts: StoreOpts,
        /// Process every owned snapshot tagged `migrated`
        #[arg(long)]
        all: bool,
        /// Specific snapshot ids to validate
        snapshot_ids: Vec<String>,
    },
}

impl StoreOpts {
    /// Normalize into validated pipeline options
    pub fn into_options(self) -> snapferry_core::Result<snapferry_core::Options> {
        snapferry_core::Options::new(
            self.tag,
            self.mount_point,
            self.bucket,
            self.volume_type,
            self.compression_level,
            self.upload_streams,
            self.keep_temp_volumes,
            self.dd,
            self.validate,
            self.sse,
            self.sse_kms_key_id,
            self.skip_partitions,
        )
    }
}
