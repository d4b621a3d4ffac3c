//! Command implementations

pub mod migrate;
pub mod validate;

use crate::StoreOpts;
use anyhow::{Context, Result};
use snapferry_cloud::{instance_identity, Coordinator, Snapshots, VolumeManager};
use snapferry_core::{Options, REQUIRED_TOOLS};
use snapferry_store::ObjectStore;

/// Everything a pipeline run needs, wired to the cloud
pub(crate) struct Runtime {
    pub options: Options,
    pub snapshots: Snapshots,
    pub coordinator: Coordinator,
    pub volumes: VolumeManager,
    pub store: ObjectStore,
}

/// Validate options, check external tools, resolve instance identity,
/// and build the cloud clients. Everything here is fatal at startup.
pub(crate) async fn bootstrap(opts: StoreOpts) -> Result<Runtime> {
    let options = opts.into_options()?;

    snapferry_proc::preflight(REQUIRED_TOOLS)
        .await
        .context("preflight check failed")?;

    let identity = instance_identity()
        .await
        .context("not running on an EC2 instance, or IMDS is unreachable")?;
    tracing::info!(
        instance = %identity.instance_id,
        zone = %identity.availability_zone,
        "resolved instance identity"
    );

    let sdk = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(identity.region.clone()))
        .load()
        .await;
    let ec2 = aws_sdk_ec2::Client::new(&sdk);
    let s3 = aws_sdk_s3::Client::new(&sdk);

    Ok(Runtime {
        snapshots: Snapshots::new(ec2.clone()),
        coordinator: Coordinator::new(ec2.clone(), options.tag.clone()),
        volumes: VolumeManager::new(
            ec2,
            identity.instance_id,
            identity.availability_zone,
            options.tag.clone(),
            options.volume_type.clone(),
        ),
        store: ObjectStore::new(s3, options.bucket.clone()),
        options,
    })
}
