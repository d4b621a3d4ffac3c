//! Validation pipeline
//!
//! Proves that an uploaded object reproduces the snapshot it came from.
//! Raw images are compared hash-to-hash with two hashers running in
//! parallel under one progress view; tar archives are compared per-file
//! with sorted hash listings, because tar is not canonical across
//! producers.

use crate::config::Options;
use crate::error::{SnapshotError, ValidationFailure, ValidationReport};
use crate::progress::Progress;
use crate::upload::recursive_size;
use crate::{CoreError, Result};
use snapferry_cloud::{
    CloudError, Coordinator, SnapState, Snapshot, Snapshots, VolumeManager,
};
use snapferry_hash::{
    compare_hash_lists, dir_entry_hashes, md5_reader_counting, sort_hash_list, tar_entry_hashes,
};
use snapferry_proc::{filesystems, partition_label, raw_disk, BlockDevice, FailureFlag, Tool};
use snapferry_store::{partition_tar_key, raw_image_key, ObjectStore};
use std::collections::HashSet;
use std::path::Path;

/// Compare a device (or file) against a compressed raw image object.
///
/// The local hasher reads the device while the remote hasher
/// decompresses a ranged download, both racing under one progress bar
/// sized to `local_size + remote_size`. Returns the common hash.
pub async fn validate_device_against_object(
    store: &ObjectStore,
    device: &Path,
    device_size: u64,
    key: &str,
) -> Result<String> {
    let head = store
        .head(key)
        .await?
        .ok_or_else(|| missing_object(key))?;
    let progress = Progress::bytes(device_size + head.content_length, "validating image");
    let local_counter = progress.counter(false);
    let remote_counter = progress.counter(false);

    let flag = FailureFlag::new();
    let mut lz4 = Tool::new("lz4", ["-d", "-c"]).spawn_filter(&flag)?;
    let mut lz4_stdin = lz4
        .take_stdin()
        .ok_or_else(|| CoreError::Pipeline("lz4 stdin unavailable".to_string()))?;
    let lz4_stdout = lz4
        .take_stdout()
        .ok_or_else(|| CoreError::Pipeline("lz4 stdout unavailable".to_string()))?;

    let local = async {
        let file = tokio::fs::File::open(device).await?;
        Ok::<String, CoreError>(md5_reader_counting(file, |n| local_counter.add(n)).await?)
    };
    let feed = async {
        let result = store
            .read_to(key, &mut lz4_stdin, |n| remote_counter.add(n))
            .await;
        drop(lz4_stdin);
        result?;
        Ok::<(), CoreError>(())
    };
    let remote = async { Ok::<String, CoreError>(md5_reader_counting(lz4_stdout, |_| {}).await?) };
    let settle = async { lz4.wait().await.map_err(CoreError::from) };

    let (local_hash, (), remote_hash, ()) = tokio::try_join!(local, feed, remote, settle)?;
    progress.finish();

    if local_hash == remote_hash {
        Ok(local_hash)
    } else {
        Err(CoreError::Validation(ValidationFailure::HashMismatch {
            key: key.to_string(),
            local: local_hash,
            remote: remote_hash,
        }))
    }
}

/// Compare a mounted directory against a compressed tar object.
///
/// The remote side stream-parses the tar (never materializing it) into
/// a per-file hash listing; the local side walks the directory into
/// another. Both are sorted and merged; the matched count must agree
/// with both producers' line counts. Returns the matched count.
pub async fn validate_directory_against_tar(
    store: &ObjectStore,
    dir: &Path,
    dir_size: u64,
    key: &str,
) -> Result<u64> {
    let head = store
        .head(key)
        .await?
        .ok_or_else(|| missing_object(key))?;
    let scratch = tempfile::tempdir()?;
    let local_list = scratch.path().join("local.md5");
    let remote_list = scratch.path().join("remote.md5");

    let progress = Progress::bytes(dir_size + head.content_length, "validating archive");
    let local_counter = progress.counter(false);
    let remote_counter = progress.counter(false);

    let flag = FailureFlag::new();
    let mut lz4 = Tool::new("lz4", ["-d", "-c"]).spawn_filter(&flag)?;
    let mut lz4_stdin = lz4
        .take_stdin()
        .ok_or_else(|| CoreError::Pipeline("lz4 stdin unavailable".to_string()))?;
    let lz4_stdout = lz4
        .take_stdout()
        .ok_or_else(|| CoreError::Pipeline("lz4 stdout unavailable".to_string()))?;

    let feed = async {
        let result = store
            .read_to(key, &mut lz4_stdin, |n| remote_counter.add(n))
            .await;
        drop(lz4_stdin);
        result?;
        Ok::<(), CoreError>(())
    };
    let remote = async { Ok::<u64, CoreError>(tar_entry_hashes(lz4_stdout, &remote_list).await?) };
    let local = async {
        let counter = local_counter.clone();
        Ok::<u64, CoreError>(
            dir_entry_hashes(dir, &local_list, move |n| counter.add(n)).await?,
        )
    };
    let settle = async { lz4.wait().await.map_err(CoreError::from) };

    let ((), remote_count, local_count, ()) = tokio::try_join!(feed, remote, local, settle)?;
    progress.finish();

    sort_hash_list(&local_list).await?;
    sort_hash_list(&remote_list).await?;
    let comparison = compare_hash_lists(&local_list, &remote_list)?;
    if !comparison.is_clean() {
        return Err(CoreError::Validation(ValidationFailure::ListMismatch {
            key: key.to_string(),
            diffs: comparison.diffs,
        }));
    }
    if comparison.matched != local_count || comparison.matched != remote_count {
        return Err(CoreError::Validation(ValidationFailure::CountMismatch {
            key: key.to_string(),
            matched: comparison.matched,
            local_count,
            remote_count,
        }));
    }
    Ok(comparison.matched)
}

fn missing_object(key: &str) -> CoreError {
    CoreError::Validation(ValidationFailure::MissingObject {
        key: key.to_string(),
    })
}

/// Per-snapshot validation orchestrator
pub struct Validator {
    options: Options,
    snapshots: Snapshots,
    coordinator: Coordinator,
    volumes: VolumeManager,
    store: ObjectStore,
}

impl Validator {
    /// Wire the validator to its collaborators
    pub fn new(
        options: Options,
        snapshots: Snapshots,
        coordinator: Coordinator,
        volumes: VolumeManager,
        store: ObjectStore,
    ) -> Self {
        Self {
            options,
            snapshots,
            coordinator,
            volumes,
            store,
        }
    }

    /// Validate the given snapshots, or everything tagged `migrated`
    /// with `--all`. Failures accumulate; the run keeps going.
    pub async fn run(&self, ids: &[String], all: bool) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        if all {
            loop {
                let attempted: HashSet<String> = report
                    .succeeded
                    .iter()
                    .chain(report.skipped.iter())
                    .cloned()
                    .chain(report.failed.iter().map(|f| f.snapshot_id.clone()))
                    .collect();
                let eligible = self
                    .snapshots
                    .eligible(self.coordinator.tag_key(), SnapState::Migrated.as_str())
                    .await?;
                let next = eligible
                    .into_iter()
                    .find(|s| !attempted.contains(&s.id));
                match next {
                    Some(snapshot) => self.process(&snapshot, &mut report).await,
                    None => break,
                }
            }
        } else {
            let snapshots = self.snapshots.describe_all(ids).await?;
            for snapshot in &snapshots {
                self.process(snapshot, &mut report).await;
            }
        }
        Ok(report)
    }

    async fn process(&self, snapshot: &Snapshot, report: &mut ValidationReport) {
        let claim = match self
            .coordinator
            .claim(snapshot, SnapState::Validating)
            .await
        {
            Ok(claim) => claim,
            Err(CloudError::ClaimLost { reason, .. }) => {
                tracing::info!(snapshot = %snapshot.id, "skipping: {reason}");
                report.skipped.push(snapshot.id.clone());
                return;
            }
            Err(err) => {
                report.failed.push(SnapshotError::new(
                    "validation",
                    &snapshot.id,
                    err.into(),
                ));
                return;
            }
        };

        match self.validate_snapshot(snapshot).await {
            Ok(()) => {
                if let Err(err) = self
                    .coordinator
                    .complete(&snapshot.id, SnapState::Validated.as_str())
                    .await
                {
                    report
                        .failed
                        .push(SnapshotError::new("validation", &snapshot.id, err.into()));
                } else {
                    tracing::info!(snapshot = %snapshot.id, "validation passed");
                    report.succeeded.push(snapshot.id.clone());
                }
            }
            Err(err) => {
                tracing::error!(snapshot = %snapshot.id, "validation failed: {err}");
                if let Err(recover_err) = self.coordinator.recover_validation(&claim).await {
                    tracing::warn!(
                        snapshot = %snapshot.id,
                        "could not restore claim tag: {recover_err}"
                    );
                }
                report
                    .failed
                    .push(SnapshotError::new("validation", &snapshot.id, err));
            }
        }
    }

    /// Validate one claimed snapshot: volume up, pick the mode by which
    /// object key exists, compare, tear down.
    async fn validate_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let volume = self.volumes.find_or_create(snapshot).await?;
        let device = self.volumes.find_or_attach(&volume).await?;
        let devices = self.volumes.wait_for_partitions(&device).await?;

        let raw_key = raw_image_key(
            &snapshot.volume_id,
            snapshot.start_time,
            &snapshot.id,
            &snapshot.description,
        );
        let outcome = if self.store.head(&raw_key).await?.is_some() {
            let disk = raw_disk(&devices)?;
            validate_device_against_object(&self.store, &disk.path, disk.size, &raw_key)
                .await
                .map(|hash| {
                    tracing::info!(snapshot = %snapshot.id, %hash, "raw image matches");
                })
        } else {
            self.validate_tar_mode(snapshot, &devices).await
        };

        if self.options.keep_temp_volumes {
            tracing::warn!(volume = %volume.id, "keeping temporary volume attached");
        } else if let Err(cleanup_err) = self.volumes.destroy(&volume.id).await {
            match &outcome {
                Ok(()) => return Err(cleanup_err.into()),
                Err(_) => tracing::warn!(volume = %volume.id, "cleanup failed: {cleanup_err}"),
            }
        }
        outcome
    }

    async fn validate_tar_mode(&self, snapshot: &Snapshot, devices: &[BlockDevice]) -> Result<()> {
        let view = filesystems(devices)?;
        for part in view {
            if self.options.skips_partition(&part.name) {
                tracing::info!(partition = %part.name, "partition on skip list");
                continue;
            }
            let label = partition_label(part);
            let key = partition_tar_key(
                &snapshot.volume_id,
                snapshot.start_time,
                &snapshot.id,
                &snapshot.description,
                label,
            );
            if self.store.head(&key).await?.is_none() {
                return Err(missing_object(&key));
            }
            let mountpoint =
                snapferry_cloud::mountpoint_for(&self.options.mount_root, &snapshot.id, label);
            self.volumes.mount(&part.path, &mountpoint).await?;

            let outcome = async {
                let size = recursive_size(&mountpoint).await?;
                validate_directory_against_tar(&self.store, &mountpoint, size, &key).await
            }
            .await;

            if !self.options.keep_temp_volumes {
                if let Err(umount_err) = self.volumes.unmount(&mountpoint).await {
                    match &outcome {
                        Ok(_) => return Err(umount_err.into()),
                        Err(_) => tracing::warn!("unmount failed: {umount_err}"),
                    }
                }
            }
            let matched = outcome?;
            tracing::info!(%key, matched, "archive matches");
        }
        Ok(())
    }
}
