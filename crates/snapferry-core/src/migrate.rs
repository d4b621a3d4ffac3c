//! Migration pipeline
//!
//! Moves one snapshot at a time: claim, temporary volume up, stream the
//! contents compressed into the object store, optionally validate
//! inline, tear the volume down. A list halts at the first failing
//! snapshot so its temporary volume is still there to inspect.

use crate::config::Options;
use crate::error::SnapshotError;
use crate::progress::Progress;
use crate::upload::{interrupt_guard, recursive_size, upload_from_tool};
use crate::validate::{validate_device_against_object, validate_directory_against_tar};
use crate::{CoreError, Result};
use snapferry_cloud::{
    mountpoint_for, CloudError, Coordinator, SnapState, Snapshot, Snapshots, VolumeManager,
};
use snapferry_proc::{filesystems, partition_label, raw_disk, BlockDevice, FailureFlag, Tool};
use snapferry_store::{
    object_tags, partition_tar_key, raw_image_key, ObjectStore, PutParams, SseParams,
};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// Per-snapshot migration orchestrator
pub struct Migrator {
    options: Options,
    snapshots: Snapshots,
    coordinator: Coordinator,
    volumes: VolumeManager,
    store: ObjectStore,
}

impl Migrator {
    /// Wire the migrator to its collaborators
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

    /// Migrate the given snapshots, or everything tagged `migrate` with
    /// `--all` (re-querying the eligible set between snapshots).
    ///
    /// Returns the ids migrated before the first failure; the failure
    /// itself halts the run.
    pub async fn run(&self, ids: &[String], all: bool) -> Result<Vec<String>> {
        let mut migrated = Vec::new();
        let mut attempted = HashSet::new();
        if all {
            loop {
                let eligible = self
                    .snapshots
                    .eligible(self.coordinator.tag_key(), SnapState::Migrate.as_str())
                    .await?;
                let next = eligible.into_iter().find(|s| !attempted.contains(&s.id));
                match next {
                    Some(snapshot) => {
                        attempted.insert(snapshot.id.clone());
                        self.process(&snapshot, &mut migrated).await?;
                    }
                    None => break,
                }
            }
        } else {
            let snapshots = self.snapshots.describe_all(ids).await?;
            for snapshot in &snapshots {
                self.process(snapshot, &mut migrated).await?;
            }
        }
        Ok(migrated)
    }

    async fn process(&self, snapshot: &Snapshot, migrated: &mut Vec<String>) -> Result<()> {
        match self.coordinator.claim(snapshot, SnapState::Migrating).await {
            Ok(_claim) => {}
            Err(CloudError::ClaimLost { reason, .. }) => {
                tracing::info!(snapshot = %snapshot.id, "skipping: {reason}");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        match self.migrate_snapshot(snapshot).await {
            Ok(()) => {
                self.coordinator
                    .complete(&snapshot.id, SnapState::Migrated.as_str())
                    .await?;
                tracing::info!(snapshot = %snapshot.id, "migration complete");
                migrated.push(snapshot.id.clone());
                Ok(())
            }
            Err(err) => {
                if let Err(recover_err) = self.coordinator.recover_migration(&snapshot.id).await {
                    tracing::warn!(
                        snapshot = %snapshot.id,
                        "could not restore claim tag: {recover_err}"
                    );
                }
                Err(Box::new(SnapshotError::new("migration", &snapshot.id, err)).into())
            }
        }
    }

    /// Migrate one claimed snapshot
    async fn migrate_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let volume = self.volumes.find_or_create(snapshot).await?;
        let device = self.volumes.find_or_attach(&volume).await?;
        let devices = self.volumes.wait_for_partitions(&device).await?;

        if self.options.dd {
            self.migrate_dd(snapshot, &devices).await?;
        } else {
            self.migrate_tar(snapshot, &devices).await?;
        }

        if self.options.keep_temp_volumes {
            tracing::warn!(volume = %volume.id, "keeping temporary volume attached");
            Ok(())
        } else {
            self.volumes.destroy(&volume.id).await.map_err(Into::into)
        }
    }

    /// dd mode: the whole volume as one compressed raw image
    async fn migrate_dd(&self, snapshot: &Snapshot, devices: &[BlockDevice]) -> Result<()> {
        let disk = raw_disk(devices)?;
        let key = raw_image_key(
            &snapshot.volume_id,
            snapshot.start_time,
            &snapshot.id,
            &snapshot.description,
        );
        let estimate = disk.size;
        self.upload_stream(
            snapshot,
            key.clone(),
            estimate,
            Tool::new(
                "dd",
                [
                    format!("if={}", disk.path.display()),
                    "bs=256K".to_string(),
                    "status=none".to_string(),
                ],
            ),
        )
        .await?;

        if self.options.validate {
            let hash =
                validate_device_against_object(&self.store, &disk.path, disk.size, &key).await?;
            tracing::info!(snapshot = %snapshot.id, %hash, "inline validation passed");
        }
        Ok(())
    }

    /// tar mode: one compressed archive per partition, in filesystem
    /// view order, each unmounted before the next starts
    async fn migrate_tar(&self, snapshot: &Snapshot, devices: &[BlockDevice]) -> Result<()> {
        let view = filesystems(devices)?;
        for part in view {
            if self.options.skips_partition(&part.name) {
                tracing::info!(partition = %part.name, "partition on skip list");
                continue;
            }
            let label = partition_label(part);
            let mountpoint = mountpoint_for(&self.options.mount_root, &snapshot.id, label);
            self.volumes.mount(&part.path, &mountpoint).await?;

            let outcome = self
                .upload_partition(snapshot, label, &mountpoint)
                .await;

            if !self.options.keep_temp_volumes {
                if let Err(umount_err) = self.volumes.unmount(&mountpoint).await {
                    match &outcome {
                        Ok(()) => return Err(umount_err.into()),
                        Err(_) => tracing::warn!("unmount failed: {umount_err}"),
                    }
                }
            }
            outcome?;
        }
        Ok(())
    }

    async fn upload_partition(
        &self,
        snapshot: &Snapshot,
        label: &str,
        mountpoint: &std::path::Path,
    ) -> Result<()> {
        let key = partition_tar_key(
            &snapshot.volume_id,
            snapshot.start_time,
            &snapshot.id,
            &snapshot.description,
            label,
        );
        let estimate = recursive_size(mountpoint).await?;
        self.upload_stream(
            snapshot,
            key.clone(),
            estimate,
            Tool::new("tar", ["-cf", "-", "."]).current_dir(mountpoint),
        )
        .await?;

        if self.options.validate {
            let matched =
                validate_directory_against_tar(&self.store, mountpoint, estimate, &key).await?;
            tracing::info!(%key, matched, "inline validation passed");
        }
        Ok(())
    }

    /// Run one source tool through the compressed multipart upload,
    /// with an interrupt watcher for the duration.
    async fn upload_stream(
        &self,
        snapshot: &Snapshot,
        key: String,
        estimate: u64,
        source: Tool,
    ) -> Result<()> {
        tracing::info!(%key, estimate, "uploading");
        let params = self.put_params(snapshot, key, estimate);
        let progress = Progress::bytes(estimate, "uploading");
        let counter = progress.counter(true);
        let flag = FailureFlag::new();
        let child = source.spawn_source(&flag)?;

        let cancel = CancellationToken::new();
        let guard = interrupt_guard(&cancel);
        let outcome = upload_from_tool(
            &self.store,
            params,
            child,
            &counter,
            self.options.compression_level,
            &flag,
            &cancel,
        )
        .await;
        guard.abort();
        progress.finish();

        let bytes = outcome?;
        tracing::info!(bytes, "upload settled");
        Ok(())
    }

    fn put_params(&self, snapshot: &Snapshot, key: String, estimate: u64) -> PutParams {
        PutParams {
            key,
            metadata: upload_metadata(snapshot, estimate),
            tags: object_tags(&snapshot.tags, &self.options.tag),
            sse: self.options.sse.as_ref().map(|algorithm| SseParams {
                algorithm: algorithm.clone(),
                kms_key_id: self.options.sse_kms_key_id.clone(),
            }),
            estimate,
            streams: self.options.upload_streams,
        }
    }
}

/// Provenance metadata stamped on every uploaded object
fn upload_metadata(snapshot: &Snapshot, estimate: u64) -> HashMap<String, String> {
    use chrono::SecondsFormat;
    HashMap::from([
        (
            "snapshot-starttime".to_string(),
            snapshot
                .start_time
                .to_rfc3339_opts(SecondsFormat::Secs, false),
        ),
        ("snapshot-snapshotid".to_string(), snapshot.id.clone()),
        (
            "snapshot-volumesize".to_string(),
            snapshot.size_gib.to_string(),
        ),
        ("snapshot-volumeid".to_string(), snapshot.volume_id.clone()),
        (
            "snapshot-description".to_string(),
            snapshot.description.clone(),
        ),
        ("uncompressed-size".to_string(), estimate.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot() -> Snapshot {
        Snapshot {
            id: "snap-A".to_string(),
            volume_id: "vol-A".to_string(),
            size_gib: 100,
            start_time: chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            description: String::new(),
            tags: vec![("backup".to_string(), "migrating".to_string())],
        }
    }

    #[test]
    fn test_upload_metadata_fields() {
        let metadata = upload_metadata(&snapshot(), 4096);
        assert_eq!(
            metadata.get("snapshot-starttime").map(String::as_str),
            Some("2024-01-02T03:04:05+00:00")
        );
        assert_eq!(
            metadata.get("snapshot-snapshotid").map(String::as_str),
            Some("snap-A")
        );
        assert_eq!(
            metadata.get("snapshot-volumesize").map(String::as_str),
            Some("100")
        );
        assert_eq!(
            metadata.get("snapshot-volumeid").map(String::as_str),
            Some("vol-A")
        );
        assert_eq!(
            metadata.get("snapshot-description").map(String::as_str),
            Some("")
        );
        assert_eq!(
            metadata.get("uncompressed-size").map(String::as_str),
            Some("4096")
        );
    }
}
