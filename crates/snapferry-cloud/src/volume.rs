//! Temporary volume lifecycle
//!
//! A snapshot's contents are only readable through a volume created
//! from it, attached to this instance, and (for tar mode) mounted
//! read-only. Volumes are found-or-created so a crashed run's leftover
//! volume is adopted instead of leaking, and destroyed after use unless
//! the operator asked to keep them for inspection.

use crate::snapshot::Snapshot;
use crate::{CloudError, Result};
use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification, VolumeType};
use aws_sdk_ec2::Client;
use snapferry_proc::{probe_device, run_tool, BlockDevice, DeviceKind};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Attachment points reserved for temporary volumes
const DEVICE_LETTERS: std::ops::RangeInclusive<char> = 'f'..='p';

/// Name tag stamped on every temporary volume
const TEMP_VOLUME_NAME: &str = "Temp for snap-to-s3";

/// Claim-tag value stamped on every temporary volume
const TEMP_VOLUME_TAG_VALUE: &str = "in-progress";

/// Volume/attachment state polling (10 s, 60 attempts)
const STATE_POLL: Duration = Duration::from_secs(10);
const STATE_ATTEMPTS: u32 = 60;

/// Partition visibility polling (4 s, 75 attempts)
const PARTITION_POLL: Duration = Duration::from_secs(4);
const PARTITION_ATTEMPTS: u32 = 75;

/// One attachment of a volume
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Instance the volume is attached to
    pub instance_id: String,
    /// Attachment device name as EC2 knows it (/dev/sdf)
    pub device: String,
    /// attaching / attached / detaching / available
    pub state: String,
}

/// A volume, as the lifecycle sees it
#[derive(Debug, Clone)]
pub struct Volume {
    /// Volume id
    pub id: String,
    /// Availability zone
    pub availability_zone: String,
    /// creating / available / in-use / ...
    pub state: String,
    /// Current attachments
    pub attachments: Vec<Attachment>,
}

impl Volume {
    fn from_api(v: &aws_sdk_ec2::types::Volume) -> Option<Self> {
        Some(Self {
            id: v.volume_id()?.to_string(),
            availability_zone: v.availability_zone().unwrap_or_default().to_string(),
            state: v.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
            attachments: v
                .attachments()
                .iter()
                .map(|a| Attachment {
                    instance_id: a.instance_id().unwrap_or_default().to_string(),
                    device: a.device().unwrap_or_default().to_string(),
                    state: a.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
                })
                .collect(),
        })
    }

    /// The attachment on `instance_id`, if any
    pub fn attachment_on(&self, instance_id: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.instance_id == instance_id)
    }

    /// True when any attachment binds a different instance
    pub fn attached_elsewhere(&self, instance_id: &str) -> bool {
        self.attachments
            .iter()
            .any(|a| a.instance_id != instance_id && !a.instance_id.is_empty())
    }
}

/// Derive the mountpoint for one partition of one snapshot.
///
/// `mount_root` is already normalized to a trailing slash.
pub fn mountpoint_for(mount_root: &str, snapshot_id: &str, partition: &str) -> PathBuf {
    if partition.is_empty() {
        PathBuf::from(format!("{mount_root}{snapshot_id}"))
    } else {
        PathBuf::from(format!("{mount_root}{snapshot_id}-{partition}"))
    }
}

/// First reserved letter not used by any existing attachment device
fn pick_device_letter(used_devices: &[String]) -> Option<char> {
    DEVICE_LETTERS.into_iter().find(|letter| {
        !used_devices.iter().any(|device| {
            device.ends_with(&format!("sd{letter}")) || device.ends_with(&format!("xvd{letter}"))
        })
    })
}

/// Kernel node candidates for an EC2 attachment device name.
///
/// Xen instances rename /dev/sdX to /dev/xvdX; either may appear.
fn device_candidates(attach_device: &str) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(attach_device)];
    if let Some(suffix) = attach_device.strip_prefix("/dev/sd") {
        candidates.push(PathBuf::from(format!("/dev/xvd{suffix}")));
    }
    candidates
}

/// Temporary volume lifecycle manager
#[derive(Debug, Clone)]
pub struct VolumeManager {
    ec2: Client,
    instance_id: String,
    availability_zone: String,
    tag_key: String,
    volume_type: String,
}

impl VolumeManager {
    /// Manage temporary volumes for this instance
    pub fn new(
        ec2: Client,
        instance_id: impl Into<String>,
        availability_zone: impl Into<String>,
        tag_key: impl Into<String>,
        volume_type: impl Into<String>,
    ) -> Self {
        Self {
            ec2,
            instance_id: instance_id.into(),
            availability_zone: availability_zone.into(),
            tag_key: tag_key.into(),
            volume_type: volume_type.into(),
        }
    }

    /// Describe one volume
    pub async fn describe(&self, volume_id: &str) -> Result<Volume> {
        let out = self
            .ec2
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "describe_volumes",
                message: e.to_string(),
            })?;
        out.volumes()
            .iter()
            .find_map(Volume::from_api)
            .ok_or_else(|| CloudError::Api {
                op: "describe_volumes",
                message: format!("{volume_id} not returned"),
            })
    }

    /// Find a leftover temporary volume for `snapshot` or create one.
    ///
    /// Adoption keys on the claim tag, the source snapshot and our
    /// availability zone, and skips volumes attached to some other
    /// instance. The returned volume is `available` or `in-use`.
    pub async fn find_or_create(&self, snapshot: &Snapshot) -> Result<Volume> {
        let out = self
            .ec2
            .describe_volumes()
            .filters(Filter::builder().name("tag-key").values(&self.tag_key).build())
            .filters(Filter::builder().name("snapshot-id").values(&snapshot.id).build())
            .filters(
                Filter::builder()
                    .name("availability-zone")
                    .values(&self.availability_zone)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "describe_volumes",
                message: e.to_string(),
            })?;
        let adopted = out
            .volumes()
            .iter()
            .filter_map(Volume::from_api)
            .find(|v| !v.attached_elsewhere(&self.instance_id));

        let volume_id = match adopted {
            Some(volume) => {
                tracing::info!(volume = %volume.id, snapshot = %snapshot.id, "adopting existing temporary volume");
                volume.id
            }
            None => {
                tracing::info!(snapshot = %snapshot.id, "creating temporary volume");
                let out = self
                    .ec2
                    .create_volume()
                    .snapshot_id(&snapshot.id)
                    .availability_zone(&self.availability_zone)
                    .volume_type(VolumeType::from(self.volume_type.as_str()))
                    .tag_specifications(
                        TagSpecification::builder()
                            .resource_type(ResourceType::Volume)
                            .tags(Tag::builder().key("Name").value(TEMP_VOLUME_NAME).build())
                            .tags(
                                Tag::builder()
                                    .key(&self.tag_key)
                                    .value(TEMP_VOLUME_TAG_VALUE)
                                    .build(),
                            )
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| CloudError::Api {
                        op: "create_volume",
                        message: e.to_string(),
                    })?;
                out.volume_id()
                    .ok_or_else(|| CloudError::Api {
                        op: "create_volume",
                        message: "response carried no volume id".to_string(),
                    })?
                    .to_string()
            }
        };

        self.wait_for_volume_state(&volume_id, &["available", "in-use"])
            .await
    }

    /// Attach the volume here (or adopt its existing attachment) and
    /// wait for the kernel device node.
    pub async fn find_or_attach(&self, volume: &Volume) -> Result<PathBuf> {
        let attach_device = match volume.attachment_on(&self.instance_id) {
            Some(attachment) => attachment.device.clone(),
            None => {
                let used = self.used_attachment_devices().await?;
                let letter = pick_device_letter(&used).ok_or(CloudError::NoFreeDevice)?;
                let device = format!("/dev/sd{letter}");
                tracing::info!(volume = %volume.id, device = %device, "attaching volume");
                self.ec2
                    .attach_volume()
                    .volume_id(&volume.id)
                    .instance_id(&self.instance_id)
                    .device(&device)
                    .send()
                    .await
                    .map_err(|e| CloudError::Api {
                        op: "attach_volume",
                        message: e.to_string(),
                    })?;
                device
            }
        };

        let candidates = device_candidates(&attach_device);
        poll_until(STATE_POLL, STATE_ATTEMPTS, "kernel device node", || {
            let candidates = candidates.clone();
            async move {
                for candidate in candidates {
                    if tokio::fs::metadata(&candidate).await.is_ok() {
                        return Ok(Some(candidate));
                    }
                }
                Ok(None)
            }
        })
        .await
    }

    /// Wait until the kernel has finished scanning the new device.
    ///
    /// Done when at least one partition is visible, or when the single
    /// disk entry already carries a filesystem (a formatted bare volume
    /// has no partition table to wait for).
    pub async fn wait_for_partitions(&self, device: &Path) -> Result<Vec<BlockDevice>> {
        poll_until(PARTITION_POLL, PARTITION_ATTEMPTS, "partition scan", || {
            let device = device.to_path_buf();
            async move {
                let devices = match probe_device(&device).await {
                    Ok(devices) => devices,
                    Err(err) => {
                        tracing::debug!(device = %device.display(), "probe not ready: {err}");
                        return Ok(None);
                    }
                };
                let has_partition = devices.iter().any(|d| d.kind == DeviceKind::Part);
                let bare_filesystem = devices.len() == 1
                    && devices[0].kind == DeviceKind::Disk
                    && devices[0].fstype.is_some();
                if has_partition || bare_filesystem {
                    Ok(Some(devices))
                } else {
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Mount a device read-only at `mountpoint`.
    ///
    /// Already-mounted at exactly that path is fine; a nonempty
    /// mountpoint directory is refused.
    pub async fn mount(&self, device: &Path, mountpoint: &Path) -> Result<()> {
        if let Ok(devices) = probe_device(device).await {
            if devices
                .iter()
                .any(|d| d.mountpoint.as_deref() == Some(mountpoint))
            {
                tracing::debug!(device = %device.display(), "already mounted at expected mountpoint");
                return Ok(());
            }
        }
        tokio::fs::create_dir_all(mountpoint).await?;
        let mut entries = tokio::fs::read_dir(mountpoint).await?;
        if entries.next_entry().await?.is_some() {
            return Err(CloudError::Mount(format!(
                "mountpoint {} is not empty",
                mountpoint.display()
            )));
        }
        run_tool(
            "mount",
            [
                "-o".to_string(),
                "ro".to_string(),
                device.display().to_string(),
                mountpoint.display().to_string(),
            ],
        )
        .await?;
        tracing::info!(device = %device.display(), mountpoint = %mountpoint.display(), "mounted read-only");
        Ok(())
    }

    /// Unmount and remove the mountpoint directory
    pub async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        run_tool("umount", [mountpoint.display().to_string()]).await?;
        if let Err(err) = tokio::fs::remove_dir(mountpoint).await {
            tracing::warn!(
                mountpoint = %mountpoint.display(),
                "could not remove mountpoint directory: {err}"
            );
        }
        Ok(())
    }

    /// Detach, wait out the detach, and delete the volume
    pub async fn destroy(&self, volume_id: &str) -> Result<()> {
        tracing::info!(volume = %volume_id, "detaching and deleting temporary volume");
        self.ec2
            .detach_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "detach_volume",
                message: e.to_string(),
            })?;
        self.wait_for_volume_state(volume_id, &["available"]).await?;
        self.ec2
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "delete_volume",
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn wait_for_volume_state(&self, volume_id: &str, states: &[&str]) -> Result<Volume> {
        poll_until(
            STATE_POLL,
            STATE_ATTEMPTS,
            &format!("volume {volume_id} to become {}", states.join("/")),
            || async move {
                let volume = self.describe(volume_id).await?;
                if states.contains(&volume.state.as_str()) {
                    Ok(Some(volume))
                } else {
                    Ok(None)
                }
            },
        )
        .await
    }

    /// Device names of every attachment on this instance
    async fn used_attachment_devices(&self) -> Result<Vec<String>> {
        let out = self
            .ec2
            .describe_volumes()
            .filters(
                Filter::builder()
                    .name("attachment.instance-id")
                    .values(&self.instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| CloudError::Api {
                op: "describe_volumes",
                message: e.to_string(),
            })?;
        Ok(out
            .volumes()
            .iter()
            .filter_map(Volume::from_api)
            .flat_map(|v| {
                v.attachments
                    .into_iter()
                    .filter(|a| a.instance_id == self.instance_id)
                    .map(|a| a.device)
            })
            .collect())
    }
}

/// Retry `f` on a fixed interval until it yields a value or the attempt
/// budget runs out.
async fn poll_until<T, F, Fut>(
    interval: Duration,
    attempts: u32,
    what: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 0..attempts {
        if let Some(value) = f().await? {
            return Ok(value);
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(CloudError::Timeout {
        what: what.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_device_letter_prefers_first_free() {
        assert_eq!(pick_device_letter(&[]), Some('f'));
        let used = vec!["/dev/sdf".to_string(), "/dev/xvdg".to_string()];
        assert_eq!(pick_device_letter(&used), Some('h'));
    }

    #[test]
    fn test_pick_device_letter_exhaustion() {
        let used: Vec<String> = DEVICE_LETTERS
            .into_iter()
            .map(|l| format!("/dev/sd{l}"))
            .collect();
        assert_eq!(pick_device_letter(&used), None);
    }

    #[test]
    fn test_pick_device_letter_ignores_out_of_range() {
        // Root volume on /dev/xvda does not consume a reserved letter
        let used = vec!["/dev/xvda".to_string()];
        assert_eq!(pick_device_letter(&used), Some('f'));
    }

    #[test]
    fn test_device_candidates_include_xvd_rename() {
        let candidates = device_candidates("/dev/sdf");
        assert_eq!(
            candidates,
            vec![PathBuf::from("/dev/sdf"), PathBuf::from("/dev/xvdf")]
        );
        assert_eq!(
            device_candidates("/dev/xvdf"),
            vec![PathBuf::from("/dev/xvdf")]
        );
    }

    #[test]
    fn test_mountpoint_for() {
        assert_eq!(
            mountpoint_for("/mnt/snap/", "snap-1234", ""),
            PathBuf::from("/mnt/snap/snap-1234")
        );
        assert_eq!(
            mountpoint_for("/mnt/snap/", "snap-1234", "xvdf1"),
            PathBuf::from("/mnt/snap/snap-1234-xvdf1")
        );
    }

    #[tokio::test]
    async fn test_poll_until_returns_first_hit() {
        let mut calls = 0;
        let value = poll_until(Duration::from_millis(1), 5, "test", || {
            calls += 1;
            let hit = calls >= 3;
            async move { Ok(if hit { Some("done") } else { None }) }
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let err = poll_until(Duration::from_millis(1), 3, "never", || async {
            Ok(None::<()>)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CloudError::Timeout { .. }));
    }
}
