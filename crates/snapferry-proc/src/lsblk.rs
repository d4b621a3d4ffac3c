//! Kernel block device enumeration
//!
//! Probes an attached volume with `lsblk --json` and exposes the two
//! views the pipelines need: the single raw disk (dd mode) and the set
//! of mountable filesystem devices (tar mode).

use crate::{run_tool, ProcError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Kernel device classification as reported by lsblk TYPE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Whole disk
    Disk,
    /// Partition
    Part,
    /// Anything else lsblk may report (rom, loop, lvm, ...)
    Other(String),
}

impl From<&str> for DeviceKind {
    fn from(s: &str) -> Self {
        match s {
            "disk" => Self::Disk,
            "part" => Self::Part,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One kernel-visible block device
#[derive(Debug, Clone)]
pub struct BlockDevice {
    /// disk / part classification
    pub kind: DeviceKind,
    /// Device node path (/dev/xvdf1)
    pub path: PathBuf,
    /// Filesystem type, if the kernel recognizes one
    pub fstype: Option<String>,
    /// Current mountpoint, if mounted
    pub mountpoint: Option<PathBuf>,
    /// Kernel device name (xvdf1)
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    path: Option<String>,
    fstype: Option<String>,
    mountpoint: Option<String>,
    #[serde(default, deserialize_with = "de_size")]
    size: u64,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// lsblk emits SIZE as a number with --bytes on current util-linux and
/// as a string on older releases.
fn de_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Num(u64),
        Text(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Num(n) => Ok(n),
        Size::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn flatten(device: LsblkDevice, out: &mut Vec<BlockDevice>) {
    let LsblkDevice {
        name,
        kind,
        path,
        fstype,
        mountpoint,
        size,
        children,
    } = device;
    out.push(BlockDevice {
        kind: DeviceKind::from(kind.as_str()),
        path: PathBuf::from(path.unwrap_or_else(|| format!("/dev/{name}"))),
        fstype,
        mountpoint: mountpoint.map(PathBuf::from),
        name,
        size,
    });
    for child in children {
        flatten(child, out);
    }
}

/// Parse `lsblk --json --bytes` output into a flat device list
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json)?;
    let mut devices = Vec::new();
    for device in parsed.blockdevices {
        flatten(device, &mut devices);
    }
    Ok(devices)
}

/// Enumerate the block devices of one attached volume
pub async fn probe_device(device: &Path) -> Result<Vec<BlockDevice>> {
    let args = [
        "--json".to_string(),
        "--bytes".to_string(),
        "--output".to_string(),
        "NAME,TYPE,PATH,FSTYPE,MOUNTPOINT,SIZE".to_string(),
        device.display().to_string(),
    ];
    let json = run_tool("lsblk", args).await?;
    parse_lsblk(&json)
}

/// Partition label used in object keys and mountpoints: empty for the
/// whole-disk case (no partition table), the kernel name otherwise.
pub fn partition_label(device: &BlockDevice) -> &str {
    if device.kind == DeviceKind::Disk {
        ""
    } else {
        &device.name
    }
}

/// Raw-disk view: the volume as exactly one whole-disk device.
///
/// Used by dd mode, which images the device node wholesale.
pub fn raw_disk(devices: &[BlockDevice]) -> Result<&BlockDevice> {
    let mut disks = devices.iter().filter(|d| d.kind == DeviceKind::Disk);
    match (disks.next(), disks.next()) {
        (Some(disk), None) => Ok(disk),
        (None, _) => Err(ProcError::Probe("no disk device found".to_string())),
        (Some(_), Some(_)) => Err(ProcError::Probe(
            "expected exactly one disk device".to_string(),
        )),
    }
}

/// Filesystem view: the devices tar mode mounts and archives.
///
/// A single-entry list is the volume itself (no partition table).
/// Otherwise the single whole-disk entry is dropped and every surviving
/// entry must be a partition.
pub fn filesystems(devices: &[BlockDevice]) -> Result<Vec<&BlockDevice>> {
    if devices.len() == 1 {
        return Ok(devices.iter().collect());
    }
    let remaining: Vec<&BlockDevice> = devices
        .iter()
        .filter(|d| d.kind != DeviceKind::Disk)
        .collect();
    if let Some(bad) = remaining
        .iter()
        .find(|d| !matches!(d.kind, DeviceKind::Part))
    {
        return Err(ProcError::Probe(format!(
            "unknown device type {:?} for {}",
            bad.kind, bad.name
        )));
    }
    if remaining.is_empty() {
        return Err(ProcError::Probe("no partitions".to_string()));
    }
    if remaining.len() != devices.len() - 1 {
        return Err(ProcError::Probe(
            "expected exactly one disk device".to_string(),
        ));
    }
    Ok(remaining)
}
