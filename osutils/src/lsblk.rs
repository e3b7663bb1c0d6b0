use std::path::PathBuf;

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::dependencies::Dependency;

/// One device reported by `lsblk -J`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BlockDevice {
    pub path: PathBuf,

    #[serde(rename = "type")]
    pub device_type: String,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub mountpoint: Option<PathBuf>,

    /// Size in bytes (`lsblk -b`).
    #[serde(default)]
    pub size: u64,

    /// Removable device flag.
    #[serde(default)]
    pub rm: bool,

    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

#[derive(Deserialize, Debug)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

/// Lists all block devices, including partitions as children.
pub fn list() -> Result<Vec<BlockDevice>, Error> {
    let output = Dependency::Lsblk
        .cmd()
        .with_args(["-J", "-b", "-o", "PATH,TYPE,LABEL,MOUNTPOINT,SIZE,RM"])
        .output_and_check()
        .context("Failed to list block devices")?;
    parse(&output)
}

fn parse(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsblkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;
    Ok(parsed.blockdevices)
}

fn flatten(devices: &[BlockDevice]) -> Vec<&BlockDevice> {
    let mut all = Vec::new();
    for device in devices {
        all.push(device);
        all.extend(flatten(&device.children));
    }
    all
}

/// Finds the device carrying the given filesystem label.
pub fn find_by_label(label: &str) -> Result<Option<BlockDevice>, Error> {
    let devices = list()?;
    Ok(flatten(&devices)
        .into_iter()
        .find(|d| d.label.as_deref() == Some(label))
        .cloned())
}

/// Picks the largest non-removable disk, used for target auto-detection.
pub fn largest_disk() -> Result<Option<PathBuf>, Error> {
    let devices = list()?;
    Ok(devices
        .into_iter()
        .filter(|d| d.device_type == "disk" && !d.rm)
        .max_by_key(|d| d.size)
        .map(|d| d.path))
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    const SAMPLE: &str = indoc! {r#"
        {
          "blockdevices": [
            {
              "path": "/dev/sda",
              "type": "disk",
              "label": null,
              "mountpoint": null,
              "size": 128035676160,
              "rm": false,
              "children": [
                {
                  "path": "/dev/sda1",
                  "type": "part",
                  "label": "COS_STATE",
                  "mountpoint": "/run/keel/state",
                  "size": 16106127360,
                  "rm": false
                },
                {
                  "path": "/dev/sda2",
                  "type": "part",
                  "label": "COS_PERSISTENT",
                  "mountpoint": null,
                  "size": 64424509440,
                  "rm": false
                }
              ]
            },
            {
              "path": "/dev/sr0",
              "type": "rom",
              "label": "CDROM",
              "mountpoint": null,
              "size": 4700000000,
              "rm": true
            }
          ]
        }
    "#};

    #[test]
    fn test_parse_and_flatten() {
        let devices = parse(SAMPLE).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(flatten(&devices).len(), 4);
    }

    #[test]
    fn test_find_label_in_children() {
        let devices = parse(SAMPLE).unwrap();
        let found = flatten(&devices)
            .into_iter()
            .find(|d| d.label.as_deref() == Some("COS_PERSISTENT"))
            .unwrap();
        assert_eq!(found.path, PathBuf::from("/dev/sda2"));
    }

    #[test]
    fn test_largest_disk_ignores_removable() {
        let devices = parse(SAMPLE).unwrap();
        let disk = devices
            .into_iter()
            .filter(|d| d.device_type == "disk" && !d.rm)
            .max_by_key(|d| d.size)
            .map(|d| d.path)
            .unwrap();
        assert_eq!(disk, PathBuf::from("/dev/sda"));
    }
}
