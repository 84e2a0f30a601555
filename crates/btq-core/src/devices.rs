//! Device-level operations: discovery via the external btrfs binary, and
//! the add/remove ioctls.
//!
//! Device removal can take unbounded time while the kernel migrates data
//! off the device; callers are expected to run [`remove_device`] from a
//! worker thread so the request loop stays responsive. Nothing here holds
//! the mount table lock while an ioctl runs.

use crate::mount::FilesystemHandle;
use crate::parse_to_helper_error;
use crate::sys;
use btq_error::{HelperError, Result};
use btq_ondisk::VolArgs;
use btq_types::{IOC_ADD_DEV, IOC_RM_DEV};
use serde::{Deserialize, Serialize};
use std::process::Command;

/// One device of a discovered filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u64,
    pub path: String,
}

/// One filesystem reported by the device scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub label: Option<String>,
    pub uuid: String,
    pub vols: Vec<DeviceInfo>,
}

/// Trigger a device rescan and report every filesystem found.
pub fn scan() -> Result<Vec<FilesystemInfo>> {
    let status = Command::new("btrfs").args(["device", "scan"]).status()?;
    if !status.success() {
        return Err(HelperError::Io(std::io::Error::other(format!(
            "btrfs device scan failed: {status}"
        ))));
    }

    let output = Command::new("btrfs").args(["filesystem", "show"]).output()?;
    if !output.status.success() {
        return Err(HelperError::Io(std::io::Error::other(format!(
            "btrfs filesystem show failed: {}",
            output.status
        ))));
    }

    Ok(parse_show_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `btrfs filesystem show` text into filesystem records.
///
/// Lines that do not match the two known shapes are skipped; the scan is
/// informational and a format drift should not make it fatal.
pub fn parse_show_output(text: &str) -> Vec<FilesystemInfo> {
    let mut filesystems: Vec<FilesystemInfo> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Label:") {
            let tokens: Vec<&str> = trimmed.split_whitespace().collect();
            let (Some(raw_label), Some(uuid)) = (tokens.get(1), tokens.get(3)) else {
                continue;
            };
            let label = if *raw_label == "none" {
                None
            } else {
                Some(raw_label.trim_matches('\'').to_owned())
            };
            filesystems.push(FilesystemInfo {
                label,
                uuid: (*uuid).to_owned(),
                vols: Vec::new(),
            });
            continue;
        }

        if trimmed.starts_with("devid") {
            let tokens: Vec<&str> = trimmed.split_whitespace().collect();
            let (Some(id), Some(path)) = (tokens.get(1), tokens.last()) else {
                continue;
            };
            let Ok(id) = id.parse::<u64>() else {
                continue;
            };
            if let Some(fs) = filesystems.last_mut() {
                fs.vols.push(DeviceInfo {
                    id,
                    path: (*path).to_owned(),
                });
            }
        }
    }

    filesystems
}

/// Add `devname` to the mounted filesystem.
pub fn add_device(fs: &FilesystemHandle, devname: &str) -> Result<()> {
    let mut args = VolArgs {
        fd: 0,
        name: devname.to_owned(),
    }
    .to_bytes()
    .map_err(|e| parse_to_helper_error(&e))?;
    sys::vol_args_ioctl(fs.root_fd(), "add_dev", IOC_ADD_DEV, &mut args)
}

/// Remove `devname` from the mounted filesystem. Blocks until the kernel
/// has migrated all data off the device.
pub fn remove_device(fs: &FilesystemHandle, devname: &str) -> Result<()> {
    let mut args = VolArgs {
        fd: 0,
        name: devname.to_owned(),
    }
    .to_bytes()
    .map_err(|e| parse_to_helper_error(&e))?;
    sys::vol_args_ioctl(fs.root_fd(), "rm_dev", IOC_RM_DEV, &mut args)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_OUTPUT: &str = "\
Label: 'tank'  uuid: 0f07c8ba-9f6b-4ac5-9ac4-97e10b1eb0b1
\tTotal devices 2 FS bytes used 1.50GiB
\tdevid    1 size 10.00GiB used 2.01GiB path /dev/sda1
\tdevid    2 size 10.00GiB used 2.01GiB path /dev/sdb1

Label: none  uuid: 11111111-2222-3333-4444-555555555555
\tTotal devices 1 FS bytes used 128.00KiB
\tdevid    1 size 1.00GiB used 112.00MiB path /dev/loop0
";

    #[test]
    fn parses_labelled_and_unlabelled_filesystems() {
        let found = parse_show_output(SHOW_OUTPUT);
        assert_eq!(found.len(), 2);

        assert_eq!(found[0].label.as_deref(), Some("tank"));
        assert_eq!(found[0].uuid, "0f07c8ba-9f6b-4ac5-9ac4-97e10b1eb0b1");
        assert_eq!(
            found[0].vols,
            vec![
                DeviceInfo {
                    id: 1,
                    path: "/dev/sda1".into()
                },
                DeviceInfo {
                    id: 2,
                    path: "/dev/sdb1".into()
                },
            ]
        );

        assert_eq!(found[1].label, None);
        assert_eq!(found[1].vols.len(), 1);
        assert_eq!(found[1].vols[0].path, "/dev/loop0");
    }

    #[test]
    fn unknown_lines_are_skipped() {
        let found = parse_show_output("warning: something\n\nLabel: 'x'  uuid: abc\n");
        assert_eq!(found.len(), 1);
        assert!(found[0].vols.is_empty());

        assert!(parse_show_output("").is_empty());
        // A devid line before any Label line has nowhere to attach.
        assert!(parse_show_output("devid 1 size 1GiB used 1GiB path /dev/x").is_empty());
    }
}
