use failure::ResultExt;
use lazy_static::lazy_static;
use log::{debug, trace};
use regex::Regex;
use std::fs::read_link;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};

use crate::{
    common::{call, file_exists, path_append, UpdErrCtx, UpdError, UpdErrorKind},
    defs::{DISK_BY_LABEL_PATH, RESIN_BOOT_LABEL},
    linux::linux_defs::{
        BOOT_DIR, E2LABEL_CMD, FATLABEL_CMD, FINDMNT_CMD, LSBLK_CMD, MKFS_EXT3_CMD, NIX_NONE,
    },
};

// The device primitives the updater is written against. The live
// implementation shells out to the usual block device tooling; tests use
// an in-memory stand-in.
pub(crate) trait DeviceApi {
    // device the root filesystem of the running system is mounted from
    fn get_root_partition(&self) -> Result<PathBuf, UpdError>;
    // device holding the boot files of the running system
    fn get_boot_partition(&self) -> Result<PathBuf, UpdError>;
    fn get_device_for_label(&self, label: &str) -> Result<Option<PathBuf>, UpdError>;
    fn get_label(&self, device: &Path) -> Result<Option<String>, UpdError>;
    fn set_ext_label(&self, device: &Path, label: &str) -> Result<(), UpdError>;
    fn set_vfat_label(&self, device: &Path, label: &str) -> Result<(), UpdError>;
    fn is_mounted(&self, path: &Path) -> Result<bool, UpdError>;
    fn get_mountpoint(&self, device: &Path) -> Result<Option<PathBuf>, UpdError>;
    fn mount(&self, device: &Path, mountpoint: &Path, fs_type: Option<&str>)
        -> Result<(), UpdError>;
    fn remount(&self, mountpoint: &Path, readonly: bool) -> Result<(), UpdError>;
    fn umount(&self, path: &Path) -> Result<(), UpdError>;
    fn format_ext3(&self, device: &Path, label: &str) -> Result<(), UpdError>;
    fn get_size(&self, device: &Path) -> Result<u64, UpdError>;
}

// Splits a partition device path into its non numeric prefix and the
// trailing partition index. Paths without trailing digits yield None.
pub(crate) fn parse_device_index(device: &Path) -> Option<(String, u32)> {
    let dev_str = device.to_string_lossy();
    let digits = dev_str
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    let (prefix, index) = dev_str.split_at(dev_str.len() - digits);
    match index.parse::<u32>() {
        Ok(index) => Some((String::from(prefix), index)),
        Err(_) => None,
    }
}

pub(crate) fn drive_from_partition(partition: &Path) -> Result<PathBuf, UpdError> {
    const DRIVE2PART_REGEX: &str = r#"^(/dev/([hs]d[a-z]|nvme\d+n\d+|mmcblk\d+))(p?\d+)$"#;
    lazy_static! {
        static ref DRIVE2PART_RE: Regex = Regex::new(DRIVE2PART_REGEX).unwrap();
    }

    if let Some(captures) = DRIVE2PART_RE.captures(&partition.to_string_lossy()) {
        Ok(PathBuf::from(captures.get(1).unwrap().as_str()))
    } else {
        Err(UpdError::from_remark(
            UpdErrorKind::InvParam,
            &format!(
                "Failed to derive drive name from partition name: '{}'",
                partition.display()
            ),
        ))
    }
}

// dereference /dev/disk/by-* links to the plain /dev path
pub(crate) fn to_std_device_path(device: &Path) -> Result<PathBuf, UpdError> {
    trace!("to_std_device_path: entered with '{}'", device.display());

    match read_link(device) {
        Ok(link) => {
            if let Some(parent) = device.parent() {
                let dev_path = path_append(parent, link);
                Ok(dev_path.canonicalize().context(UpdErrCtx::from_remark(
                    UpdErrorKind::Upstream,
                    &format!("failed to canonicalize path from: '{}'", dev_path.display()),
                ))?)
            } else {
                Ok(PathBuf::from(device))
            }
        }
        Err(_why) => Ok(PathBuf::from(device)),
    }
}

pub(crate) struct LinuxDeviceApi {
    root_base: PathBuf,
}

impl LinuxDeviceApi {
    pub fn new(root_base: &Path) -> LinuxDeviceApi {
        LinuxDeviceApi {
            root_base: PathBuf::from(root_base),
        }
    }

    fn findmnt_source(&self, path: &Path) -> Result<Option<PathBuf>, UpdError> {
        let path_str = path.to_string_lossy();
        let cmd_res = call(FINDMNT_CMD, &["-n", "-o", "SOURCE", &path_str], true)?;
        if cmd_res.status.success() && !cmd_res.stdout.is_empty() {
            if let Some(line) = cmd_res.stdout.lines().next() {
                return Ok(Some(PathBuf::from(line)));
            }
        }
        Ok(None)
    }
}

impl DeviceApi for LinuxDeviceApi {
    fn get_root_partition(&self) -> Result<PathBuf, UpdError> {
        if let Some(device) = self.findmnt_source(&self.root_base)? {
            debug!("get_root_partition: '{}'", device.display());
            Ok(device)
        } else {
            Err(UpdError::from_remark(
                UpdErrorKind::NotFound,
                &format!(
                    "get_root_partition: no filesystem mounted on '{}'",
                    self.root_base.display()
                ),
            ))
        }
    }

    fn get_boot_partition(&self) -> Result<PathBuf, UpdError> {
        if let Some(device) = self.get_device_for_label(RESIN_BOOT_LABEL)? {
            return Ok(device);
        }

        let boot_path = path_append(&self.root_base, BOOT_DIR);
        if let Some(device) = self.findmnt_source(&boot_path)? {
            debug!("get_boot_partition: '{}'", device.display());
            Ok(device)
        } else {
            Err(UpdError::from_remark(
                UpdErrorKind::NotFound,
                &format!(
                    "get_boot_partition: no filesystem mounted on '{}'",
                    boot_path.display()
                ),
            ))
        }
    }

    fn get_device_for_label(&self, label: &str) -> Result<Option<PathBuf>, UpdError> {
        let label_path = path_append(DISK_BY_LABEL_PATH, label);
        if file_exists(&label_path) {
            Ok(Some(to_std_device_path(&label_path)?))
        } else {
            Ok(None)
        }
    }

    fn get_label(&self, device: &Path) -> Result<Option<String>, UpdError> {
        let dev_str = device.to_string_lossy();
        let cmd_res = call(LSBLK_CMD, &["-n", "-o", "LABEL", &dev_str], true)?;
        if !cmd_res.status.success() {
            return Err(UpdError::from_remark(
                UpdErrorKind::ExecProcess,
                &format!("get_label: failed to read label of '{}'", dev_str),
            ));
        }
        if cmd_res.stdout.is_empty() {
            Ok(None)
        } else {
            Ok(Some(cmd_res.stdout))
        }
    }

    fn set_ext_label(&self, device: &Path, label: &str) -> Result<(), UpdError> {
        let dev_str = device.to_string_lossy();
        let cmd_res = call(E2LABEL_CMD, &[&dev_str, label], true)?;
        if cmd_res.status.success() {
            Ok(())
        } else {
            Err(UpdError::from_remark(
                UpdErrorKind::ExecProcess,
                &format!(
                    "set_ext_label: failed to label '{}' as '{}': {}",
                    dev_str, label, cmd_res.stderr
                ),
            ))
        }
    }

    fn set_vfat_label(&self, device: &Path, label: &str) -> Result<(), UpdError> {
        let dev_str = device.to_string_lossy();
        let cmd_res = call(FATLABEL_CMD, &[&dev_str, label], true)?;
        if cmd_res.status.success() {
            Ok(())
        } else {
            Err(UpdError::from_remark(
                UpdErrorKind::ExecProcess,
                &format!(
                    "set_vfat_label: failed to label '{}' as '{}': {}",
                    dev_str, label, cmd_res.stderr
                ),
            ))
        }
    }

    fn is_mounted(&self, path: &Path) -> Result<bool, UpdError> {
        let path_str = path.to_string_lossy();
        let cmd_res = call(FINDMNT_CMD, &["-n", &path_str], true)?;
        Ok(cmd_res.status.success() && !cmd_res.stdout.is_empty())
    }

    fn get_mountpoint(&self, device: &Path) -> Result<Option<PathBuf>, UpdError> {
        let dev_str = device.to_string_lossy();
        let cmd_res = call(FINDMNT_CMD, &["-n", "-o", "TARGET", &dev_str], true)?;
        if cmd_res.status.success() && !cmd_res.stdout.is_empty() {
            if let Some(line) = cmd_res.stdout.lines().next() {
                return Ok(Some(PathBuf::from(line)));
            }
        }
        Ok(None)
    }

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fs_type: Option<&str>,
    ) -> Result<(), UpdError> {
        debug!(
            "mount: '{}' on '{}' with fs type {:?}",
            device.display(),
            mountpoint.display(),
            fs_type
        );
        mount(
            Some(device),
            mountpoint,
            if let Some(fs_type) = fs_type {
                Some(fs_type.as_bytes())
            } else {
                NIX_NONE
            },
            MsFlags::empty(),
            NIX_NONE,
        )
        .context(UpdErrCtx::from_remark(
            UpdErrorKind::MountFailed,
            &format!(
                "Failed to mount '{}' on '{}'",
                device.display(),
                mountpoint.display()
            ),
        ))?;
        Ok(())
    }

    fn remount(&self, mountpoint: &Path, readonly: bool) -> Result<(), UpdError> {
        let mut flags = MsFlags::MS_REMOUNT;
        if readonly {
            flags |= MsFlags::MS_RDONLY;
        }
        debug!(
            "remount: '{}' {}",
            mountpoint.display(),
            if readonly { "read-only" } else { "read-write" }
        );
        let source: Option<&Path> = None;
        mount(source, mountpoint, NIX_NONE, flags, NIX_NONE).context(UpdErrCtx::from_remark(
            UpdErrorKind::MountFailed,
            &format!("Failed to remount '{}'", mountpoint.display()),
        ))?;
        Ok(())
    }

    fn umount(&self, path: &Path) -> Result<(), UpdError> {
        debug!("umount: '{}'", path.display());
        umount(path).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to unmount '{}'", path.display()),
        ))?;
        Ok(())
    }

    fn format_ext3(&self, device: &Path, label: &str) -> Result<(), UpdError> {
        let dev_str = device.to_string_lossy();
        let cmd_res = call(MKFS_EXT3_CMD, &["-F", "-L", label, &dev_str], true)?;
        if cmd_res.status.success() {
            Ok(())
        } else {
            Err(UpdError::from_remark(
                UpdErrorKind::FormatFailed,
                &format!(
                    "format_ext3: failed to format '{}': {}",
                    dev_str, cmd_res.stderr
                ),
            ))
        }
    }

    fn get_size(&self, device: &Path) -> Result<u64, UpdError> {
        let dev_str = device.to_string_lossy();
        let cmd_res = call(LSBLK_CMD, &["-b", "-d", "-n", "-o", "SIZE", &dev_str], true)?;
        if !cmd_res.status.success() || cmd_res.stdout.is_empty() {
            return Err(UpdError::from_remark(
                UpdErrorKind::ExecProcess,
                &format!("get_size: failed to read size of '{}'", dev_str),
            ));
        }
        Ok(cmd_res
            .stdout
            .parse::<u64>()
            .context(UpdErrCtx::from_remark(
                UpdErrorKind::InvParam,
                &format!(
                    "get_size: failed to parse size from '{}'",
                    cmd_res.stdout
                ),
            ))?)
    }
}

#[cfg(test)]
mod tests {
    use super::{drive_from_partition, parse_device_index};
    use std::path::{Path, PathBuf};

    #[test]
    fn index_parse_mmc() {
        assert_eq!(
            parse_device_index(Path::new("/dev/mmcblk0p2")),
            Some((String::from("/dev/mmcblk0p"), 2))
        );
    }

    #[test]
    fn index_parse_scsi() {
        assert_eq!(
            parse_device_index(Path::new("/dev/sda1")),
            Some((String::from("/dev/sda"), 1))
        );
    }

    #[test]
    fn index_parse_no_trailing_digits() {
        assert_eq!(parse_device_index(Path::new("/dev/sda")), None);
    }

    #[test]
    fn index_parse_zero() {
        assert_eq!(
            parse_device_index(Path::new("/dev/loop0")),
            Some((String::from("/dev/loop"), 0))
        );
    }

    #[test]
    fn drive_derivation() {
        assert_eq!(
            drive_from_partition(Path::new("/dev/mmcblk0p2")).unwrap(),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(
            drive_from_partition(Path::new("/dev/sda1")).unwrap(),
            PathBuf::from("/dev/sda")
        );
        assert!(drive_from_partition(Path::new("/dev/mapper/root")).is_err());
    }
}
