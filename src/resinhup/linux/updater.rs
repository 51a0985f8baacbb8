use failure::ResultExt;
use log::{debug, error, info, warn};
use std::fmt::{self, Display, Formatter};
use std::fs::{create_dir_all, remove_file, rename};
use std::path::PathBuf;

use crate::{
    common::{dir_exists, file_exists, path_append, Config, UpdErrCtx, UpdError, UpdErrorKind},
    defs::{
        BACKUP_SUFFIX, BOOT_TEMP_MOUNT_DIR, RESIN_BOOT_LABEL, RESIN_DATA_LABEL, RESIN_ROOT_LABEL,
        RESIN_UPDT_LABEL, ROOTFS_FS_TYPE, ROOT_TEMP_MOUNT_DIR, STATE_SENTINEL_FILE,
        STATE_TEMP_MOUNT_DIR,
    },
    linux::{
        blk_dev::{parse_device_index, DeviceApi},
        boot_conf::configure_bootloader,
        fetcher::Fetcher,
        linux_common::{copy_tree, is_text_file, safe_copy},
        linux_defs::ROOT_PATH,
    },
};

// The device the new OS lands on and the label it has to carry - always
// the label the currently booted bank does not use.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TargetSelection {
    pub device: PathBuf,
    pub label: &'static str,
}

/******************************************************************
 * Partition role resolution
 *
 * Check the current root partition:
 * - if the current root label is resin-root then we search for a
 *   resin-updt device; if none is found we guess by bumping the index
 *   of the current root partition
 * - if the current root label is resin-updt the search runs the other
 *   way around and the guess decreases the index
 ******************************************************************/

pub(crate) fn resolve_update_target(
    device_api: &dyn DeviceApi,
) -> Result<TargetSelection, UpdError> {
    let current_root = device_api.get_root_partition()?;
    let current_label = device_api.get_label(&current_root)?;

    match current_label.as_ref().map(String::as_str) {
        Some(RESIN_ROOT_LABEL) => {
            if let Some(device) = device_api.get_device_for_label(RESIN_UPDT_LABEL)? {
                if device != current_root {
                    debug!("Device to be used as rootfs update: {}", device.display());
                    return Ok(TargetSelection {
                        device,
                        label: RESIN_UPDT_LABEL,
                    });
                }
            }
            if let Some((prefix, index)) = parse_device_index(&current_root) {
                if index > 0 {
                    let device = PathBuf::from(format!("{}{}", prefix, index + 1));
                    warn!(
                        "We didn't find {} but we guessed it as {}",
                        RESIN_UPDT_LABEL,
                        device.display()
                    );
                    return Ok(TargetSelection {
                        device,
                        label: RESIN_UPDT_LABEL,
                    });
                }
            }
            error!("Bad device path: '{}'", current_root.display());
            Err(UpdError::from_remark(
                UpdErrorKind::NoUpdateTarget,
                &format!(
                    "cannot derive an update device from '{}'",
                    current_root.display()
                ),
            ))
        }
        Some(RESIN_UPDT_LABEL) => {
            if let Some(device) = device_api.get_device_for_label(RESIN_ROOT_LABEL)? {
                if device != current_root {
                    debug!("Device to be used as rootfs update: {}", device.display());
                    return Ok(TargetSelection {
                        device,
                        label: RESIN_ROOT_LABEL,
                    });
                }
            }
            if let Some((prefix, index)) = parse_device_index(&current_root) {
                if index > 1 {
                    let device = PathBuf::from(format!("{}{}", prefix, index - 1));
                    warn!(
                        "We didn't find {} but we guessed it as {}",
                        RESIN_ROOT_LABEL,
                        device.display()
                    );
                    return Ok(TargetSelection {
                        device,
                        label: RESIN_ROOT_LABEL,
                    });
                }
            }
            error!("Bad device path: '{}'", current_root.display());
            Err(UpdError::from_remark(
                UpdErrorKind::NoUpdateTarget,
                &format!(
                    "cannot derive an update device from '{}'",
                    current_root.display()
                ),
            ))
        }
        other => Err(UpdError::from_remark(
            UpdErrorKind::NoUpdateTarget,
            &format!(
                "unexpected label {:?} on booted root device '{}'",
                other,
                current_root.display()
            ),
        )),
    }
}

// Old host OS releases carry no label on the booted bank. Stamp it as
// resin-root and retry the resolution exactly once.
pub(crate) fn resolve_update_target_with_relabel(
    device_api: &dyn DeviceApi,
) -> Result<TargetSelection, UpdError> {
    match resolve_update_target(device_api) {
        Ok(selection) => Ok(selection),
        Err(why) => {
            if why.kind() == UpdErrorKind::NoUpdateTarget {
                let current_root = device_api.get_root_partition()?;
                warn!(
                    "Stamping '{}' as '{}' and retrying update device detection",
                    current_root.display(),
                    RESIN_ROOT_LABEL
                );
                device_api.set_ext_label(&current_root, RESIN_ROOT_LABEL)?;
                resolve_update_target(device_api)
            } else {
                Err(why)
            }
        }
    }
}

/******************************************************************
 * Overlay rules - whitespace separated "path" or "src:dst" tokens,
 * tokens opening with # or ; are comments
 ******************************************************************/

#[derive(Debug, PartialEq)]
pub(crate) struct OverlayRule {
    pub source: String,
    pub dest: String,
}

pub(crate) fn parse_overlay_rules(rules: &str) -> Vec<OverlayRule> {
    let mut parsed: Vec<OverlayRule> = Vec::new();

    for token in rules.split_whitespace() {
        if token.is_empty() || token.starts_with('#') || token.starts_with(';') {
            continue;
        }
        let mut parts = token.splitn(2, ':');
        let source = parts.next().unwrap();
        let dest = match parts.next() {
            Some(dest) if !dest.is_empty() => dest,
            _ => source,
        };
        parsed.push(OverlayRule {
            source: String::from(source),
            dest: String::from(dest),
        });
    }

    parsed
}

/******************************************************************
 * Label reconciliation - after an install every canonical label must
 * resolve to a device
 ******************************************************************/

pub(crate) fn fix_fs_labels(device_api: &dyn DeviceApi) -> Result<(), UpdError> {
    info!("Fixing the labels of all the filesystems...");

    if device_api.get_device_for_label(RESIN_BOOT_LABEL)?.is_none() {
        let boot_device = device_api.get_boot_partition()?;
        device_api.set_vfat_label(&boot_device, RESIN_BOOT_LABEL)?;
        info!(
            "Stamped '{}' as '{}'",
            boot_device.display(),
            RESIN_BOOT_LABEL
        );
    }

    // both root bank labels are applied while the new rootfs is written;
    // their absence at this point is an integrity failure
    for label in &[RESIN_ROOT_LABEL, RESIN_UPDT_LABEL] {
        if device_api.get_device_for_label(label)?.is_none() {
            error!("No device carries the '{}' label", label);
            return Err(UpdError::from_remark(
                UpdErrorKind::MissingLabel,
                &format!("no device carries the '{}' label", label),
            ));
        }
    }

    if device_api.get_device_for_label(RESIN_DATA_LABEL)?.is_none() {
        error!(
            "Can't label the data partition. You need to do it manually on the host OS with: \
             btrfs filesystem label <device> {} .",
            RESIN_DATA_LABEL
        );
        return Err(UpdError::from_remark(
            UpdErrorKind::MissingLabel,
            &format!("no device carries the '{}' label", RESIN_DATA_LABEL),
        ));
    }

    Ok(())
}

/******************************************************************
 * The update pipeline
 ******************************************************************/

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum UpgradeStage {
    Start,
    TargetResolved,
    RootfsInstalled,
    BootUpdated,
    LabelsFixed,
    StateReset,
    Done,
}

impl Display for UpgradeStage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) struct Updater<'a> {
    fetcher: &'a mut dyn Fetcher,
    device_api: &'a dyn DeviceApi,
    config: &'a Config,
    root_temp: PathBuf,
    boot_temp: PathBuf,
    state_temp: PathBuf,
    boot_mountpoint: Option<PathBuf>,
    stage: UpgradeStage,
}

impl<'a> Updater<'a> {
    pub fn new(
        fetcher: &'a mut dyn Fetcher,
        device_api: &'a dyn DeviceApi,
        config: &'a Config,
    ) -> Result<Updater<'a>, UpdError> {
        let workspace = PathBuf::from(fetcher.workspace());

        let root_temp = path_append(&workspace, ROOT_TEMP_MOUNT_DIR);
        let boot_temp = path_append(&workspace, BOOT_TEMP_MOUNT_DIR);
        let state_temp = path_append(&workspace, STATE_TEMP_MOUNT_DIR);

        for mountpoint in &[&root_temp, &boot_temp, &state_temp] {
            create_dir_all(mountpoint).context(UpdErrCtx::from_remark(
                UpdErrorKind::Upstream,
                &format!(
                    "failed to create temporary mountpoint '{}'",
                    mountpoint.display()
                ),
            ))?;
        }

        Ok(Updater {
            fetcher,
            device_api,
            config,
            root_temp,
            boot_temp,
            state_temp,
            boot_mountpoint: None,
            stage: UpgradeStage::Start,
        })
    }

    pub fn stage(&self) -> UpgradeStage {
        self.stage
    }

    fn unpack_new_rootfs(&mut self, target: &TargetSelection) -> Result<(), UpdError> {
        info!("Started to prepare new rootfs... will take a while...");

        // the target bank must not be mounted while it is formatted
        if self.device_api.is_mounted(&target.device)? {
            self.device_api
                .umount(&target.device)
                .context(UpdErrCtx::from_remark(
                    UpdErrorKind::MountFailed,
                    &format!(
                        "failed to unmount update device '{}'",
                        target.device.display()
                    ),
                ))?;
        }

        if let Err(why) = self.device_api.format_ext3(&target.device, target.label) {
            error!(
                "Could not format {} as {}",
                target.device.display(),
                ROOTFS_FS_TYPE
            );
            return Err(why);
        }

        if dir_exists(&self.root_temp)? {
            if self.device_api.is_mounted(&self.root_temp)? {
                self.device_api
                    .umount(&self.root_temp)
                    .context(UpdErrCtx::from_remark(
                        UpdErrorKind::MountFailed,
                        &format!(
                            "failed to free temporary mountpoint '{}'",
                            self.root_temp.display()
                        ),
                    ))?;
            }
        } else {
            create_dir_all(&self.root_temp).context(UpdErrCtx::from_remark(
                UpdErrorKind::MountFailed,
                &format!(
                    "failed to create temporary mountpoint '{}'",
                    self.root_temp.display()
                ),
            ))?;
        }

        self.device_api
            .mount(&target.device, &self.root_temp, Some(ROOTFS_FS_TYPE))?;

        self.fetcher.unpack_rootfs(&self.root_temp)?;
        self.fetcher.unpack_quirks(&self.root_temp)?;

        Ok(())
    }

    fn rootfs_overlay(&mut self) -> Result<(), UpdError> {
        info!("Started rootfs overlay...");

        let root_mount = if let Some(root_mount) = self.config.get_item("General", "host_bind_mount")
        {
            PathBuf::from(root_mount)
        } else {
            PathBuf::from(ROOT_PATH)
        };

        let overlay = if let Some(overlay) = self.config.get_item("rootfs", "to_keep_files") {
            overlay
        } else {
            warn!("Nothing configured to overlay.");
            return Ok(());
        };

        for rule in parse_overlay_rules(overlay) {
            let src = path_append(&root_mount, &rule.source);
            debug!("Will overlay {}", src.display());
            if !file_exists(&src) {
                warn!(
                    "{} was not found in your current mounted rootfs. Can't overlay.",
                    src.display()
                );
                continue;
            }
            let dst = path_append(&self.root_temp, &rule.dest);
            copy_tree(&src, &dst).context(UpdErrCtx::from_remark(
                UpdErrorKind::OverlayFailed,
                &format!(
                    "failed to overlay '{}' at '{}'",
                    src.display(),
                    dst.display()
                ),
            ))?;
            debug!("Overlayed {} in {}", src.display(), dst.display());
        }

        Ok(())
    }

    fn update_rootfs(&mut self, target: &TargetSelection) -> Result<(), UpdError> {
        info!("Started to update rootfs...");
        if let Err(why) = self.unpack_new_rootfs(target) {
            error!("Could not unpack new rootfs.");
            return Err(why);
        }
        if let Err(why) = self.rootfs_overlay() {
            error!("Could not overlay new rootfs.");
            return Err(why);
        }
        Ok(())
    }

    // Boot files are only touched when an explicit whitelist exists -
    // everything errs toward not touching the boot partition.
    fn update_boot(&mut self) -> Result<(), UpdError> {
        info!("Started to upgrade boot files...");

        let ignore_files: Vec<String> =
            if let Some(list) = self.config.get_item("FingerPrintScanner", "boot_whitelist") {
                list.split_whitespace().map(String::from).collect()
            } else {
                warn!("update_boot: No files configured to be ignored.");
                return Ok(());
            };

        let bootfiles = self.fetcher.boot_files()?;
        let bootmountpoint = self.boot_rw_mountpoint()?;

        for bootfile in bootfiles {
            if ignore_files.iter().any(|name| name == &bootfile) {
                warn!("{} was ignored due to the configured whitelist.", bootfile);
                continue;
            }

            let src = path_append(self.fetcher.bootfiles_dir(), &bootfile);
            let dst = path_append(&bootmountpoint, &bootfile);

            if dst.is_file() {
                // a colliding text file may carry user edits and is kept
                // around as a backup; binary files are versioned by the
                // image and safe to replace wholesale
                if is_text_file(&src)? && is_text_file(&dst)? {
                    warn!(
                        "Text file {} already exists in the boot partition. Will backup.",
                        bootfile
                    );
                    let backup = PathBuf::from(format!("{}{}", dst.to_string_lossy(), BACKUP_SUFFIX));
                    rename(&dst, &backup).context(UpdErrCtx::from_remark(
                        UpdErrorKind::BackupFailed,
                        &format!("Can't backup {}", dst.display()),
                    ))?;
                } else {
                    warn!("Non-text file {} will be overwritten.", bootfile);
                }
            }

            safe_copy(&src, &dst).context(UpdErrCtx::from_remark(
                UpdErrorKind::BootCopyFailed,
                &format!("failed to copy '{}' to '{}'", src.display(), dst.display()),
            ))?;
            debug!("Copied {} to {}", src.display(), dst.display());
        }

        Ok(())
    }

    // make sure the boot partition is mounted read-write and hand out its
    // mountpoint
    fn boot_rw_mountpoint(&mut self) -> Result<PathBuf, UpdError> {
        if let Some(ref mountpoint) = self.boot_mountpoint {
            return Ok(mountpoint.clone());
        }

        let boot_device = self.device_api.get_boot_partition()?;
        let mountpoint = if let Some(mountpoint) = self.device_api.get_mountpoint(&boot_device)? {
            self.device_api.remount(&mountpoint, false)?;
            mountpoint
        } else {
            self.device_api
                .mount(&boot_device, &self.boot_temp, None)?;
            self.boot_temp.clone()
        };

        self.boot_mountpoint = Some(mountpoint.clone());
        Ok(mountpoint)
    }

    fn reset_persist_states(&mut self) -> Result<(), UpdError> {
        info!("reset_persist_states: generate it new on boot");

        let state_device =
            if let Some(device) = self.device_api.get_device_for_label(RESIN_DATA_LABEL)? {
                device
            } else {
                return Err(UpdError::from_remark(
                    UpdErrorKind::StateResetFailed,
                    &format!("no device carries the '{}' label", RESIN_DATA_LABEL),
                ));
            };

        if !self.device_api.is_mounted(&self.state_temp)? {
            self.device_api
                .mount(&state_device, &self.state_temp, None)
                .context(UpdErrCtx::from_remark(
                    UpdErrorKind::StateResetFailed,
                    &format!(
                        "failed to mount state partition '{}'",
                        state_device.display()
                    ),
                ))?;
        }

        // the sentinel is expected to exist; a missing one points at
        // earlier corruption and must not be ignored
        let sentinel = path_append(&self.state_temp, STATE_SENTINEL_FILE);
        if let Err(why) = remove_file(&sentinel) {
            error!("Can't reset state partition.");
            return Err(UpdError::from_remark(
                UpdErrorKind::StateResetFailed,
                &format!(
                    "failed to remove sentinel '{}', error: {:?}",
                    sentinel.display(),
                    why
                ),
            ));
        }

        Ok(())
    }

    pub fn upgrade_system(&mut self) -> Result<(), UpdError> {
        info!("Started to upgrade system.");
        match self.run_pipeline() {
            Ok(()) => {
                info!("Finished to upgrade system.");
                Ok(())
            }
            Err(why) => {
                error!("Aborting upgrade in stage {}: {}", self.stage, why);
                Err(why)
            }
        }
    }

    fn run_pipeline(&mut self) -> Result<(), UpdError> {
        self.stage = UpgradeStage::Start;

        let old_root = self.device_api.get_root_partition()?;

        let target = resolve_update_target_with_relabel(self.device_api)?;
        self.stage = UpgradeStage::TargetResolved;

        self.update_rootfs(&target)?;
        self.stage = UpgradeStage::RootfsInstalled;

        self.update_boot()?;
        self.stage = UpgradeStage::BootUpdated;

        fix_fs_labels(self.device_api)?;
        self.stage = UpgradeStage::LabelsFixed;

        self.reset_persist_states()?;
        self.stage = UpgradeStage::StateReset;

        let boot_mountpoint = self.boot_rw_mountpoint()?;
        configure_bootloader(&old_root, &target.device, &boot_mountpoint, self.config)?;
        self.stage = UpgradeStage::Done;

        Ok(())
    }

    // runs after the pipeline whatever its outcome: temporary mountpoints
    // go away and the boot partition ends up read-only again
    pub fn cleanup(&mut self) {
        info!("Cleanup updater...");

        for mountpoint in &[self.root_temp.clone(), self.state_temp.clone()] {
            match self.device_api.is_mounted(mountpoint) {
                Ok(true) => {
                    if let Err(why) = self.device_api.umount(mountpoint) {
                        warn!(
                            "cleanup: failed to unmount '{}', error: {}",
                            mountpoint.display(),
                            why
                        );
                    }
                }
                Ok(false) => (),
                Err(why) => warn!(
                    "cleanup: failed to check mount state of '{}', error: {}",
                    mountpoint.display(),
                    why
                ),
            }
        }

        match self.device_api.get_boot_partition() {
            Ok(boot_device) => match self.device_api.get_mountpoint(&boot_device) {
                Ok(Some(mountpoint)) => {
                    if let Err(why) = self.device_api.remount(&mountpoint, true) {
                        warn!(
                            "cleanup: failed to remount '{}' read-only, error: {}",
                            mountpoint.display(),
                            why
                        );
                    }
                }
                Ok(None) => (),
                Err(why) => warn!("cleanup: failed to locate boot mountpoint, error: {}", why),
            },
            Err(why) => warn!("cleanup: failed to locate boot partition, error: {}", why),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        fix_fs_labels, parse_overlay_rules, resolve_update_target,
        resolve_update_target_with_relabel, OverlayRule, Updater, UpgradeStage,
    };
    use crate::{
        common::{Config, UpdError, UpdErrorKind},
        defs::{
            RESIN_BOOT_LABEL, RESIN_DATA_LABEL, RESIN_ROOT_LABEL, RESIN_UPDT_LABEL,
            ROOT_TEMP_MOUNT_DIR, STATE_SENTINEL_FILE, STATE_TEMP_MOUNT_DIR, UENV_FILE_NAME,
        },
        linux::{blk_dev::DeviceApi, fetcher::Fetcher},
    };
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs::{create_dir_all, read_to_string, write};
    use std::path::{Path, PathBuf};

    struct FakeDeviceApi {
        root: PathBuf,
        boot_device: Option<PathBuf>,
        labels: RefCell<HashMap<PathBuf, String>>,
        // by-label links that do not agree with the filesystem labels,
        // the way a stale /dev/disk/by-label entry would not
        stale_links: RefCell<HashMap<String, PathBuf>>,
        mounts: RefCell<HashMap<PathBuf, PathBuf>>,
        remounts: RefCell<Vec<(PathBuf, bool)>>,
    }

    impl FakeDeviceApi {
        fn new(root: &str) -> FakeDeviceApi {
            FakeDeviceApi {
                root: PathBuf::from(root),
                boot_device: None,
                labels: RefCell::new(HashMap::new()),
                stale_links: RefCell::new(HashMap::new()),
                mounts: RefCell::new(HashMap::new()),
                remounts: RefCell::new(Vec::new()),
            }
        }

        fn with_boot_device(mut self, device: &str) -> FakeDeviceApi {
            self.boot_device = Some(PathBuf::from(device));
            self
        }

        fn with_label(self, device: &str, label: &str) -> FakeDeviceApi {
            self.labels
                .borrow_mut()
                .insert(PathBuf::from(device), String::from(label));
            self
        }

        fn with_stale_link(self, label: &str, device: &str) -> FakeDeviceApi {
            self.stale_links
                .borrow_mut()
                .insert(String::from(label), PathBuf::from(device));
            self
        }

        fn with_mount(self, device: &str, mountpoint: &Path) -> FakeDeviceApi {
            self.mounts
                .borrow_mut()
                .insert(PathBuf::from(device), PathBuf::from(mountpoint));
            self
        }

        fn label_of(&self, device: &str) -> Option<String> {
            self.labels.borrow().get(Path::new(device)).cloned()
        }

        fn remounted_ro(&self, mountpoint: &Path) -> bool {
            self.remounts
                .borrow()
                .iter()
                .any(|(path, readonly)| path == mountpoint && *readonly)
        }
    }

    impl DeviceApi for FakeDeviceApi {
        fn get_root_partition(&self) -> Result<PathBuf, UpdError> {
            Ok(self.root.clone())
        }

        fn get_boot_partition(&self) -> Result<PathBuf, UpdError> {
            if let Some(device) = self.get_device_for_label(RESIN_BOOT_LABEL)? {
                return Ok(device);
            }
            if let Some(ref device) = self.boot_device {
                return Ok(device.clone());
            }
            Err(UpdError::from_remark(
                UpdErrorKind::NotFound,
                "no boot partition",
            ))
        }

        fn get_device_for_label(&self, label: &str) -> Result<Option<PathBuf>, UpdError> {
            if let Some(device) = self.stale_links.borrow().get(label) {
                return Ok(Some(device.clone()));
            }
            Ok(self
                .labels
                .borrow()
                .iter()
                .find(|(_device, curr_label)| curr_label.as_str() == label)
                .map(|(device, _label)| device.clone()))
        }

        fn get_label(&self, device: &Path) -> Result<Option<String>, UpdError> {
            Ok(self.labels.borrow().get(device).cloned())
        }

        fn set_ext_label(&self, device: &Path, label: &str) -> Result<(), UpdError> {
            self.labels
                .borrow_mut()
                .insert(PathBuf::from(device), String::from(label));
            Ok(())
        }

        fn set_vfat_label(&self, device: &Path, label: &str) -> Result<(), UpdError> {
            self.set_ext_label(device, label)
        }

        fn is_mounted(&self, path: &Path) -> Result<bool, UpdError> {
            Ok(self
                .mounts
                .borrow()
                .iter()
                .any(|(device, mountpoint)| device.as_path() == path || mountpoint.as_path() == path))
        }

        fn get_mountpoint(&self, device: &Path) -> Result<Option<PathBuf>, UpdError> {
            Ok(self.mounts.borrow().get(device).cloned())
        }

        fn mount(
            &self,
            device: &Path,
            mountpoint: &Path,
            _fs_type: Option<&str>,
        ) -> Result<(), UpdError> {
            self.mounts
                .borrow_mut()
                .insert(PathBuf::from(device), PathBuf::from(mountpoint));
            Ok(())
        }

        fn remount(&self, mountpoint: &Path, readonly: bool) -> Result<(), UpdError> {
            self.remounts
                .borrow_mut()
                .push((PathBuf::from(mountpoint), readonly));
            Ok(())
        }

        fn umount(&self, path: &Path) -> Result<(), UpdError> {
            let mut mounts = self.mounts.borrow_mut();
            let device = mounts
                .iter()
                .find(|(device, mountpoint)| device.as_path() == path || mountpoint.as_path() == path)
                .map(|(device, _mountpoint)| device.clone());
            if let Some(device) = device {
                mounts.remove(&device);
                Ok(())
            } else {
                Err(UpdError::from_remark(
                    UpdErrorKind::InvState,
                    "not mounted",
                ))
            }
        }

        fn format_ext3(&self, device: &Path, label: &str) -> Result<(), UpdError> {
            self.set_ext_label(device, label)
        }

        fn get_size(&self, _device: &Path) -> Result<u64, UpdError> {
            Ok(64 * 1024 * 1024)
        }
    }

    struct FakeFetcher {
        workspace: PathBuf,
        bootfiles_dir: PathBuf,
    }

    impl FakeFetcher {
        fn new(workspace: &Path) -> FakeFetcher {
            FakeFetcher {
                workspace: PathBuf::from(workspace),
                bootfiles_dir: workspace.join("boot"),
            }
        }
    }

    impl Fetcher for FakeFetcher {
        fn workspace(&self) -> &Path {
            &self.workspace
        }

        fn bootfiles_dir(&self) -> &Path {
            &self.bootfiles_dir
        }

        fn download(&mut self) -> Result<(), UpdError> {
            Ok(())
        }

        fn unpack_rootfs(&mut self, mountpoint: &Path) -> Result<(), UpdError> {
            write(mountpoint.join("unpacked"), b"rootfs").unwrap();
            Ok(())
        }

        fn unpack_quirks(&mut self, _mountpoint: &Path) -> Result<(), UpdError> {
            Ok(())
        }

        fn boot_files(&self) -> Result<Vec<String>, UpdError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn resolves_sibling_by_label() {
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_label("/dev/mmcblk0p3", RESIN_UPDT_LABEL);

        let selection = resolve_update_target(&api).unwrap();
        assert_eq!(selection.device, PathBuf::from("/dev/mmcblk0p3"));
        assert_eq!(selection.label, RESIN_UPDT_LABEL);
    }

    #[test]
    fn guesses_next_index_without_sibling() {
        let api =
            FakeDeviceApi::new("/dev/mmcblk0p2").with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL);

        let selection = resolve_update_target(&api).unwrap();
        assert_eq!(selection.device, PathBuf::from("/dev/mmcblk0p3"));
        assert_eq!(selection.label, RESIN_UPDT_LABEL);
        assert_ne!(selection.device, PathBuf::from("/dev/mmcblk0p2"));
    }

    #[test]
    fn resolves_root_sibling_from_updt_bank() {
        let api = FakeDeviceApi::new("/dev/sda3")
            .with_label("/dev/sda3", RESIN_UPDT_LABEL)
            .with_label("/dev/sda2", RESIN_ROOT_LABEL);

        let selection = resolve_update_target(&api).unwrap();
        assert_eq!(selection.device, PathBuf::from("/dev/sda2"));
        assert_eq!(selection.label, RESIN_ROOT_LABEL);
    }

    #[test]
    fn guesses_previous_index_from_updt_bank() {
        let api = FakeDeviceApi::new("/dev/sda3").with_label("/dev/sda3", RESIN_UPDT_LABEL);

        let selection = resolve_update_target(&api).unwrap();
        assert_eq!(selection.device, PathBuf::from("/dev/sda2"));
        assert_eq!(selection.label, RESIN_ROOT_LABEL);
    }

    #[test]
    fn updt_bank_at_index_one_terminates() {
        // no resin-root device and nothing below index 1 - must fail, a
        // negative index guess is never produced
        let api = FakeDeviceApi::new("/dev/sda1").with_label("/dev/sda1", RESIN_UPDT_LABEL);

        let why = resolve_update_target(&api).unwrap_err();
        assert_eq!(why.kind(), UpdErrorKind::NoUpdateTarget);
    }

    #[test]
    fn root_bank_at_index_zero_terminates() {
        let api = FakeDeviceApi::new("/dev/loop0").with_label("/dev/loop0", RESIN_ROOT_LABEL);

        let why = resolve_update_target(&api).unwrap_err();
        assert_eq!(why.kind(), UpdErrorKind::NoUpdateTarget);
    }

    #[test]
    fn never_selects_the_booted_device() {
        // a stale by-label link pointing at the booted bank is ignored in
        // favour of the index guess
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_stale_link(RESIN_UPDT_LABEL, "/dev/mmcblk0p2");

        let selection = resolve_update_target(&api).unwrap();
        assert_ne!(selection.device, PathBuf::from("/dev/mmcblk0p2"));
        assert_eq!(selection.device, PathBuf::from("/dev/mmcblk0p3"));
    }

    #[test]
    fn unlabeled_legacy_system_is_stamped_once() {
        let api = FakeDeviceApi::new("/dev/mmcblk0p2");

        assert_eq!(
            resolve_update_target(&api).unwrap_err().kind(),
            UpdErrorKind::NoUpdateTarget
        );

        let selection = resolve_update_target_with_relabel(&api).unwrap();
        assert_eq!(api.label_of("/dev/mmcblk0p2").as_deref(), Some(RESIN_ROOT_LABEL));
        assert_eq!(selection.device, PathBuf::from("/dev/mmcblk0p3"));
    }

    #[test]
    fn overlay_rules_parse() {
        let rules = parse_overlay_rules(
            "/etc/config.json  /etc/dropbear:/etc/dropbear-new  # comment ;skipped /etc/passwd",
        );
        assert_eq!(
            rules,
            vec![
                OverlayRule {
                    source: String::from("/etc/config.json"),
                    dest: String::from("/etc/config.json"),
                },
                OverlayRule {
                    source: String::from("/etc/dropbear"),
                    dest: String::from("/etc/dropbear-new"),
                },
            ]
        );
    }

    #[test]
    fn overlay_rules_empty_input() {
        assert!(parse_overlay_rules("").is_empty());
        assert!(parse_overlay_rules("   # only a comment").is_empty());
    }

    #[test]
    fn labels_all_present() {
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_label("/dev/mmcblk0p1", RESIN_BOOT_LABEL)
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_label("/dev/mmcblk0p3", RESIN_UPDT_LABEL)
            .with_label("/dev/mmcblk0p6", RESIN_DATA_LABEL);

        assert!(fix_fs_labels(&api).is_ok());
    }

    #[test]
    fn unlabeled_boot_partition_is_stamped() {
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_boot_device("/dev/mmcblk0p1")
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_label("/dev/mmcblk0p3", RESIN_UPDT_LABEL)
            .with_label("/dev/mmcblk0p6", RESIN_DATA_LABEL);

        assert!(fix_fs_labels(&api).is_ok());
        assert_eq!(
            api.label_of("/dev/mmcblk0p1").as_deref(),
            Some(RESIN_BOOT_LABEL)
        );
    }

    #[test]
    fn missing_updt_label_is_an_integrity_failure() {
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_label("/dev/mmcblk0p1", RESIN_BOOT_LABEL)
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_label("/dev/mmcblk0p6", RESIN_DATA_LABEL);

        assert_eq!(
            fix_fs_labels(&api).unwrap_err().kind(),
            UpdErrorKind::MissingLabel
        );
    }

    #[test]
    fn missing_data_label_is_not_fixed_automatically() {
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_label("/dev/mmcblk0p1", RESIN_BOOT_LABEL)
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_label("/dev/mmcblk0p3", RESIN_UPDT_LABEL);

        assert_eq!(
            fix_fs_labels(&api).unwrap_err().kind(),
            UpdErrorKind::MissingLabel
        );
    }

    fn test_config() -> Config {
        Config::from_sections(Config::from_string("General:\n  dummy: value\n").unwrap())
    }

    #[test]
    fn upgrade_end_to_end_with_guessed_target() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let workspace = tmp_dir.path().join("workspace");
        let boot_mount = tmp_dir.path().join("boot");
        create_dir_all(&boot_mount).unwrap();

        // booted from mmcblk0p2 labeled resin-root, no resin-updt device
        // present anywhere
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_label("/dev/mmcblk0p1", RESIN_BOOT_LABEL)
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_label("/dev/mmcblk0p6", RESIN_DATA_LABEL)
            .with_mount("/dev/mmcblk0p1", &boot_mount);

        let mut fetcher = FakeFetcher::new(&workspace);
        let config = test_config();
        let mut updater = Updater::new(&mut fetcher, &api, &config).unwrap();

        // seed the sentinel where the state partition gets mounted
        let state_temp = workspace.join(STATE_TEMP_MOUNT_DIR);
        write(state_temp.join(STATE_SENTINEL_FILE), b"").unwrap();

        updater.upgrade_system().unwrap();
        assert_eq!(updater.stage(), UpgradeStage::Done);

        // the guessed bank carries the update label now
        assert_eq!(
            api.label_of("/dev/mmcblk0p3").as_deref(),
            Some(RESIN_UPDT_LABEL)
        );

        // all four canonical labels resolve to distinct devices
        let mut devices: Vec<PathBuf> = Vec::new();
        for label in &[
            RESIN_BOOT_LABEL,
            RESIN_ROOT_LABEL,
            RESIN_UPDT_LABEL,
            RESIN_DATA_LABEL,
        ] {
            devices.push(api.get_device_for_label(label).unwrap().unwrap());
        }
        devices.sort();
        devices.dedup();
        assert_eq!(devices.len(), 4);

        // the sentinel is gone and the bootloader points at the new bank
        assert!(!state_temp.join(STATE_SENTINEL_FILE).exists());
        let uenv = read_to_string(boot_mount.join(UENV_FILE_NAME)).unwrap();
        assert!(uenv.contains("resin_root_part=3"));

        // cleanup leaves no temporary mounts behind and the boot
        // partition read-only
        updater.cleanup();
        assert!(!api
            .is_mounted(&workspace.join(ROOT_TEMP_MOUNT_DIR))
            .unwrap());
        assert!(!api.is_mounted(&state_temp).unwrap());
        assert!(api.remounted_ro(&boot_mount));
    }

    #[test]
    fn cleanup_runs_after_aborted_upgrade() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let workspace = tmp_dir.path().join("workspace");
        let boot_mount = tmp_dir.path().join("boot");
        create_dir_all(&boot_mount).unwrap();

        // no resin-data device: the pipeline aborts at label
        // reconciliation, after the rootfs bank was written
        let api = FakeDeviceApi::new("/dev/mmcblk0p2")
            .with_label("/dev/mmcblk0p1", RESIN_BOOT_LABEL)
            .with_label("/dev/mmcblk0p2", RESIN_ROOT_LABEL)
            .with_mount("/dev/mmcblk0p1", &boot_mount);

        let mut fetcher = FakeFetcher::new(&workspace);
        let config = test_config();
        let mut updater = Updater::new(&mut fetcher, &api, &config).unwrap();

        let why = updater.upgrade_system().unwrap_err();
        assert_eq!(why.kind(), UpdErrorKind::MissingLabel);
        assert_eq!(updater.stage(), UpgradeStage::BootUpdated);

        updater.cleanup();
        assert!(!api
            .is_mounted(&workspace.join(ROOT_TEMP_MOUNT_DIR))
            .unwrap());
        assert!(api.remounted_ro(&boot_mount));
    }
}
