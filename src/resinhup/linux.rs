use log::{debug, error, info, warn};
use semver::Version;
use std::path::{Path, PathBuf};

pub(crate) mod linux_defs;

pub(crate) mod linux_common;

pub(crate) mod blk_dev;

pub(crate) mod fetcher;

pub(crate) mod fingerprint;

pub(crate) mod kernel_mods;

pub(crate) mod repart;

pub(crate) mod boot_conf;

pub(crate) mod updater;

use crate::{
    common::{retry::retry_with_backoff, Config, UpdError},
    defs::{BOOT_PART_MIN_MIB, FETCH_ATTEMPTS, FETCH_BACKOFF_SECS, RESIN_BOOT_LABEL},
    linux::{
        blk_dev::{DeviceApi, LinuxDeviceApi},
        linux_common::{get_os_version, is_admin, running_device, whereis},
        linux_defs::{
            E2LABEL_CMD, FATLABEL_CMD, FILE_CMD, FINDMNT_CMD, LSBLK_CMD, MKFS_EXT3_CMD, ROOT_PATH,
        },
        updater::Updater,
    },
};

// block device tooling the update pipeline shells out to
const REQUIRED_CMDS: &[&str] = &[
    FINDMNT_CMD,
    LSBLK_CMD,
    FILE_CMD,
    MKFS_EXT3_CMD,
    E2LABEL_CMD,
    FATLABEL_CMD,
];

pub(crate) fn upgrade() -> Result<(), UpdError> {
    let config = Config::new()?;

    if !is_admin()? {
        error!("Updater not ran as root.");
        return Err(UpdError::displayed());
    }

    debug!("Using configuration file {}", config.get_path().display());

    // fail early when the tooling the pipeline relies on is missing
    for cmd in REQUIRED_CMDS {
        if let Err(why) = whereis(*cmd) {
            error!("Cannot find required command '{}': {}", cmd, why);
            return Err(UpdError::displayed());
        }
    }

    // make sure a target version was provided
    let version = if let Some(ref version) = config.version {
        info!("Update version {} selected.", version);
        String::from(version.as_str())
    } else {
        error!("HostOS version to update to was not provided. Check help.");
        return Err(UpdError::displayed());
    };

    let root_base = if let Some(root_base) = config.get_item("General", "host_bind_mount") {
        PathBuf::from(root_base)
    } else {
        PathBuf::from(ROOT_PATH)
    };

    check_downgrade(&config, &root_base, &version)?;

    // board identification
    let device = if let Some(ref device) = config.device {
        String::from(device.as_str())
    } else {
        match running_device() {
            Ok(device) => device,
            Err(why) => {
                error!("Could not detect this board's name: {}", why);
                return Err(UpdError::displayed());
            }
        }
    };

    // device supported?
    let supported = if let Some(supported) = config.get_item("General", "supported_machines") {
        supported
            .split_whitespace()
            .map(String::from)
            .collect::<Vec<String>>()
    } else {
        error!("Can't detect supported hardware");
        return Err(UpdError::displayed());
    };
    if !supported.iter().any(|machine| machine == &device) {
        error!("{} is not a supported device for resinhup.", device);
        return Err(UpdError::displayed());
    }
    debug!("{} is a supported device for resinhup.", device);

    // check for kernel custom modules
    let custom_modules = kernel_mods::custom_loaded_modules()?;
    if !custom_modules.is_empty() {
        error!(
            "Custom loaded kernel modules detected: {}",
            custom_modules.join(", ")
        );
        return Err(UpdError::displayed());
    }
    info!("No custom loaded kernel modules detected.");

    let device_api = LinuxDeviceApi::new(&root_base);

    check_fingerprints(&config, &device_api)?;

    // handle old boot partitions
    if let Err(why) = repart::ensure_boot_partition_size(&device_api, BOOT_PART_MIN_MIB) {
        error!(
            "Failed to increase {} to {}MiB: {}",
            RESIN_BOOT_LABEL, BOOT_PART_MIN_MIB, why
        );
        return Err(UpdError::displayed());
    }

    // get the new update - bounded retries with a randomized pause so a
    // fleet of devices does not hammer the remote in lockstep
    let mut fetcher = fetcher::from_config(&config, &device, &version)?;
    if let Err(why) = retry_with_backoff(FETCH_ATTEMPTS, FETCH_BACKOFF_SECS, |_attempt| {
        fetcher.download()
    }) {
        error!("Could not unpack update, exiting");
        return Err(why);
    }

    // perform the update
    let mut updater = Updater::new(fetcher.as_mut(), &device_api, &config)?;
    let result = updater.upgrade_system();
    updater.cleanup();

    if let Err(why) = result {
        error!("Could not upgrade your system");
        return Err(why);
    }

    Ok(())
}

// refuse to move backwards in time unless explicitly allowed
fn check_downgrade(config: &Config, root_base: &Path, version: &str) -> Result<(), UpdError> {
    let target_version = match Version::parse(version.trim_start_matches('v')) {
        Ok(target_version) => target_version,
        Err(why) => {
            warn!(
                "Could not parse target version '{}' ({}), skipping downgrade check",
                version, why
            );
            return Ok(());
        }
    };

    let current = match get_os_version(root_base)? {
        Some(current) => current,
        None => {
            warn!("Could not read the running host OS version, skipping downgrade check");
            return Ok(());
        }
    };

    let current_version = match Version::parse(current.trim_start_matches('v')) {
        Ok(current_version) => current_version,
        Err(why) => {
            warn!(
                "Could not parse the running host OS version '{}' ({}), skipping downgrade check",
                current, why
            );
            return Ok(());
        }
    };

    if target_version < current_version {
        if config.allow_downgrades {
            warn!(
                "Downgrading from {} to {} as requested.",
                current_version, target_version
            );
        } else {
            error!(
                "Downgrading from {} to {} is not allowed. Check help for --allow-downgrades.",
                current_version, target_version
            );
            return Err(UpdError::displayed());
        }
    }

    Ok(())
}

// hand-edited boot files stop an update unless it is forced
fn check_fingerprints(config: &Config, device_api: &dyn DeviceApi) -> Result<(), UpdError> {
    if config.force {
        warn!("Forced update, skipping the fingerprint scan.");
        return Ok(());
    }

    let boot_device = match device_api.get_boot_partition() {
        Ok(boot_device) => boot_device,
        Err(why) => {
            warn!(
                "Could not locate the boot partition ({}), skipping the fingerprint scan",
                why
            );
            return Ok(());
        }
    };

    let boot_mountpoint = match device_api.get_mountpoint(&boot_device)? {
        Some(boot_mountpoint) => boot_mountpoint,
        None => {
            warn!("The boot partition is not mounted, skipping the fingerprint scan");
            return Ok(());
        }
    };

    let modified = fingerprint::scan_boot_partition(config, &boot_mountpoint)?;
    if !modified.is_empty() {
        for path in &modified {
            error!("Modified boot file: {}", path.display());
        }
        error!("Some boot files were modified on this device. Rerun with --force to update anyway.");
        return Err(UpdError::displayed());
    }

    Ok(())
}
