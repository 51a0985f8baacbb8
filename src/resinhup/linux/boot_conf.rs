use failure::ResultExt;
use log::{debug, info};
use std::fs::{rename, write};
use std::path::Path;

use crate::{
    common::{path_append, Config, UpdErrCtx, UpdError, UpdErrorKind},
    defs::UENV_FILE_NAME,
    linux::blk_dev::parse_device_index,
};

// Commits the freshly written bank as the active root: the bootloader
// environment file on the boot partition is rewritten to point at the new
// root partition. Written next to the final name and renamed so a power
// cut never leaves a half written environment file.
pub(crate) fn configure_bootloader(
    old_root: &Path,
    new_root: &Path,
    boot_mountpoint: &Path,
    config: &Config,
) -> Result<(), UpdError> {
    info!(
        "Configuring bootloader to boot from '{}' (was '{}')",
        new_root.display(),
        old_root.display()
    );

    let root_part = if let Some((_prefix, index)) = parse_device_index(new_root) {
        index
    } else {
        return Err(UpdError::from_remark(
            UpdErrorKind::BootloaderConfigFailed,
            &format!(
                "Failed to parse partition index from '{}'",
                new_root.display()
            ),
        ));
    };

    // some boards read the environment from a differently named file
    let uenv_name = if let Some(uenv_name) = config.get_item("bootloader", "uenv_file") {
        String::from(uenv_name)
    } else {
        String::from(UENV_FILE_NAME)
    };

    let uenv_path = path_append(boot_mountpoint, &uenv_name);
    let tmp_path = path_append(boot_mountpoint, &format!(".{}.hup-tmp", uenv_name));

    let content = format!(
        "resin_root_part={}\nresin_root_device={}\n",
        root_part,
        new_root.display()
    );

    write(&tmp_path, content.as_bytes()).context(UpdErrCtx::from_remark(
        UpdErrorKind::BootloaderConfigFailed,
        &format!("Failed to write '{}'", tmp_path.display()),
    ))?;

    rename(&tmp_path, &uenv_path).context(UpdErrCtx::from_remark(
        UpdErrorKind::BootloaderConfigFailed,
        &format!(
            "Failed to rename '{}' to '{}'",
            tmp_path.display(),
            uenv_path.display()
        ),
    ))?;

    debug!(
        "configure_bootloader: '{}' now selects partition {}",
        uenv_path.display(),
        root_part
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::configure_bootloader;
    use crate::common::Config;
    use crate::defs::UENV_FILE_NAME;
    use std::fs::read_to_string;
    use std::path::Path;

    fn test_config(config_str: &str) -> Config {
        Config::from_sections(Config::from_string(config_str).unwrap())
    }

    #[test]
    fn writes_root_partition_index() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let config = test_config("General:\n  dummy: value\n");
        configure_bootloader(
            Path::new("/dev/mmcblk0p2"),
            Path::new("/dev/mmcblk0p3"),
            tmp_dir.path(),
            &config,
        )
        .unwrap();

        let content = read_to_string(tmp_dir.path().join(UENV_FILE_NAME)).unwrap();
        assert!(content.contains("resin_root_part=3"));
        assert!(content.contains("resin_root_device=/dev/mmcblk0p3"));
    }

    #[test]
    fn honors_configured_environment_file() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let config = test_config("bootloader:\n  uenv_file: uEnv.txt\n");
        configure_bootloader(
            Path::new("/dev/sda2"),
            Path::new("/dev/sda3"),
            tmp_dir.path(),
            &config,
        )
        .unwrap();

        let content = read_to_string(tmp_dir.path().join("uEnv.txt")).unwrap();
        assert!(content.contains("resin_root_part=3"));
    }

    #[test]
    fn unparseable_device_fails() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let config = test_config("General:\n  dummy: value\n");
        assert!(configure_bootloader(
            Path::new("/dev/mmcblk0p2"),
            Path::new("/dev/mapper/root"),
            tmp_dir.path(),
            &config,
        )
        .is_err());
    }
}
