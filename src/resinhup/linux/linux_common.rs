use failure::ResultExt;
use lazy_static::lazy_static;
use log::{debug, trace, warn};
use regex::Regex;
use std::fs::{copy, create_dir_all, read_dir, read_link, read_to_string, remove_file, rename};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use libc::getuid;
use nix::{
    sys::{
        stat::{lstat, stat, utimensat, UtimensatFlags},
        time::TimeSpec,
    },
    unistd::{chown, Gid, Uid},
};

use crate::{
    common::{call, file_exists, path_append, UpdErrCtx, UpdError, UpdErrorKind},
    linux::linux_defs::{
        DEVICE_TREE_MODEL_PATH, DMI_PRODUCT_NAME_PATH, FILE_CMD, OS_RELEASE_FILE, WHEREIS_CMD,
    },
};

const BIN_DIRS: &[&str] = &["/bin", "/usr/bin", "/sbin", "/usr/sbin"];

const OS_VERSION_REGEX: &str = r#"^VERSION="?([^"]+)"?$"#;

const TEXT_FTYPE_REGEX: &str = r#"\btext\b"#;

// device-tree model substrings mapped to the slugs used in update bundles
const DEVICE_SLUGS: &[(&str, &str)] = &[
    ("Raspberry Pi 3", "raspberrypi3"),
    ("Raspberry Pi 2", "raspberry-pi2"),
    ("Raspberry Pi", "raspberry-pi"),
    ("BeagleBone Black", "beaglebone-black"),
    ("BeagleBone Green", "beaglebone-green"),
];

const DMI_SLUGS: &[(&str, &str)] = &[("NUC", "intel-nuc")];

pub(crate) fn is_admin() -> Result<bool, UpdError> {
    trace!("is_admin: entered");
    Ok(unsafe { getuid() } == 0)
}

pub(crate) fn whereis(cmd: &str) -> Result<String, UpdError> {
    // try the usual suspects first
    for path in BIN_DIRS {
        let path = format!("{}/{}", &path, cmd);
        if file_exists(&path) {
            return Ok(path);
        }
    }

    // else try whereis command
    let args: [&str; 2] = ["-b", cmd];
    let cmd_res = match call(WHEREIS_CMD, &args, true) {
        Ok(cmd_res) => cmd_res,
        Err(why) => {
            return Err(UpdError::from_remark(
                UpdErrorKind::NotFound,
                &format!(
                    "whereis failed to execute for: {:?}, error: {:?}",
                    args, why
                ),
            ));
        }
    };

    if cmd_res.status.success() {
        if cmd_res.stdout.is_empty() {
            Err(UpdError::from_remark(
                UpdErrorKind::InvParam,
                &format!("whereis: no command output for {}", cmd),
            ))
        } else {
            let mut words = cmd_res.stdout.split(' ');
            if let Some(s) = words.nth(1) {
                Ok(String::from(s))
            } else {
                Err(UpdError::from_remark(
                    UpdErrorKind::NotFound,
                    &format!("whereis: command not found: '{}'", cmd),
                ))
            }
        }
    } else {
        Err(UpdError::from_remark(
            UpdErrorKind::ExecProcess,
            &format!(
                "whereis: command failed for {}: {}",
                cmd,
                cmd_res.status.code().unwrap_or(0)
            ),
        ))
    }
}

/******************************************************************
 * Text detection via file -bz, used to decide whether a colliding
 * boot file is worth a backup
 ******************************************************************/

pub(crate) fn is_text_file<P: AsRef<Path>>(file: P) -> Result<bool, UpdError> {
    let path_str = file.as_ref().to_string_lossy();
    let args: Vec<&str> = vec!["-bz", &path_str];

    let cmd_res = call(FILE_CMD, &args, true)?;
    if !cmd_res.status.success() || cmd_res.stdout.is_empty() {
        return Err(UpdError::from_remark(
            UpdErrorKind::InvParam,
            &format!("is_text_file: failed to determine type of file {}", path_str),
        ));
    }

    lazy_static! {
        static ref TEXT_FTYPE_RE: Regex = Regex::new(TEXT_FTYPE_REGEX).unwrap();
    }

    debug!("is_text_file: '{}' -> '{}'", path_str, cmd_res.stdout);
    Ok(TEXT_FTYPE_RE.is_match(&cmd_res.stdout))
}

/******************************************************************
 * Safe copy: copy to a temporary name next to the destination, carry
 * over ownership and timestamps, then rename into place. A failed copy
 * never leaves a partial file at the destination path.
 ******************************************************************/

pub(crate) fn safe_copy<P1: AsRef<Path>, P2: AsRef<Path>>(src: P1, dst: P2) -> Result<(), UpdError> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    trace!("safe_copy: '{}' -> '{}'", src.display(), dst.display());

    if let Some(parent) = dst.parent() {
        create_dir_all(parent).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("safe_copy: failed to create directory '{}'", parent.display()),
        ))?;
    }

    let tmp_dst = if let Some(file_name) = dst.file_name() {
        dst.with_file_name(format!(".{}.hup-tmp", file_name.to_string_lossy()))
    } else {
        return Err(UpdError::from_remark(
            UpdErrorKind::InvParam,
            &format!("safe_copy: invalid destination path '{}'", dst.display()),
        ));
    };

    if let Err(why) = copy_preserving(src, &tmp_dst) {
        let _res = remove_file(&tmp_dst);
        return Err(why);
    }

    rename(&tmp_dst, dst).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!(
            "safe_copy: failed to rename '{}' to '{}'",
            tmp_dst.display(),
            dst.display()
        ),
    ))?;

    Ok(())
}

fn copy_preserving(src: &Path, dst: &Path) -> Result<(), UpdError> {
    // fs::copy carries the permission bits, ownership and timestamps are
    // carried over below
    copy(src, dst).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!(
            "copy_preserving: failed to copy '{}' to '{}'",
            src.display(),
            dst.display()
        ),
    ))?;

    let src_stat = stat(src).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("copy_preserving: failed to stat '{}'", src.display()),
    ))?;

    chown(
        dst,
        Some(Uid::from_raw(src_stat.st_uid)),
        Some(Gid::from_raw(src_stat.st_gid)),
    )
    .context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("copy_preserving: failed to chown '{}'", dst.display()),
    ))?;

    utimensat(
        None,
        dst,
        &TimeSpec::new(src_stat.st_atime, src_stat.st_atime_nsec),
        &TimeSpec::new(src_stat.st_mtime, src_stat.st_mtime_nsec),
        UtimensatFlags::FollowSymlink,
    )
    .context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("copy_preserving: failed to set times on '{}'", dst.display()),
    ))?;

    Ok(())
}

// recursive variant for overlay sources that are directories
pub(crate) fn copy_tree<P1: AsRef<Path>, P2: AsRef<Path>>(src: P1, dst: P2) -> Result<(), UpdError> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    let src_meta = lstat(src).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("copy_tree: failed to stat '{}'", src.display()),
    ))?;

    if (src_meta.st_mode & libc::S_IFMT) == libc::S_IFLNK {
        let link = read_link(src).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("copy_tree: failed to read link '{}'", src.display()),
        ))?;
        if file_exists(dst) {
            let _res = remove_file(dst);
        }
        symlink(&link, dst).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("copy_tree: failed to create symlink '{}'", dst.display()),
        ))?;
        return Ok(());
    }

    if src.is_dir() {
        create_dir_all(dst).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("copy_tree: failed to create directory '{}'", dst.display()),
        ))?;
        chown(
            dst,
            Some(Uid::from_raw(src_meta.st_uid)),
            Some(Gid::from_raw(src_meta.st_gid)),
        )
        .context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("copy_tree: failed to chown '{}'", dst.display()),
        ))?;

        for entry in read_dir(src).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("copy_tree: failed to read directory '{}'", src.display()),
        ))? {
            let entry = entry.context(UpdErrCtx::from_remark(
                UpdErrorKind::Upstream,
                &format!("copy_tree: failed to read entry in '{}'", src.display()),
            ))?;
            copy_tree(entry.path(), dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        safe_copy(src, dst)
    }
}

/******************************************************************
 * Running host OS version from etc/os-release below the (bind mounted)
 * root filesystem
 ******************************************************************/

pub(crate) fn get_os_version(root_base: &Path) -> Result<Option<String>, UpdError> {
    let os_release_path = path_append(root_base, OS_RELEASE_FILE);
    if !file_exists(&os_release_path) {
        warn!(
            "Could not locate os release file '{}'",
            os_release_path.display()
        );
        return Ok(None);
    }

    let os_info = read_to_string(&os_release_path).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("Failed to read from file: '{}'", os_release_path.display()),
    ))?;

    lazy_static! {
        static ref OS_VERSION_RE: Regex = Regex::new(OS_VERSION_REGEX).unwrap();
    }

    for line in os_info.lines() {
        if let Some(captures) = OS_VERSION_RE.captures(line) {
            return Ok(Some(String::from(captures.get(1).unwrap().as_str())));
        }
    }

    Ok(None)
}

/******************************************************************
 * Board identification - map the device tree model (or the DMI product
 * name on x86) to the slug used when looking up update bundles
 ******************************************************************/

pub(crate) fn running_device() -> Result<String, UpdError> {
    if file_exists(DEVICE_TREE_MODEL_PATH) {
        let model = read_to_string(DEVICE_TREE_MODEL_PATH).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to read from file: '{}'", DEVICE_TREE_MODEL_PATH),
        ))?;
        // device-tree strings are NUL terminated
        let model = model.trim_end_matches('\u{0}');

        for (pattern, slug) in DEVICE_SLUGS {
            if model.contains(pattern) {
                debug!("running_device: '{}' -> '{}'", model, slug);
                return Ok(String::from(*slug));
            }
        }

        return Err(UpdError::from_remark(
            UpdErrorKind::NotFound,
            &format!("running_device: unknown device tree model '{}'", model),
        ));
    }

    if file_exists(DMI_PRODUCT_NAME_PATH) {
        let product = read_to_string(DMI_PRODUCT_NAME_PATH).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to read from file: '{}'", DMI_PRODUCT_NAME_PATH),
        ))?;

        for (pattern, slug) in DMI_SLUGS {
            if product.contains(pattern) {
                debug!("running_device: '{}' -> '{}'", product.trim(), slug);
                return Ok(String::from(*slug));
            }
        }
    }

    Err(UpdError::from_remark(
        UpdErrorKind::NotFound,
        "running_device: could not detect this board's name",
    ))
}

#[cfg(test)]
mod tests {
    use super::safe_copy;
    use std::fs::{read_dir, read_to_string, write};

    #[test]
    fn safe_copy_preserves_content() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let src = tmp_dir.path().join("config.json");
        let dst = tmp_dir.path().join("rootfs/etc/config.json");
        write(&src, b"{\"applicationId\": 1}").unwrap();

        safe_copy(&src, &dst).unwrap();
        assert_eq!(read_to_string(&dst).unwrap(), "{\"applicationId\": 1}");

        // no temporary leftovers next to the destination
        let leftovers: Vec<_> = read_dir(dst.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".hup-tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn safe_copy_is_idempotent() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let src = tmp_dir.path().join("authorized_keys");
        let dst = tmp_dir.path().join("new/authorized_keys");
        write(&src, b"ssh-rsa AAAA...").unwrap();

        safe_copy(&src, &dst).unwrap();
        safe_copy(&src, &dst).unwrap();
        assert_eq!(read_to_string(&dst).unwrap(), "ssh-rsa AAAA...");
    }

    #[test]
    fn safe_copy_missing_source_leaves_no_destination() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let src = tmp_dir.path().join("no-such-file");
        let dst = tmp_dir.path().join("dst");

        assert!(safe_copy(&src, &dst).is_err());
        assert!(!dst.exists());
    }
}
