use failure::ResultExt;
use log::{debug, info, warn};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use crate::{
    common::{file_digest::md5_digest, file_exists, path_append, Config, UpdErrCtx, UpdError,
             UpdErrorKind},
    defs::FINGERPRINT_FILE_NAME,
};

// Compares the boot partition against the md5 manifest shipped with the
// running OS. Files a user has hand-edited show up here and are only
// overwritten when the update is forced.
pub(crate) fn scan_boot_partition(
    config: &Config,
    boot_mountpoint: &Path,
) -> Result<Vec<PathBuf>, UpdError> {
    let manifest_path = path_append(boot_mountpoint, FINGERPRINT_FILE_NAME);
    if !file_exists(&manifest_path) {
        info!(
            "No fingerprint manifest at '{}', nothing to check",
            manifest_path.display()
        );
        return Ok(Vec::new());
    }

    let manifest = read_to_string(&manifest_path).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("Failed to read from file: '{}'", manifest_path.display()),
    ))?;

    let whitelist: Vec<&str> =
        if let Some(whitelist) = config.get_item("FingerPrintScanner", "boot_whitelist") {
            whitelist.split_whitespace().collect()
        } else {
            Vec::new()
        };

    let mut modified: Vec<PathBuf> = Vec::new();

    for (digest, rel_path) in parse_manifest(&manifest) {
        if whitelist.contains(&rel_path.as_str()) {
            debug!("scan_boot_partition: '{}' is whitelisted", rel_path);
            continue;
        }

        let full_path = path_append(boot_mountpoint, &rel_path);
        if !file_exists(&full_path) {
            warn!(
                "Fingerprinted file '{}' is missing from the boot partition",
                rel_path
            );
            modified.push(PathBuf::from(&rel_path));
            continue;
        }

        let computed = md5_digest(&full_path)?;
        if computed != digest {
            warn!("'{}' differs from the shipped version", rel_path);
            modified.push(PathBuf::from(&rel_path));
        }
    }

    Ok(modified)
}

// manifest lines are "<md5>  <path>", the format md5sum emits
fn parse_manifest(manifest: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for line in manifest.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(2, char::is_whitespace);
        if let Some(digest) = fields.next() {
            if let Some(path) = fields.next() {
                entries.push((String::from(digest), String::from(path.trim())));
            }
        }
    }

    entries
}
