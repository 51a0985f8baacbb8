use failure::ResultExt;
use log::{debug, info, warn};
use std::fs::{create_dir_all, read_dir, remove_dir_all, remove_file};
use std::path::{Path, PathBuf};

use crate::common::{dir_exists, file_exists, Config, UpdErrCtx, UpdError, UpdErrorKind};
use crate::defs::DEFAULT_WORKSPACE;

pub(crate) mod tar_fetcher;
pub(crate) use tar_fetcher::TarFetcher;

pub(crate) mod docker_fetcher;
pub(crate) use docker_fetcher::DockerFetcher;

// registries searched for update bundles when no remote is configured
const DEFAULT_REMOTE: &str = "resin/resinos";
const DEFAULT_STAGING_REMOTE: &str = "resin/resinos-staging";

// The contract the update pipeline consumes: a workspace populated by
// download(), rootfs/quirks unpack operations targeting a mountpoint, and
// the list of boot files together with the directory they live in.
pub(crate) trait Fetcher {
    fn workspace(&self) -> &Path;
    fn bootfiles_dir(&self) -> &Path;
    // download the update bundle and unpack it into the workspace; must
    // be safe to call again after a failed attempt
    fn download(&mut self) -> Result<(), UpdError>;
    fn unpack_rootfs(&mut self, mountpoint: &Path) -> Result<(), UpdError>;
    fn unpack_quirks(&mut self, mountpoint: &Path) -> Result<(), UpdError>;
    fn boot_files(&self) -> Result<Vec<String>, UpdError>;
}

pub(crate) fn from_config(
    config: &Config,
    machine: &str,
    version: &str,
) -> Result<Box<dyn Fetcher>, UpdError> {
    let workspace = if let Some(workspace) = config.get_item("fetcher", "workspace") {
        PathBuf::from(workspace)
    } else {
        PathBuf::from(DEFAULT_WORKSPACE)
    };

    let remote = if let Some(ref remote) = config.remote {
        String::from(remote.as_str())
    } else if let Some(remote) = config.get_item("fetcher", "remote") {
        String::from(remote)
    } else if config.staging {
        String::from(DEFAULT_STAGING_REMOTE)
    } else {
        String::from(DEFAULT_REMOTE)
    };

    let fetcher_type = if let Some(fetcher_type) = config.get_item("fetcher", "type") {
        String::from(fetcher_type)
    } else {
        String::from("dockerhub")
    };

    info!(
        "Using {} fetcher with remote '{}' in workspace '{}'",
        fetcher_type,
        remote,
        workspace.display()
    );

    match fetcher_type.as_str() {
        "dockerhub" => Ok(Box::new(DockerFetcher::new(&workspace, &remote, version)?)),
        "tar" => Ok(Box::new(TarFetcher::new(
            &workspace, &remote, machine, version,
        )?)),
        _ => Err(UpdError::from_remark(
            UpdErrorKind::InvParam,
            &format!("Invalid fetcher type: '{}'", fetcher_type),
        )),
    }
}

// wipe everything below the workspace except the temporary mountpoints,
// so a retried download starts from a known state
pub(crate) fn clean_workspace(workspace: &Path) -> Result<(), UpdError> {
    if !dir_exists(workspace)? {
        create_dir_all(workspace).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!(
                "clean_workspace: failed to create workspace '{}'",
                workspace.display()
            ),
        ))?;
        return Ok(());
    }

    for entry in read_dir(workspace).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!(
            "clean_workspace: failed to read workspace '{}'",
            workspace.display()
        ),
    ))? {
        let entry = entry.context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!(
                "clean_workspace: failed to read entry in '{}'",
                workspace.display()
            ),
        ))?;

        let name = entry.file_name();
        if name.to_string_lossy().ends_with("-tempmountpoint") {
            continue;
        }

        let path = entry.path();
        debug!("clean_workspace: removing '{}'", path.display());
        let res = if path.is_dir() {
            remove_dir_all(&path)
        } else {
            remove_file(&path)
        };
        if let Err(why) = res {
            warn!(
                "clean_workspace: failed to remove '{}', error: {:?}",
                path.display(),
                why
            );
        }
    }

    Ok(())
}

// ordered list of file names below the boot files directory
pub(crate) fn list_boot_files(bootfiles_dir: &Path) -> Result<Vec<String>, UpdError> {
    if !file_exists(bootfiles_dir) {
        return Err(UpdError::from_remark(
            UpdErrorKind::NotFound,
            &format!(
                "list_boot_files: no boot files directory at '{}'",
                bootfiles_dir.display()
            ),
        ));
    }

    let mut names: Vec<String> = Vec::new();
    for entry in read_dir(bootfiles_dir).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!(
            "list_boot_files: failed to read '{}'",
            bootfiles_dir.display()
        ),
    ))? {
        let entry = entry.context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!(
                "list_boot_files: failed to read entry in '{}'",
                bootfiles_dir.display()
            ),
        ))?;
        if entry.path().is_file() {
            names.push(String::from(&*entry.file_name().to_string_lossy()));
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::list_boot_files;
    use std::fs::{create_dir, write};

    #[test]
    fn boot_files_are_ordered() {
        let tmp_dir = tempfile::tempdir().unwrap();
        write(tmp_dir.path().join("zImage"), b"k").unwrap();
        write(tmp_dir.path().join("config.txt"), b"c").unwrap();
        write(tmp_dir.path().join("cmdline.txt"), b"c").unwrap();
        create_dir(tmp_dir.path().join("overlays")).unwrap();

        let names = list_boot_files(tmp_dir.path()).unwrap();
        assert_eq!(names, vec!["cmdline.txt", "config.txt", "zImage"]);
    }

    #[test]
    fn boot_files_missing_dir() {
        let tmp_dir = tempfile::tempdir().unwrap();
        assert!(list_boot_files(&tmp_dir.path().join("boot")).is_err());
    }
}
