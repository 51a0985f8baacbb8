use failure::ResultExt;
use log::{debug, error, info, warn};
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use tar::Archive;

use crate::common::{call, path_append, UpdErrCtx, UpdError, UpdErrorKind};
use crate::linux::fetcher::{clean_workspace, list_boot_files, Fetcher};
use crate::linux::linux_defs::DOCKER_CMD;

const CONTAINER_NAME: &str = "resinhup";
const EXPORT_FILE: &str = "update.tar";
const BOOTFILES_DIR: &str = "bootfiles";

// entries below this path in the exported filesystem are the boot files
const BOOT_ENTRY_PREFIX: &str = "boot";
// entries below this path are device specific extras
const QUIRKS_ENTRY_PREFIX: &str = "quirks";

// The ways exporting an image through the docker daemon is expected to
// fail. Anything else surfaces as a plain command error.
#[derive(Debug)]
pub(crate) enum DockerFetchError {
    ConnectFailed,
    PullFailed,
    ExportFailed,
}

// Pulls <remote>:<version> and exports the container filesystem as a tar
// archive - the exported tree is the new root filesystem.
pub(crate) struct DockerFetcher {
    workspace: PathBuf,
    bootfiles_dir: PathBuf,
    remotefile: String,
}

impl DockerFetcher {
    pub fn new(workspace: &Path, remote: &str, version: &str) -> Result<DockerFetcher, UpdError> {
        Ok(DockerFetcher {
            workspace: PathBuf::from(workspace),
            bootfiles_dir: path_append(workspace, BOOTFILES_DIR),
            remotefile: format!("{}:{}", remote, version),
        })
    }

    fn export_path(&self) -> PathBuf {
        path_append(&self.workspace, EXPORT_FILE)
    }

    fn export_image(&self) -> Result<PathBuf, DockerFetchError> {
        // is the docker daemon reachable at all?
        match call(DOCKER_CMD, &["version"], true) {
            Ok(cmd_res) => {
                if !cmd_res.status.success() {
                    warn!("Can't connect to docker daemon.");
                    return Err(DockerFetchError::ConnectFailed);
                }
            }
            Err(_why) => {
                warn!("Can't connect to docker daemon.");
                return Err(DockerFetchError::ConnectFailed);
            }
        }

        info!("Docker image pull started... this can take a couple of minutes...");
        debug!("Pulling {} ...", self.remotefile);
        match call(DOCKER_CMD, &["pull", &self.remotefile], true) {
            Ok(cmd_res) => {
                if !cmd_res.status.success() {
                    error!("Can't pull update image: {}", cmd_res.stderr);
                    return Err(DockerFetchError::PullFailed);
                }
            }
            Err(_why) => return Err(DockerFetchError::PullFailed),
        }

        // make sure no stale update container is left over
        if let Ok(cmd_res) = call(DOCKER_CMD, &["rm", "-f", CONTAINER_NAME], true) {
            if cmd_res.status.success() {
                debug!("Removed stale '{}' container", CONTAINER_NAME);
            }
        }

        match call(
            DOCKER_CMD,
            &[
                "create",
                "--name",
                CONTAINER_NAME,
                &self.remotefile,
                "/bin/bash",
            ],
            true,
        ) {
            Ok(cmd_res) => {
                if !cmd_res.status.success() {
                    error!("Can't create temporary update container: {}", cmd_res.stderr);
                    return Err(DockerFetchError::ExportFailed);
                }
            }
            Err(_why) => return Err(DockerFetchError::ExportFailed),
        }

        let export_path = self.export_path();
        let export_str = export_path.to_string_lossy();
        match call(
            DOCKER_CMD,
            &["export", "-o", &export_str, CONTAINER_NAME],
            true,
        ) {
            Ok(cmd_res) => {
                if !cmd_res.status.success() {
                    error!("Can't export tar archive update file: {}", cmd_res.stderr);
                    return Err(DockerFetchError::ExportFailed);
                }
            }
            Err(_why) => return Err(DockerFetchError::ExportFailed),
        }

        let _res = call(DOCKER_CMD, &["rm", "-f", CONTAINER_NAME], true);

        Ok(export_path)
    }

    fn extract_boot_files(&self) -> Result<(), UpdError> {
        let export_path = self.export_path();
        let export_file = File::open(&export_path).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to open '{}'", export_path.display()),
        ))?;

        create_dir_all(&self.bootfiles_dir).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to create '{}'", self.bootfiles_dir.display()),
        ))?;

        let mut archive = Archive::new(export_file);
        for entry in archive.entries().context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to read '{}'", export_path.display()),
        ))? {
            let mut entry = entry.context(UpdErrCtx::from_remark(
                UpdErrorKind::Upstream,
                &format!("Failed to read entry in '{}'", export_path.display()),
            ))?;

            let entry_path = PathBuf::from(&*entry.path().context(UpdErrCtx::from_remark(
                UpdErrorKind::Upstream,
                "Failed to read entry path",
            ))?);

            if let Ok(rel_path) = entry_path.strip_prefix(BOOT_ENTRY_PREFIX) {
                if rel_path.components().count() != 1 {
                    continue;
                }
                let dst = self.bootfiles_dir.join(rel_path);
                debug!("extract_boot_files: '{}'", dst.display());
                entry.unpack(&dst).context(UpdErrCtx::from_remark(
                    UpdErrorKind::Upstream,
                    &format!("Failed to unpack boot file '{}'", dst.display()),
                ))?;
            }
        }

        Ok(())
    }
}

impl Fetcher for DockerFetcher {
    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn bootfiles_dir(&self) -> &Path {
        &self.bootfiles_dir
    }

    fn download(&mut self) -> Result<(), UpdError> {
        clean_workspace(&self.workspace)?;

        match self.export_image() {
            Ok(export_path) => {
                debug!("download: exported image to '{}'", export_path.display());
                self.extract_boot_files()?;
                Ok(())
            }
            Err(why) => Err(UpdError::from_remark(
                UpdErrorKind::Upstream,
                &format!("Failed to fetch update image: {:?}", why),
            )),
        }
    }

    fn unpack_rootfs(&mut self, mountpoint: &Path) -> Result<(), UpdError> {
        info!("Unpacking new root filesystem... will take a while...");

        let export_path = self.export_path();
        let export_file = File::open(&export_path).context(UpdErrCtx::from_remark(
            UpdErrorKind::UnpackFailed,
            &format!("Failed to open '{}'", export_path.display()),
        ))?;

        let mut archive = Archive::new(export_file);
        archive.set_preserve_permissions(true);
        archive.set_preserve_ownerships(true);
        archive.unpack(mountpoint).context(UpdErrCtx::from_remark(
            UpdErrorKind::UnpackFailed,
            &format!(
                "Failed to unpack '{}' to '{}'",
                export_path.display(),
                mountpoint.display()
            ),
        ))?;

        Ok(())
    }

    fn unpack_quirks(&mut self, mountpoint: &Path) -> Result<(), UpdError> {
        let export_path = self.export_path();
        let export_file = File::open(&export_path).context(UpdErrCtx::from_remark(
            UpdErrorKind::UnpackFailed,
            &format!("Failed to open '{}'", export_path.display()),
        ))?;

        let mut unpacked = 0;
        let mut archive = Archive::new(export_file);
        archive.set_preserve_permissions(true);
        archive.set_preserve_ownerships(true);
        for entry in archive.entries().context(UpdErrCtx::from_remark(
            UpdErrorKind::UnpackFailed,
            &format!("Failed to read '{}'", export_path.display()),
        ))? {
            let mut entry = entry.context(UpdErrCtx::from_remark(
                UpdErrorKind::UnpackFailed,
                &format!("Failed to read entry in '{}'", export_path.display()),
            ))?;

            let entry_path = PathBuf::from(&*entry.path().context(UpdErrCtx::from_remark(
                UpdErrorKind::UnpackFailed,
                "Failed to read entry path",
            ))?);

            if let Ok(rel_path) = entry_path.strip_prefix(QUIRKS_ENTRY_PREFIX) {
                if rel_path.as_os_str().is_empty() {
                    continue;
                }
                let dst = mountpoint.join(rel_path);
                entry.unpack(&dst).context(UpdErrCtx::from_remark(
                    UpdErrorKind::UnpackFailed,
                    &format!("Failed to unpack quirk '{}'", dst.display()),
                ))?;
                unpacked += 1;
            }
        }

        if unpacked > 0 {
            info!("Unpacked {} quirk files", unpacked);
        } else {
            debug!("unpack_quirks: no quirks shipped with this image");
        }

        Ok(())
    }

    fn boot_files(&self) -> Result<Vec<String>, UpdError> {
        list_boot_files(&self.bootfiles_dir)
    }
}
