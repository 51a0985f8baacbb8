use failure::ResultExt;
use flate2::read::GzDecoder;
use log::{debug, info};
use reqwest::blocking::Client;
use std::fs::{create_dir_all, File};
use std::io;
use std::path::{Path, PathBuf};
use tar::Archive;
use url::Url;

use crate::common::{file_exists, path_append, UpdErrCtx, UpdError, UpdErrorKind};
use crate::linux::fetcher::{clean_workspace, list_boot_files, Fetcher};

const UPDATE_DIR: &str = "update";
const BUNDLE_FILE: &str = "update.tar.gz";
const ROOTFS_ARCHIVE: &str = "rootfs.tar.gz";
const QUIRKS_ARCHIVE: &str = "quirks.tar.gz";
const BOOTFILES_DIR: &str = "boot";

// Fetches update bundles of the form
// <remote>/<machine>/resinhup-<version>.tar.gz containing the rootfs and
// quirks archives plus a directory of boot files.
pub(crate) struct TarFetcher {
    workspace: PathBuf,
    bootfiles_dir: PathBuf,
    remote_url: Url,
}

impl TarFetcher {
    pub fn new(
        workspace: &Path,
        remote: &str,
        machine: &str,
        version: &str,
    ) -> Result<TarFetcher, UpdError> {
        let remote_url = Url::parse(&format!(
            "{}/{}/resinhup-{}.tar.gz",
            remote.trim_end_matches('/'),
            machine,
            version
        ))
        .context(UpdErrCtx::from_remark(
            UpdErrorKind::InvParam,
            &format!("Failed to parse remote location '{}'", remote),
        ))?;

        Ok(TarFetcher {
            workspace: PathBuf::from(workspace),
            bootfiles_dir: path_append(path_append(workspace, UPDATE_DIR), BOOTFILES_DIR),
            remote_url,
        })
    }

    fn unpack_archive(&self, archive_name: &str, mountpoint: &Path) -> Result<(), UpdError> {
        let archive_path = path_append(path_append(&self.workspace, UPDATE_DIR), archive_name);
        let archive_file = File::open(&archive_path).context(UpdErrCtx::from_remark(
            UpdErrorKind::UnpackFailed,
            &format!("Failed to open archive '{}'", archive_path.display()),
        ))?;

        let mut archive = Archive::new(GzDecoder::new(archive_file));
        archive.set_preserve_permissions(true);
        archive.set_preserve_ownerships(true);
        archive.unpack(mountpoint).context(UpdErrCtx::from_remark(
            UpdErrorKind::UnpackFailed,
            &format!(
                "Failed to unpack '{}' to '{}'",
                archive_path.display(),
                mountpoint.display()
            ),
        ))?;

        Ok(())
    }
}

impl Fetcher for TarFetcher {
    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn bootfiles_dir(&self) -> &Path {
        &self.bootfiles_dir
    }

    fn download(&mut self) -> Result<(), UpdError> {
        clean_workspace(&self.workspace)?;

        info!("Downloading update bundle from '{}'", self.remote_url);

        let client = Client::builder().build().context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            "Failed to create https client",
        ))?;

        let mut response = client
            .get(self.remote_url.as_str())
            .send()
            .context(UpdErrCtx::from_remark(
                UpdErrorKind::Upstream,
                &format!("Failed to request '{}'", self.remote_url),
            ))?;

        if !response.status().is_success() {
            return Err(UpdError::from_remark(
                UpdErrorKind::Upstream,
                &format!(
                    "Request for '{}' failed with status {}",
                    self.remote_url,
                    response.status()
                ),
            ));
        }

        let bundle_path = path_append(&self.workspace, BUNDLE_FILE);
        let mut bundle_file = File::create(&bundle_path).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to create '{}'", bundle_path.display()),
        ))?;

        let written =
            io::copy(&mut response, &mut bundle_file).context(UpdErrCtx::from_remark(
                UpdErrorKind::Upstream,
                &format!("Failed to write '{}'", bundle_path.display()),
            ))?;
        debug!(
            "download: wrote {} bytes to '{}'",
            written,
            bundle_path.display()
        );

        let update_dir = path_append(&self.workspace, UPDATE_DIR);
        create_dir_all(&update_dir).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to create '{}'", update_dir.display()),
        ))?;

        let bundle_file = File::open(&bundle_path).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to open '{}'", bundle_path.display()),
        ))?;
        let mut archive = Archive::new(GzDecoder::new(bundle_file));
        archive.unpack(&update_dir).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to unpack bundle to '{}'", update_dir.display()),
        ))?;

        Ok(())
    }

    fn unpack_rootfs(&mut self, mountpoint: &Path) -> Result<(), UpdError> {
        info!("Unpacking new root filesystem... will take a while...");
        self.unpack_archive(ROOTFS_ARCHIVE, mountpoint)
    }

    fn unpack_quirks(&mut self, mountpoint: &Path) -> Result<(), UpdError> {
        let quirks_path = path_append(path_append(&self.workspace, UPDATE_DIR), QUIRKS_ARCHIVE);
        if !file_exists(&quirks_path) {
            debug!("unpack_quirks: no quirks shipped with this bundle");
            return Ok(());
        }
        info!("Unpacking quirks...");
        self.unpack_archive(QUIRKS_ARCHIVE, mountpoint)
    }

    fn boot_files(&self) -> Result<Vec<String>, UpdError> {
        list_boot_files(&self.bootfiles_dir)
    }
}
