//! Staged install against the device.
//!
//! The patched archive is pushed and size-checked on the device before the
//! installed package is touched, so a failed transfer leaves the device as
//! it was.

use std::path::Path;

use qpatch_adb::{AdbError, Device, DeviceLink, DEFAULT_FILE_MODE};
use tracing::{debug, info, warn};

use crate::error::PatcherError;

/// An archive pushed to the device's staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArchive {
    pub remote_path: String,
    pub size: u64,
}

/// Performs install steps for one package on one device.
pub struct DeviceInstaller<'a, L: DeviceLink + ?Sized> {
    link: &'a L,
    device: &'a Device,
    package: &'a str,
    staging_dir: &'a str,
}

impl<'a, L: DeviceLink + ?Sized> DeviceInstaller<'a, L> {
    pub fn new(link: &'a L, device: &'a Device, package: &'a str, staging_dir: &'a str) -> Self {
        Self {
            link,
            device,
            package,
            staging_dir,
        }
    }

    /// Push `archive` to the staging directory and confirm its size.
    pub async fn stage(&self, archive: &Path, name: &str) -> Result<StagedArchive, PatcherError> {
        let remote_path = format!("{}/{}", self.staging_dir.trim_end_matches('/'), name);
        let size = self.push_verified(archive, &remote_path).await?;
        info!(serial = %self.device.serial, remote = %remote_path, size, "Staged archive");
        Ok(StagedArchive { remote_path, size })
    }

    pub async fn is_installed(&self) -> Result<bool, PatcherError> {
        Ok(self
            .link
            .package_version(self.device, self.package)
            .await?
            .is_some())
    }

    /// Uninstall the package if it is installed. Returns whether it was.
    pub async fn uninstall_existing(&self) -> Result<bool, PatcherError> {
        if !self.is_installed().await? {
            info!(package = self.package, "Package not installed, skipping uninstall");
            return Ok(false);
        }
        self.link.uninstall(self.device, self.package).await?;
        info!(package = self.package, serial = %self.device.serial, "Uninstalled package");
        Ok(true)
    }

    pub async fn install_staged(&self, staged: &StagedArchive) -> Result<(), PatcherError> {
        self.link
            .install_remote(self.device, &staged.remote_path)
            .await?;
        info!(package = self.package, remote = %staged.remote_path, "Installed patched archive");
        Ok(())
    }

    /// Reinstall the original archive from the host.
    pub async fn restore(&self, original: &Path) -> Result<(), PatcherError> {
        warn!(package = self.package, archive = %original.display(), "Restoring original archive");
        let mut file = tokio::fs::File::open(original).await?;
        self.link
            .install(self.device, &mut file, "qpatch-restore.apk")
            .await?;
        info!(package = self.package, "Original archive restored");
        Ok(())
    }

    /// Push the OBB data file into `remote_dir`, creating it first.
    pub async fn push_data_blob(
        &self,
        local: &Path,
        remote_dir: &str,
        name: &str,
    ) -> Result<String, PatcherError> {
        self.link.mkdir_p(self.device, remote_dir).await?;
        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
        let size = self.push_verified(local, &remote_path).await?;
        info!(remote = %remote_path, size, "Pushed data file");
        Ok(remote_path)
    }

    /// Remove a staged archive.
    pub async fn discard(&self, staged: &StagedArchive) -> Result<(), PatcherError> {
        self.link.remove(self.device, &staged.remote_path).await?;
        debug!(remote = %staged.remote_path, "Removed staged archive");
        Ok(())
    }

    async fn push_verified(&self, local: &Path, remote_path: &str) -> Result<u64, PatcherError> {
        let mut file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        let sent = self
            .link
            .push(self.device, remote_path, &mut file, DEFAULT_FILE_MODE)
            .await?;
        drop(file);

        let remote_size = self.link.remote_size(self.device, remote_path).await?;
        if sent != size || remote_size != size {
            return Err(PatcherError::Protocol(AdbError::UnexpectedResponse(format!(
                "{remote_path} is {remote_size} bytes on the device, expected {size}"
            ))));
        }
        Ok(size)
    }
}
