//! Locating input artifacts.
//!
//! A local copy always wins. Without one, the artifact is pulled from the
//! device, but only when the installed package has the version the patches
//! were built for.

use std::path::{Path, PathBuf};

use qpatch_adb::{Device, DeviceLink};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::PackageConfig;
use crate::error::PatcherError;

/// Where a located artifact came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Local,
    Device { remote_path: String },
}

/// A local artifact ready for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    pub path: PathBuf,
    pub origin: ArtifactOrigin,
}

/// Locate the original application archive.
pub async fn locate_archive<L>(
    link: &L,
    device: &Device,
    package: &PackageConfig,
) -> Result<LocatedArtifact, PatcherError>
where
    L: DeviceLink + ?Sized,
{
    if let Some(local) = local_artifact(&package.archive) {
        return Ok(local);
    }

    require_supported_version(link, device, package, &package.archive).await?;
    let remote_path = link
        .package_path(device, &package.name)
        .await?
        .ok_or_else(|| {
            PatcherError::ArtifactMissing(format!("no archive path reported for {}", package.name))
        })?;

    pull_to(link, device, &remote_path, &package.archive).await?;
    Ok(LocatedArtifact {
        path: package.archive.clone(),
        origin: ArtifactOrigin::Device { remote_path },
    })
}

/// Locate the OBB data file.
pub async fn locate_data_blob<L>(
    link: &L,
    device: &Device,
    package: &PackageConfig,
    remote_path: &str,
) -> Result<LocatedArtifact, PatcherError>
where
    L: DeviceLink + ?Sized,
{
    if let Some(local) = local_artifact(&package.data_blob) {
        return Ok(local);
    }

    require_supported_version(link, device, package, &package.data_blob).await?;
    if link.remote_size(device, remote_path).await.is_err() {
        return Err(PatcherError::ArtifactMissing(format!(
            "{} is not present locally or on the device at {}",
            package.data_blob.display(),
            remote_path
        )));
    }

    pull_to(link, device, remote_path, &package.data_blob).await?;
    Ok(LocatedArtifact {
        path: package.data_blob.clone(),
        origin: ArtifactOrigin::Device {
            remote_path: remote_path.to_string(),
        },
    })
}

fn local_artifact(path: &Path) -> Option<LocatedArtifact> {
    if !path.is_file() {
        return None;
    }
    info!(path = %path.display(), "Using local artifact");
    Some(LocatedArtifact {
        path: path.to_path_buf(),
        origin: ArtifactOrigin::Local,
    })
}

async fn require_supported_version<L>(
    link: &L,
    device: &Device,
    package: &PackageConfig,
    wanted: &Path,
) -> Result<(), PatcherError>
where
    L: DeviceLink + ?Sized,
{
    match link.package_version(device, &package.name).await? {
        None => Err(PatcherError::ArtifactMissing(format!(
            "{} not found locally and {} is not installed on {}",
            wanted.display(),
            package.name,
            device.serial
        ))),
        Some(installed) if installed.version_code != package.version_code => {
            Err(PatcherError::UnsupportedSourceVersion {
                package: package.name.clone(),
                expected: package.version_code,
                installed: installed.version_code,
            })
        }
        Some(installed) => {
            info!(package = %package.name, version = %installed, "Installed version is supported");
            Ok(())
        }
    }
}

/// Pull `remote_path` to `local`. A partial download never lands on `local`.
pub async fn pull_to<L>(
    link: &L,
    device: &Device,
    remote_path: &str,
    local: &Path,
) -> Result<u64, PatcherError>
where
    L: DeviceLink + ?Sized,
{
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut partial = local.as_os_str().to_os_string();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let result = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        let bytes = link.pull(device, remote_path, &mut file).await?;
        file.flush().await?;
        Ok::<_, PatcherError>(bytes)
    }
    .await;

    match result {
        Ok(bytes) => {
            tokio::fs::rename(&partial, local).await?;
            info!(
                remote = remote_path,
                path = %local.display(),
                bytes,
                "Pulled artifact from device"
            );
            Ok(bytes)
        }
        Err(e) => {
            warn!(remote = remote_path, error = %e, "Pull failed");
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        }
    }
}
