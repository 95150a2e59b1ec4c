//! Pipeline orchestrator - runs every stage in order against one device.
//!
//! The pipeline combines all components:
//! - Device discovery through a [`DeviceLink`]
//! - Integrity gates over the archive, data file and native library
//! - The archive transform (patch, reconfigure, strip, repack)
//! - Signing through an [`ArchiveSigner`]
//! - Staged install with optional restore of the original
//!
//! Any stage failure ends the run with a [`StageFailure`] naming that stage.
//! The archive transform and signing run on the blocking pool.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use qpatch_adb::{discover_device, AdbServer, Device, DeviceLink};
use tokio::task::{self, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acquire::{locate_archive, locate_data_blob, LocatedArtifact};
use crate::archive::ArchiveTransform;
use crate::config::{file_name, PipelineConfig};
use crate::error::{PatcherError, StageFailure};
use crate::install::{DeviceInstaller, StagedArchive};
use crate::integrity::{ArtifactVerifier, Sha256Digest};
use crate::registry::PatchRegistry;
use crate::signer::ArchiveSigner;
use crate::stage::{Stage, StageObserver, StageTracker};

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub device: Device,
    pub archive: LocatedArtifact,
    pub archive_digest: Sha256Digest,
    pub data_blob_digest: Sha256Digest,
    pub library_source: Sha256Digest,
    pub library_output: Sha256Digest,
    /// Host field value written into the config document
    pub host_value: String,
    /// Remote path of the pushed data file
    pub data_blob_remote: String,
    /// Whether an existing install was removed
    pub replaced_existing: bool,
    /// Patched archive, when kept
    pub patched_archive: Option<PathBuf>,
    pub stages: Vec<Stage>,
}

/// Deployment pipeline over a device link.
pub struct Pipeline<L: DeviceLink> {
    config: PipelineConfig,
    link: L,
    server: Option<AdbServer>,
    signer: Arc<dyn ArchiveSigner>,
    patches: PatchRegistry,
    verifier: ArtifactVerifier,
    observer: Option<StageObserver>,
}

impl<L: DeviceLink> Pipeline<L> {
    pub fn new(config: PipelineConfig, link: L, signer: Box<dyn ArchiveSigner>) -> Self {
        Self {
            config,
            link,
            server: None,
            signer: Arc::from(signer),
            patches: PatchRegistry::new(),
            verifier: ArtifactVerifier::new(),
            observer: None,
        }
    }

    pub fn with_patches(mut self, patches: PatchRegistry) -> Self {
        self.patches = patches;
        self
    }

    /// Start the local ADB server during `ConnectServer` when none answers.
    pub fn with_server(mut self, server: AdbServer) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_observer(mut self, observer: StageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Run every stage in order.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipelineReport, StageFailure> {
        let config = &self.config;
        let package = &config.package;
        let mut tracker = StageTracker::new(self.observer.clone());

        tracker.begin(Stage::ConnectServer);
        let result = self.connect().await;
        let version = tracker.finish(Stage::ConnectServer, result)?;
        info!(version, signer = %self.signer.description(), "Connected to ADB server");

        tracker.begin(Stage::DiscoverDevice);
        let result = discover_device(&self.link, &config.discovery_options(), cancel)
            .await
            .map_err(PatcherError::from);
        let device = tracker.finish(Stage::DiscoverDevice, result)?;

        tracker.begin(Stage::LocateArchive);
        let result = locate_archive(&self.link, &device, package).await;
        let archive = tracker.finish(Stage::LocateArchive, result)?;

        let archive_digest = tracker.step(Stage::VerifyArchive, || {
            self.verifier
                .verify_file("application archive", &archive.path, &config.trust.archive)
        })?;

        let remote_data_blob = config.remote_data_blob_path();
        tracker.begin(Stage::LocateDataBlob);
        let result = locate_data_blob(&self.link, &device, package, &remote_data_blob).await;
        let data_blob = tracker.finish(Stage::LocateDataBlob, result)?;

        let data_blob_digest = tracker.step(Stage::VerifyDataBlob, || {
            self.verifier
                .verify_file("OBB data file", &data_blob.path, &config.trust.data_blob)
        })?;

        let patched = config.workspace.patched_archive.clone();
        let layout = config.archive_layout();
        let patches = self.patches.clone();
        let mut trusted_libraries = patches.sources();
        trusted_libraries.extend(config.trusted_libraries().iter().copied());
        let config_document = package.config_document.clone();
        let serial = device.serial.clone();
        let source = archive.path.clone();
        let work_dir = config.working_tree_dir();
        let output = patched.clone();
        let (returned, result) = task::spawn_blocking(move || {
            let transform = ArchiveTransform {
                layout: &layout,
                patches: &patches,
                trusted_libraries: &trusted_libraries,
                config_document: config_document.as_deref(),
                serial: &serial,
            };
            let result = transform.run(&source, &work_dir, &output, &mut tracker);
            (tracker, result)
        })
        .await
        .map_err(|e| StageFailure::new(Stage::Extract, join_error(e)))?;
        tracker = returned;
        let report = result?;

        tracker.begin(Stage::Sign);
        let signer = Arc::clone(&self.signer);
        let target = patched.clone();
        let result = task::spawn_blocking(move || signer.sign(&target))
            .await
            .unwrap_or_else(|e| Err(join_error(e)));
        tracker.finish(Stage::Sign, result)?;

        let installer =
            DeviceInstaller::new(&self.link, &device, &package.name, &config.device.staging_dir);

        tracker.begin(Stage::StageInstall);
        let result = installer.stage(&patched, &file_name(&patched)).await;
        let staged = tracker.finish(Stage::StageInstall, result)?;

        tracker.begin(Stage::Uninstall);
        let result = installer.uninstall_existing().await;
        if result.is_err() {
            discard_staged(&installer, &staged).await;
        }
        let replaced_existing = tracker.finish(Stage::Uninstall, result)?;

        tracker.begin(Stage::Install);
        let result = installer.install_staged(&staged).await;
        if let Err(install_error) = &result {
            discard_staged(&installer, &staged).await;
            if config.device.rollback_on_install_failure && replaced_existing {
                warn!(error = %install_error, "Install failed, restoring original");
                if let Err(e) = installer.restore(&archive.path).await {
                    error!(error = %e, "Restoring the original archive failed");
                }
            }
        }
        tracker.finish(Stage::Install, result)?;

        tracker.begin(Stage::PushDataBlob);
        let data_blob_name = file_name(&package.data_blob);
        let result = installer
            .push_data_blob(&data_blob.path, &package.remote_data_dir, &data_blob_name)
            .await;
        if result.is_err() {
            discard_staged(&installer, &staged).await;
        }
        let data_blob_remote = tracker.finish(Stage::PushDataBlob, result)?;

        tracker.begin(Stage::Cleanup);
        let result = self.cleanup(&installer, &staged, &patched).await;
        let patched_archive = tracker.finish(Stage::Cleanup, result)?;

        info!(serial = %device.serial, package = %package.name, "Deployment complete");
        Ok(PipelineReport {
            device,
            archive,
            archive_digest,
            data_blob_digest,
            library_source: report.library_source,
            library_output: report.library.output,
            host_value: report.host_value,
            data_blob_remote,
            replaced_existing,
            patched_archive,
            stages: tracker.completed().to_vec(),
        })
    }

    async fn connect(&self) -> Result<u32, PatcherError> {
        let version = match &self.server {
            Some(server) => server.ensure_running().await?,
            None => self.link.server_version().await?,
        };
        Ok(version)
    }

    async fn cleanup(
        &self,
        installer: &DeviceInstaller<'_, L>,
        staged: &StagedArchive,
        patched: &Path,
    ) -> Result<Option<PathBuf>, PatcherError> {
        installer.discard(staged).await?;
        if self.config.workspace.keep_outputs {
            return Ok(Some(patched.to_path_buf()));
        }
        if patched.exists() {
            tokio::fs::remove_file(patched).await?;
        }
        Ok(None)
    }
}

/// Best-effort removal of the staged archive after a later stage failed.
async fn discard_staged<L: DeviceLink>(installer: &DeviceInstaller<'_, L>, staged: &StagedArchive) {
    if let Err(e) = installer.discard(staged).await {
        warn!(remote = %staged.remote_path, error = %e, "Failed to remove staged archive");
    }
}

fn join_error(err: JoinError) -> PatcherError {
    PatcherError::Io(io::Error::other(err.to_string()))
}
