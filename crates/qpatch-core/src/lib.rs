//! # qpatch-core
//!
//! Device-gated patch deployment for a Quest application archive.
//!
//! This crate handles:
//! - SHA-256 integrity gates over the archive, OBB data file and native library
//! - BSDIFF40 patch application keyed by source digest
//! - Archive transform: extract, patch, inject and bind the config document,
//!   strip signing metadata, repack
//! - Re-signing through the Android build tools
//! - Staged install with restore of the original on failure
//!
//! ## Safety of the device
//!
//! Nothing on the device is modified before every local artifact has passed
//! its integrity gate and the patched archive has been signed and staged.

pub mod acquire;
pub mod archive;
pub mod bspatch;
pub mod config;
pub mod config_doc;
pub mod error;
pub mod install;
pub mod integrity;
pub mod pipeline;
#[cfg(test)]
mod proptests;
pub mod registry;
pub mod signer;
pub mod stage;
pub mod testing;

// Re-export main types for convenience
pub use acquire::{ArtifactOrigin, LocatedArtifact};
pub use archive::{ArchiveLayout, ArchiveTransform, TransformReport, WorkingTree};
pub use bspatch::{apply, apply_bsdiff, PatchBlob, PatchOutcome, PatchSource};
pub use config::{
    DeviceConfig, LoggingConfig, PackageConfig, PatchConfig, PipelineConfig, SigningConfig,
    TrustConfig, WorkspaceConfig,
};
pub use config_doc::{bind_to_device, ConfigDocument};
pub use error::{PatcherError, StageFailure};
pub use install::{DeviceInstaller, StagedArchive};
pub use integrity::{ArtifactVerifier, Sha256Digest, TrustedSet};
pub use pipeline::{Pipeline, PipelineReport};
pub use registry::PatchRegistry;
pub use signer::{ApkSignerTool, ArchiveSigner};
pub use stage::{Stage, StageEvent, StageObserver, StageTracker};
