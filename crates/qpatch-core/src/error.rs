//! Error types for the patch pipeline.

use qpatch_adb::{AdbError, DiscoveryError};
use thiserror::Error;

use crate::stage::Stage;

/// Errors that can occur while producing or deploying a patched archive.
#[derive(Debug, Error)]
pub enum PatcherError {
    /// Artifact digest is not in its trusted set
    #[error("{artifact} hash mismatch: expected one of [{}], got {actual}", .expected.join(", "))]
    IntegrityMismatch {
        artifact: String,
        expected: Vec<String>,
        actual: String,
    },

    /// No patch is registered for the binary's digest
    #[error("no patch registered for source digest {digest}")]
    PatchNotFound { digest: String },

    /// Patch blob is structurally invalid or produced the wrong output
    #[error("corrupt patch: {0}")]
    PatchCorrupt(String),

    /// Archive could not be opened or unpacked
    #[error("failed to extract archive: {0}")]
    ArchiveExtractFailed(String),

    /// Archive could not be written
    #[error("failed to write archive: {0}")]
    ArchiveWriteFailed(String),

    /// Expected archive member is absent
    #[error("archive member missing: {0}")]
    MemberMissing(String),

    /// Config document is malformed or lacks the host field
    #[error("config document error: {0}")]
    ConfigParseError(String),

    /// Signing toolchain failed
    #[error("signing failed: {0}")]
    SignFailed(String),

    /// Discovery gave up without an eligible device
    #[error("no eligible device found after {polls} scans")]
    DeviceNotFound { polls: u32 },

    /// Discovery was cancelled
    #[error("device discovery cancelled")]
    DiscoveryCancelled,

    /// Device link failure
    #[error("device protocol error: {0}")]
    Protocol(#[from] AdbError),

    /// Installed package has a version the bundled patches do not cover
    #[error("{package} version {installed} is not supported (expected {expected})")]
    UnsupportedSourceVersion {
        package: String,
        expected: u64,
        installed: u64,
    },

    /// Artifact is neither present locally nor obtainable from the device
    #[error("artifact not available: {0}")]
    ArtifactMissing(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DiscoveryError> for PatcherError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::NotFound { polls } => PatcherError::DeviceNotFound { polls },
            DiscoveryError::Cancelled => PatcherError::DiscoveryCancelled,
            DiscoveryError::Link(e) => PatcherError::Protocol(e),
        }
    }
}

/// A failure attributed to the stage that raised it.
#[derive(Debug, Error)]
#[error("failed to {stage}: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PatcherError,
}

impl StageFailure {
    pub fn new(stage: Stage, source: PatcherError) -> Self {
        Self { stage, source }
    }
}
