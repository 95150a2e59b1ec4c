//! Registry of bundled patches keyed by source digest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::bspatch::{PatchBlob, PatchSource};
use crate::config::PatchConfig;
use crate::error::PatcherError;
use crate::integrity::{Sha256Digest, TrustedSet};

/// Where a registered patch lives.
#[derive(Debug, Clone)]
pub enum PatchLocation {
    Embedded(Vec<u8>),
    /// Read when the patch is needed
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RegisteredPatch {
    pub location: PatchLocation,
    pub target: Option<Sha256Digest>,
}

/// Explicit map from the digest of an original binary to its patch.
#[derive(Debug, Clone, Default)]
pub struct PatchRegistry {
    patches: BTreeMap<Sha256Digest, RegisteredPatch>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from `[[patch.bundled]]` entries. Relative patch
    /// paths resolve against `base_dir`.
    pub fn from_config(config: &PatchConfig, base_dir: &Path) -> Result<Self, PatcherError> {
        let mut registry = Self::new();
        for entry in &config.bundled {
            let path = if entry.file.is_absolute() {
                entry.file.clone()
            } else {
                base_dir.join(&entry.file)
            };
            if !path.is_file() {
                return Err(PatcherError::Config(format!(
                    "patch file {} for source {} does not exist",
                    path.display(),
                    entry.source_hash
                )));
            }
            registry.register_file(entry.source_hash, path, entry.target_hash);
        }
        Ok(registry)
    }

    pub fn register_bytes(
        &mut self,
        source: Sha256Digest,
        patch: Vec<u8>,
        target: Option<Sha256Digest>,
    ) {
        self.insert(source, PatchLocation::Embedded(patch), target);
    }

    pub fn register_file(
        &mut self,
        source: Sha256Digest,
        path: PathBuf,
        target: Option<Sha256Digest>,
    ) {
        self.insert(source, PatchLocation::File(path), target);
    }

    fn insert(
        &mut self,
        source: Sha256Digest,
        location: PatchLocation,
        target: Option<Sha256Digest>,
    ) {
        debug!(source = %source, "Registered patch");
        self.patches.insert(source, RegisteredPatch { location, target });
    }

    /// Source digests with a registered patch.
    pub fn sources(&self) -> TrustedSet {
        self.patches.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

impl PatchSource for PatchRegistry {
    fn patch_for(&self, source: &Sha256Digest) -> Result<Option<PatchBlob>, PatcherError> {
        let Some(entry) = self.patches.get(source) else {
            return Ok(None);
        };
        let bytes = match &entry.location {
            PatchLocation::Embedded(bytes) => bytes.clone(),
            PatchLocation::File(path) => std::fs::read(path)?,
        };
        Ok(Some(PatchBlob {
            bytes,
            target: entry.target,
        }))
    }
}
