//! Archive transform: extract, patch, reconfigure, strip and repack.
//!
//! The transform owns a [`WorkingTree`] for its whole duration. The tree is
//! removed when repacking finishes and, on any earlier failure, when the
//! guard is dropped.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::bspatch::{self, PatchOutcome, PatchSource};
use crate::config_doc::{bind_to_device, DEFAULT_CONFIG_DOCUMENT, DEFAULT_HOST_FIELD};
use crate::error::{PatcherError, StageFailure};
use crate::integrity::{ArtifactVerifier, Sha256Digest, TrustedSet};
use crate::stage::{Stage, StageTracker};

/// Where the transform finds and writes things inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    /// Member receiving the binary patch
    pub library_member: String,
    /// Member holding the config document
    pub config_member: String,
    /// Directory removed before repacking
    pub signing_dir: String,
    /// Config field that receives the device serial
    pub host_field: String,
    /// Members written without compression
    pub stored_members: Vec<String>,
}

impl Default for ArchiveLayout {
    fn default() -> Self {
        Self {
            library_member: "lib/arm64-v8a/libpnsovr.so".to_string(),
            config_member: "assets/_local/config.json".to_string(),
            signing_dir: "META-INF".to_string(),
            host_field: DEFAULT_HOST_FIELD.to_string(),
            stored_members: vec!["resources.arsc".to_string()],
        }
    }
}

/// Exclusively owned extraction directory, removed on drop.
#[derive(Debug)]
pub struct WorkingTree {
    root: PathBuf,
    removed: bool,
}

impl WorkingTree {
    /// Create `root`, clearing whatever was there before.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, PatcherError> {
        let root = root.into();
        if root.exists() {
            debug!(path = %root.display(), "Clearing stale working tree");
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Local path of an archive member given with `/` separators.
    pub fn member(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Delete the tree now.
    pub fn remove(mut self) -> Result<(), PatcherError> {
        self.removed = true;
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

impl Drop for WorkingTree {
    fn drop(&mut self) {
        if !self.removed && self.root.exists() {
            if let Err(e) = fs::remove_dir_all(&self.root) {
                warn!(path = %self.root.display(), error = %e, "Failed to remove working tree");
            }
        }
    }
}

/// Result of a completed transform.
#[derive(Debug, Clone)]
pub struct TransformReport {
    pub library_source: Sha256Digest,
    pub library: PatchOutcome,
    /// Host field value after binding to the device
    pub host_value: String,
    /// Number of entries in the repacked archive
    pub entries: usize,
}

/// Inputs of one archive transform.
pub struct ArchiveTransform<'a> {
    pub layout: &'a ArchiveLayout,
    pub patches: &'a dyn PatchSource,
    pub trusted_libraries: &'a TrustedSet,
    /// Replacement config document; the bundled one when `None`
    pub config_document: Option<&'a Path>,
    pub serial: &'a str,
}

impl ArchiveTransform<'_> {
    /// Turn `archive` into the unsigned patched archive at `output`, using
    /// `work_dir` as the working tree.
    pub fn run(
        &self,
        archive: &Path,
        work_dir: &Path,
        output: &Path,
        tracker: &mut StageTracker,
    ) -> Result<TransformReport, StageFailure> {
        let tree = tracker.step(Stage::Extract, || extract(archive, work_dir))?;

        let library = tree.member(&self.layout.library_member);
        let library_source = tracker.step(Stage::VerifyLibrary, || {
            if !library.is_file() {
                return Err(PatcherError::MemberMissing(self.layout.library_member.clone()));
            }
            ArtifactVerifier::new().verify_file("native library", &library, self.trusted_libraries)
        })?;

        let outcome = tracker.step(Stage::PatchLibrary, || patch_member(&library, self.patches))?;

        let config_path = tree.member(&self.layout.config_member);
        tracker.step(Stage::InjectConfig, || {
            inject_config(&config_path, self.config_document)
        })?;

        let host_value = tracker.step(Stage::MutateConfig, || {
            bind_to_device(&config_path, &self.layout.host_field, self.serial)
        })?;

        tracker.step(Stage::StripSigningMetadata, || {
            strip_signing_metadata(&tree, &self.layout.signing_dir).map(|_| ())
        })?;

        let entries = tracker.step(Stage::Repack, || {
            repack(tree, output, &self.layout.stored_members)
        })?;

        Ok(TransformReport {
            library_source,
            library: outcome,
            host_value,
            entries,
        })
    }
}

/// Unpack `archive` into a fresh working tree at `work_dir`.
///
/// Any leftover tree at `work_dir` is gone afterwards, even when `archive`
/// cannot be read.
pub fn extract(archive: &Path, work_dir: &Path) -> Result<WorkingTree, PatcherError> {
    let tree = WorkingTree::create(work_dir)?;

    let file = File::open(archive).map_err(|e| {
        PatcherError::ArchiveExtractFailed(format!("{}: {}", archive.display(), e))
    })?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(extract_error)?;
    zip.extract(tree.path()).map_err(extract_error)?;

    info!(
        archive = %archive.display(),
        path = %tree.path().display(),
        entries = zip.len(),
        "Extracted archive"
    );
    Ok(tree)
}

/// Apply the registered patch to `path` in place.
///
/// The output goes to a `.new` sibling that replaces the original only after
/// the patch succeeded.
pub fn patch_member(path: &Path, patches: &dyn PatchSource) -> Result<PatchOutcome, PatcherError> {
    let patched = sibling_with_suffix(path, ".new");

    let result = (|| -> Result<PatchOutcome, PatcherError> {
        let mut input = File::open(path)?;
        let mut output = File::create(&patched)?;
        let outcome = bspatch::apply(&mut input, patches, &mut output)?;
        output.sync_all()?;
        Ok(outcome)
    })();

    match result {
        Ok(outcome) => {
            fs::remove_file(path)?;
            fs::rename(&patched, path)?;
            debug!(path = %path.display(), "Replaced member with patched copy");
            Ok(outcome)
        }
        Err(e) => {
            let _ = fs::remove_file(&patched);
            Err(e)
        }
    }
}

/// Write the config document to `path`, replacing any existing one.
pub fn inject_config(path: &Path, document: Option<&Path>) -> Result<(), PatcherError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match document {
        Some(source) => {
            fs::copy(source, path)?;
        }
        None => fs::write(path, DEFAULT_CONFIG_DOCUMENT)?,
    }
    debug!(path = %path.display(), "Injected config document");
    Ok(())
}

/// Remove the signing metadata directory. Returns whether it existed.
pub fn strip_signing_metadata(tree: &WorkingTree, signing_dir: &str) -> Result<bool, PatcherError> {
    let dir = tree.member(signing_dir);
    if !dir.exists() {
        debug!(path = %dir.display(), "No signing metadata to strip");
        return Ok(false);
    }
    fs::remove_dir_all(&dir)?;
    info!(path = %dir.display(), "Stripped signing metadata");
    Ok(true)
}

/// Pack `tree` into `output` and delete the tree.
///
/// A stale `output` is removed first; a partially written one is removed on
/// failure. Returns the number of entries written.
pub fn repack(
    tree: WorkingTree,
    output: &Path,
    stored_members: &[String],
) -> Result<usize, PatcherError> {
    if output.exists() {
        fs::remove_file(output)?;
    }

    let result = write_archive(tree.path(), output, stored_members);
    let cleanup = tree.remove();

    match result {
        Ok(entries) => {
            cleanup?;
            info!(output = %output.display(), entries, "Repacked archive");
            Ok(entries)
        }
        Err(e) => {
            let _ = fs::remove_file(output);
            Err(e)
        }
    }
}

fn write_archive(
    root: &Path,
    output: &Path,
    stored_members: &[String],
) -> Result<usize, PatcherError> {
    let mut members = Vec::new();
    collect_files(root, root, &mut members)?;
    members.sort();

    let file = File::create(output)?;
    let mut writer = ZipWriter::new(file);
    for (name, path) in &members {
        let method = if stored_members.iter().any(|member| member == name) {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .unix_permissions(0o644);
        writer.start_file(name.as_str(), options).map_err(write_error)?;
        let mut source = File::open(path)?;
        io::copy(&mut source, &mut writer)?;
    }

    writer.finish().map_err(write_error)?;
    Ok(members.len())
}

/// Collect `(member name, path)` for every file under `dir`.
fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), PatcherError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let relative = path.strip_prefix(root).map_err(|e| {
            PatcherError::ArchiveWriteFailed(format!("{}: {}", path.display(), e))
        })?;
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push((name, path));
    }
    Ok(())
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn extract_error(err: ZipError) -> PatcherError {
    PatcherError::ArchiveExtractFailed(err.to_string())
}

fn write_error(err: ZipError) -> PatcherError {
    PatcherError::ArchiveWriteFailed(err.to_string())
}
