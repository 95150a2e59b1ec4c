//! Test helpers: patch encoding, archive fixtures, a recording signer and
//! a stage event log.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bzip2::write::BzEncoder;
use bzip2::Compression;
use parking_lot::Mutex;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::bspatch::{offtout, BSDIFF_MAGIC};
use crate::error::PatcherError;
use crate::signer::ArchiveSigner;
use crate::stage::{StageEvent, StageObserver};

/// Collects stage events for later inspection.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<StageEvent>>>,
}

impl EventLog {
    pub fn observer(&self) -> StageObserver {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &StageEvent| {
            events.lock().push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<StageEvent> {
        self.events.lock().clone()
    }
}

/// Build a BSDIFF40 patch from raw control triples and block contents.
pub fn encode_bsdiff(
    ctrl: &[(i64, i64, i64)],
    diff: &[u8],
    extra: &[u8],
    new_size: u64,
) -> io::Result<Vec<u8>> {
    let mut ctrl_raw = Vec::with_capacity(ctrl.len() * 24);
    for &(add, copy, seek) in ctrl {
        ctrl_raw.extend_from_slice(&offtout(add));
        ctrl_raw.extend_from_slice(&offtout(copy));
        ctrl_raw.extend_from_slice(&offtout(seek));
    }

    let ctrl_block = compress(&ctrl_raw)?;
    let diff_block = compress(diff)?;
    let extra_block = compress(extra)?;

    let mut patch = Vec::new();
    patch.extend_from_slice(BSDIFF_MAGIC);
    patch.extend_from_slice(&offtout(ctrl_block.len() as i64));
    patch.extend_from_slice(&offtout(diff_block.len() as i64));
    patch.extend_from_slice(&offtout(new_size as i64));
    patch.extend_from_slice(&ctrl_block);
    patch.extend_from_slice(&diff_block);
    patch.extend_from_slice(&extra_block);
    Ok(patch)
}

/// A single-triple patch turning `old` into `new`: the common prefix is a
/// byte-wise difference, the rest comes from the extra block.
pub fn naive_patch(old: &[u8], new: &[u8]) -> io::Result<Vec<u8>> {
    let shared = old.len().min(new.len());
    let diff: Vec<u8> = new[..shared]
        .iter()
        .zip(&old[..shared])
        .map(|(n, o)| n.wrapping_sub(*o))
        .collect();
    let extra = &new[shared..];
    encode_bsdiff(
        &[(shared as i64, extra.len() as i64, 0)],
        &diff,
        extra,
        new.len() as u64,
    )
}

fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Write a zip archive with the given members.
pub fn build_apk(path: &Path, members: &[(&str, &[u8])]) -> Result<(), PatcherError> {
    let file = File::create(path)?;
    let mut writer = ZipWriter::new(file);
    for (name, contents) in members {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .map_err(|e| PatcherError::ArchiveWriteFailed(e.to_string()))?;
        writer.write_all(contents)?;
    }
    writer
        .finish()
        .map_err(|e| PatcherError::ArchiveWriteFailed(e.to_string()))?;
    Ok(())
}

/// Read every file member of a zip archive.
pub fn read_zip_entries(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, PatcherError> {
    let mut zip = ZipArchive::new(File::open(path)?)
        .map_err(|e| PatcherError::ArchiveExtractFailed(e.to_string()))?;
    let mut entries = BTreeMap::new();
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| PatcherError::ArchiveExtractFailed(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        entries.insert(entry.name().to_string(), contents);
    }
    Ok(entries)
}

/// Signer that records the archives it was asked to sign.
#[derive(Clone, Default)]
pub struct RecordingSigner {
    signed: Arc<Mutex<Vec<PathBuf>>>,
    failure: Option<String>,
}

impl RecordingSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every signing attempt with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn signed(&self) -> Vec<PathBuf> {
        self.signed.lock().clone()
    }
}

impl ArchiveSigner for RecordingSigner {
    fn sign(&self, archive: &Path) -> Result<(), PatcherError> {
        self.signed.lock().push(archive.to_path_buf());
        match &self.failure {
            Some(message) => Err(PatcherError::SignFailed(message.clone())),
            None => Ok(()),
        }
    }

    fn description(&self) -> String {
        "recording signer".to_string()
    }
}
