//! BSDIFF40 patch application.
//!
//! A patch is a 32-byte header followed by three bzip2 streams:
//!
//! ```text
//! offset 0    "BSDIFF40"
//! offset 8    length of the compressed control block
//! offset 16   length of the compressed diff block
//! offset 24   size of the new file
//! offset 32   control block, diff block, extra block
//! ```
//!
//! The control block is a sequence of `(add, copy, seek)` triples. For each
//! one, `add` diff bytes are added to the old file at the current position,
//! `copy` bytes are taken verbatim from the extra block, and the old position
//! moves by `seek`.

use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use tracing::{debug, info};

use crate::error::PatcherError;
use crate::integrity::{digest_reader, Sha256Digest};

pub const BSDIFF_MAGIC: &[u8; 8] = b"BSDIFF40";
pub const HEADER_LEN: usize = 32;

/// Largest output a patch may declare.
pub const MAX_OUTPUT_SIZE: u64 = 1 << 30;

/// A patch resolved for one source binary.
#[derive(Debug, Clone)]
pub struct PatchBlob {
    pub bytes: Vec<u8>,
    /// Digest the patched output must have, when known
    pub target: Option<Sha256Digest>,
}

/// Lookup from source digest to patch.
pub trait PatchSource {
    fn patch_for(&self, source: &Sha256Digest) -> Result<Option<PatchBlob>, PatcherError>;
}

/// Result of a successful patch application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    pub source: Sha256Digest,
    pub output: Sha256Digest,
    pub len: u64,
}

/// Patch `original` with the patch registered for its digest and write the
/// result to `out`.
///
/// Nothing is written to `out` unless the whole output was reconstructed
/// and, when the patch declares one, its target digest matched.
pub fn apply<R, P, W>(
    original: &mut R,
    patches: &P,
    out: &mut W,
) -> Result<PatchOutcome, PatcherError>
where
    R: Read + ?Sized,
    P: PatchSource + ?Sized,
    W: Write + ?Sized,
{
    let mut old = Vec::new();
    original.read_to_end(&mut old)?;
    let source = Sha256Digest::of(&old);

    let Some(patch) = patches.patch_for(&source)? else {
        return Err(PatcherError::PatchNotFound {
            digest: source.to_hex(),
        });
    };
    debug!(source = %source, patch_len = patch.bytes.len(), "Resolved patch");

    let new = apply_bsdiff(&old, &patch.bytes)?;
    let output = digest_reader(&mut new.as_slice())?;

    if let Some(target) = patch.target {
        if target != output {
            return Err(PatcherError::PatchCorrupt(format!(
                "patched output digest {output} does not match expected {target}"
            )));
        }
    }

    out.write_all(&new)?;
    out.flush()?;

    info!(source = %source, output = %output, len = new.len(), "Patch applied");
    Ok(PatchOutcome {
        source,
        output,
        len: new.len() as u64,
    })
}

/// Reconstruct the new file from `old` and a BSDIFF40 `patch`.
pub fn apply_bsdiff(old: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatcherError> {
    if patch.len() < HEADER_LEN || &patch[..8] != BSDIFF_MAGIC {
        return Err(corrupt("missing BSDIFF40 header"));
    }

    let ctrl_len = header_field(patch, 8, "control block length")?;
    let diff_len = header_field(patch, 16, "diff block length")?;
    let new_size = header_field(patch, 24, "output size")?;
    if new_size > MAX_OUTPUT_SIZE {
        return Err(corrupt(format!(
            "declared output size {new_size} exceeds {MAX_OUTPUT_SIZE}"
        )));
    }

    let ctrl_end = (HEADER_LEN as u64)
        .checked_add(ctrl_len)
        .filter(|end| *end <= patch.len() as u64)
        .ok_or_else(|| corrupt("truncated control block"))? as usize;
    let diff_end = (ctrl_end as u64)
        .checked_add(diff_len)
        .filter(|end| *end <= patch.len() as u64)
        .ok_or_else(|| corrupt("truncated diff block"))? as usize;

    let mut ctrl = BzDecoder::new(&patch[HEADER_LEN..ctrl_end]);
    let mut diff = BzDecoder::new(&patch[ctrl_end..diff_end]);
    let mut extra = BzDecoder::new(&patch[diff_end..]);

    let new_size = new_size as usize;
    let mut new = vec![0u8; new_size];
    let mut old_pos: i64 = 0;
    let mut new_pos: usize = 0;

    while new_pos < new_size {
        let mut triple = [0u8; 24];
        ctrl.read_exact(&mut triple)
            .map_err(|e| corrupt(format!("control block: {e}")))?;
        let add = offtin(&triple[0..8]);
        let copy = offtin(&triple[8..16]);
        let seek = offtin(&triple[16..24]);

        let add = checked_span(add, new_pos, new_size, "diff")?;
        diff.read_exact(&mut new[new_pos..new_pos + add])
            .map_err(|e| corrupt(format!("diff block: {e}")))?;
        let add_end = old_pos
            .checked_add(add as i64)
            .ok_or_else(|| corrupt("diff run overflows the old position"))?;
        for i in 0..add {
            let at = old_pos + i as i64;
            if at >= 0 && (at as usize) < old.len() {
                new[new_pos + i] = new[new_pos + i].wrapping_add(old[at as usize]);
            }
        }
        new_pos += add;
        old_pos = add_end;

        let copy = checked_span(copy, new_pos, new_size, "extra")?;
        extra
            .read_exact(&mut new[new_pos..new_pos + copy])
            .map_err(|e| corrupt(format!("extra block: {e}")))?;
        new_pos += copy;

        old_pos = old_pos
            .checked_add(seek)
            .ok_or_else(|| corrupt("seek overflows the old position"))?;
    }

    Ok(new)
}

/// Decode a sign-magnitude little-endian 64-bit integer.
pub fn offtin(buf: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    let magnitude = (u64::from_le_bytes(raw) & 0x7FFF_FFFF_FFFF_FFFF) as i64;
    if raw[7] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Encode an integer the way [`offtin`] decodes it.
pub fn offtout(value: i64) -> [u8; 8] {
    let mut raw = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        raw[7] |= 0x80;
    }
    raw
}

fn header_field(patch: &[u8], offset: usize, name: &str) -> Result<u64, PatcherError> {
    let value = offtin(&patch[offset..offset + 8]);
    if value < 0 {
        return Err(corrupt(format!("negative {name}")));
    }
    Ok(value as u64)
}

fn checked_span(len: i64, pos: usize, size: usize, block: &str) -> Result<usize, PatcherError> {
    if len < 0 {
        return Err(corrupt(format!("negative {block} length in control block")));
    }
    let len = len as u64;
    if len > (size - pos) as u64 {
        return Err(corrupt(format!("{block} run overruns the declared output size")));
    }
    Ok(len as usize)
}

fn corrupt(message: impl Into<String>) -> PatcherError {
    PatcherError::PatchCorrupt(message.into())
}
