//! Artifact integrity gates.
//!
//! Every artifact the pipeline consumes is hashed with SHA-256 and checked
//! against a set of known-good digests before anything downstream touches it.
//! Set membership is evaluated with constant-time comparisons.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};

use crate::error::PatcherError;

/// Buffer size for reading artifacts during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Digest(pub [u8; 32]);

impl Sha256Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl FromStr for Sha256Digest {
    type Err = PatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| PatcherError::Config(format!("invalid SHA-256 digest {s:?}: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            PatcherError::Config(format!("SHA-256 digest {s:?} must be 32 bytes"))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Sha256Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash a stream to its end.
pub fn digest_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Sha256Digest, PatcherError> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Sha256Digest(hasher.finalize().into()))
}

/// Hash a file. The file is closed before this returns.
pub fn digest_file(path: &Path) -> Result<Sha256Digest, PatcherError> {
    let mut file = File::open(path)?;
    digest_reader(&mut file)
}

/// Digests accepted for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustedSet(Vec<Sha256Digest>);

impl TrustedSet {
    pub fn new(digests: Vec<Sha256Digest>) -> Self {
        let mut set = Self::default();
        set.extend(digests);
        set
    }

    /// Add a digest; duplicates are ignored.
    pub fn insert(&mut self, digest: Sha256Digest) {
        if !self.contains(&digest) {
            self.0.push(digest);
        }
    }

    /// Constant-time membership test.
    pub fn contains(&self, digest: &Sha256Digest) -> bool {
        let found = self
            .0
            .iter()
            .fold(Choice::from(0u8), |acc, trusted| acc | trusted.0[..].ct_eq(&digest.0[..]));
        bool::from(found)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sha256Digest> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn to_hex_list(&self) -> Vec<String> {
        self.0.iter().map(Sha256Digest::to_hex).collect()
    }
}

impl Extend<Sha256Digest> for TrustedSet {
    fn extend<I: IntoIterator<Item = Sha256Digest>>(&mut self, iter: I) {
        for digest in iter {
            self.insert(digest);
        }
    }
}

impl FromIterator<Sha256Digest> for TrustedSet {
    fn from_iter<I: IntoIterator<Item = Sha256Digest>>(iter: I) -> Self {
        let mut set = Self::default();
        set.extend(iter);
        set
    }
}

/// Gate that admits an artifact only when its digest is trusted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactVerifier;

impl ArtifactVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Hash `reader` to its end and check the digest against `trusted`.
    ///
    /// `artifact` names the artifact in logs and errors.
    pub fn verify_reader<R: Read + ?Sized>(
        &self,
        artifact: &str,
        reader: &mut R,
        trusted: &TrustedSet,
    ) -> Result<Sha256Digest, PatcherError> {
        let actual = digest_reader(reader)?;
        self.check(artifact, actual, trusted)
    }

    /// Like [`verify_reader`](Self::verify_reader) for a file on disk.
    pub fn verify_file(
        &self,
        artifact: &str,
        path: &Path,
        trusted: &TrustedSet,
    ) -> Result<Sha256Digest, PatcherError> {
        let actual = digest_file(path)?;
        let digest = self.check(artifact, actual, trusted)?;
        tracing::debug!(path = %path.display(), hash = %digest, "Artifact file verified");
        Ok(digest)
    }

    fn check(
        &self,
        artifact: &str,
        actual: Sha256Digest,
        trusted: &TrustedSet,
    ) -> Result<Sha256Digest, PatcherError> {
        if !trusted.contains(&actual) {
            tracing::error!(
                artifact,
                actual = %actual,
                trusted = trusted.len(),
                "Artifact hash mismatch"
            );
            return Err(PatcherError::IntegrityMismatch {
                artifact: artifact.to_string(),
                expected: trusted.to_hex_list(),
                actual: actual.to_hex(),
            });
        }

        tracing::info!(artifact, hash = %actual, "Artifact hash verified");
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // SHA-256 of "abc"
    const ABC_DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_digest_known_vector() {
        let mut input: &[u8] = b"abc";
        assert_eq!(digest_reader(&mut input).unwrap().to_hex(), ABC_DIGEST);
        assert_eq!(Sha256Digest::of(b"abc").to_hex(), ABC_DIGEST);
    }

    #[test]
    fn test_digest_parse_roundtrip_and_errors() {
        let digest: Sha256Digest = ABC_DIGEST.parse().unwrap();
        assert_eq!(digest.to_string(), ABC_DIGEST);
        assert!("abcd".parse::<Sha256Digest>().is_err());
        assert!("zz".repeat(32).parse::<Sha256Digest>().is_err());
    }

    #[test]
    fn test_trusted_set_dedup_and_membership() {
        let a = Sha256Digest::of(b"a");
        let b = Sha256Digest::of(b"b");
        let set = TrustedSet::new(vec![a, a, b]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
        assert!(!set.contains(&Sha256Digest::of(b"c")));
        assert!(!TrustedSet::default().contains(&a));
    }

    #[test]
    fn test_verify_reader_accepts_trusted() {
        let verifier = ArtifactVerifier::new();
        let trusted = TrustedSet::new(vec![Sha256Digest::of(b"payload")]);
        let mut input: &[u8] = b"payload";
        let digest = verifier.verify_reader("blob", &mut input, &trusted).unwrap();
        assert_eq!(digest, Sha256Digest::of(b"payload"));
    }

    #[test]
    fn test_verify_reader_rejects_single_byte_change() {
        let verifier = ArtifactVerifier::new();
        let trusted = TrustedSet::new(vec![Sha256Digest::of(b"payload")]);
        let mut input: &[u8] = b"paylOad";
        match verifier.verify_reader("blob", &mut input, &trusted) {
            Err(PatcherError::IntegrityMismatch { artifact, expected, actual }) => {
                assert_eq!(artifact, "blob");
                assert_eq!(expected, vec![Sha256Digest::of(b"payload").to_hex()]);
                assert_eq!(actual, Sha256Digest::of(b"paylOad").to_hex());
            }
            other => panic!("expected IntegrityMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_file_releases_handle() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"archive bytes").unwrap();
        let path = file.path().to_path_buf();
        let trusted = TrustedSet::new(vec![Sha256Digest::of(b"archive bytes")]);

        ArtifactVerifier::new()
            .verify_file("archive", &path, &trusted)
            .unwrap();

        // The path can be replaced right after verification.
        std::fs::write(&path, b"replaced").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"replaced");
    }

    #[test]
    fn test_trusted_set_serde_as_hex_list() {
        let set = TrustedSet::new(vec![ABC_DIGEST.parse().unwrap()]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, format!("[\"{ABC_DIGEST}\"]"));
        let back: TrustedSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
