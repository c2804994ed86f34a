use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ExtractError;

/// Files are folded into the digest in fixed-size chunks so memory stays
/// bounded for large scans.
const CHUNK_SIZE: usize = 8192;

/// Deterministic digest of a document's content, used as the cache key.
///
/// Identical bytes always yield the same fingerprint regardless of
/// path, timestamps, or where the file was downloaded to, so a
/// re-download of an unchanged document is a guaranteed cache hit.
/// Collisions are cryptographically negligible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Compute the fingerprint of a file on disk.
    pub fn of_file(path: &Path) -> Result<Self, ExtractError> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
        }
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    /// Wrap an already computed digest string (used when loading index
    /// entries from disk).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
