use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use clap::ValueEnum;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::ChainError;

/// Checksum algorithm used for every signature in one manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 3] = [
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Blake3,
    ];

    /// Prefix of the `-Current`, `-History` and `-Patches` manifest fields.
    pub fn field_prefix(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA1",
            DigestAlgorithm::Sha256 => "SHA256",
            DigestAlgorithm::Blake3 => "BLAKE3",
        }
    }

    pub fn from_field_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.field_prefix() == prefix)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_prefix())
    }
}

/// Content digest and byte length of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub digest: String,
    pub size: u64,
}

impl Signature {
    pub fn new(digest: impl Into<String>, size: u64) -> Self {
        Self {
            digest: digest.into(),
            size,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.digest, self.size)
    }
}

/// Stream `path` through `hasher`, returning the number of bytes read.
/// Uses a 256 KB BufReader; index files run to tens of megabytes.
fn stream_into<W: Write>(path: &Path, hasher: &mut W) -> Result<u64, ChainError> {
    let file = std::fs::File::open(path).map_err(|e| ChainError::io(path, e))?;
    let mut reader = io::BufReader::with_capacity(256 * 1024, file);
    io::copy(&mut reader, hasher).map_err(|e| ChainError::io(path, e))
}

/// Compute the signature of the file at `path`.
pub fn signature(path: &Path, algorithm: DigestAlgorithm) -> Result<Signature, ChainError> {
    let (digest, size) = match algorithm {
        DigestAlgorithm::Sha1 => {
            let mut hasher = Sha1::new();
            let size = stream_into(path, &mut hasher)?;
            (hex::encode(hasher.finalize()), size)
        }
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            let size = stream_into(path, &mut hasher)?;
            (hex::encode(hasher.finalize()), size)
        }
        DigestAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            let size = stream_into(path, &mut hasher)?;
            (hasher.finalize().to_hex().to_string(), size)
        }
    };
    Ok(Signature { digest, size })
}

/// Hash on the blocking pool so large snapshots don't stall the runtime.
pub async fn signature_blocking(
    path: &Path,
    algorithm: DigestAlgorithm,
) -> Result<Signature, ChainError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || signature(&path, algorithm)).await?
}
