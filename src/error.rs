use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::digest::{DigestAlgorithm, Signature};

/// Everything that can abort one hook invocation.
///
/// None of these are retried: the caller sees a nonzero exit and the staged
/// manifest is never written.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A snapshot, manifest or artifact could not be read or written.
    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest's current signature does not describe the old snapshot.
    #[error("old file seems to have changed: manifest records {recorded}, file is {actual}")]
    Consistency {
        recorded: Signature,
        actual: Signature,
    },

    /// The manifest was written with a different checksum algorithm.
    #[error("manifest uses {found} checksums but {expected} was requested")]
    AlgorithmMismatch {
        found: DigestAlgorithm,
        expected: DigestAlgorithm,
    },

    /// The diff generator or compressor failed.
    #[error("{tool} failed: {reason}")]
    Collaborator { tool: String, reason: String },

    /// Every candidate label collided with an existing patch.
    #[error("no free patch label after {attempts} attempts")]
    LabelsExhausted { attempts: u32 },

    #[error("failed to format patch label: {0}")]
    Label(#[from] time::error::Format),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ChainError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        ChainError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn collaborator(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ChainError::Collaborator {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}
