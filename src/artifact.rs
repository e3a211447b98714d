use std::path::{Path, PathBuf};

/// Directory holding one old snapshot's patches, named by label.
///
/// A patch is written uncompressed as `<dir>/<label>` and lives on as
/// `<dir>/<label><extension>` once the compressor has run.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    dir: PathBuf,
    extension: &'static str,
}

impl ArtifactDir {
    pub fn new(dir: impl Into<PathBuf>, extension: &'static str) -> Self {
        Self {
            dir: dir.into(),
            extension,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn raw_path(&self, label: &str) -> PathBuf {
        self.dir.join(label)
    }

    pub fn compressed_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}{}", self.extension))
    }

    /// True if either form of the artifact is already on disk.
    pub fn exists(&self, label: &str) -> bool {
        self.compressed_path(label).is_file() || self.raw_path(label).is_file()
    }

    /// Remove an evicted patch. Failure only warns: a stale file in the
    /// diff directory is harmless once the manifest stops listing it.
    pub fn remove(&self, label: &str) {
        let path = self.compressed_path(label);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed evicted patch"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "removing evicted patch failed")
            }
        }
        // Left behind when a previous run died between diff and compress.
        let raw = self.raw_path(label);
        if raw.is_file() {
            if let Err(e) = std::fs::remove_file(&raw) {
                tracing::warn!(
                    path = %raw.display(),
                    error = %e,
                    "removing uncompressed patch failed"
                );
            }
        }
    }
}
