use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::artifact::ArtifactDir;
use crate::config::HookConfig;
use crate::digest;
use crate::error::ChainError;
use crate::manifest::{self, ManifestStore, PatchRecord, MANIFEST_NAME, STAGED_NAME};
use crate::naming::{self, Clock, SystemClock};

/// Suffix of the directory holding an index file's patches.
pub const DIFF_DIR_SUFFIX: &str = ".diff";

/// Old snapshots with these extensions are compressed variants and are never diffed.
const COMPRESSED_EXTENSIONS: &[&str] = &["gz", "bz2", "xz", "lzma", "zst"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// The old file is being kept; report its manifest if there is one.
    Old,
    /// A brand-new index file; nothing to do yet.
    New,
    /// The index changed; diff old against new.
    Change,
}

impl Mode {
    pub fn from_arg(arg: &str) -> Self {
        match arg {
            "old" => Mode::Old,
            "new" => Mode::New,
            _ => Mode::Change,
        }
    }
}

/// One call from the repository manager. Snapshot paths are relative to `workdir`.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub workdir: PathBuf,
    pub new_file: PathBuf,
    pub old_file: PathBuf,
    pub mode: Mode,
}

impl Invocation {
    /// `<old_file>.diff`, relative to the working directory.
    fn diff_dir_rel(&self) -> PathBuf {
        let mut dir = OsString::from(self.old_file.as_os_str());
        dir.push(DIFF_DIR_SUFFIX);
        PathBuf::from(dir)
    }

    fn is_compressed_input(&self) -> bool {
        self.old_file
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| COMPRESSED_EXTENSIONS.contains(&ext))
    }
}

/// How an invocation ended. Every variant is a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    CompressedInput,
    OldMode { manifest: Option<PathBuf> },
    NewMode,
    Unchanged { manifest: Option<PathBuf> },
    Published {
        staged: PathBuf,
        label: String,
        evicted: Vec<String>,
    },
}

impl Outcome {
    /// Manifest the caller should make authoritative, relative to the working directory.
    pub fn report(&self) -> Option<&Path> {
        match self {
            Outcome::OldMode { manifest } | Outcome::Unchanged { manifest } => manifest.as_deref(),
            Outcome::Published { staged, .. } => Some(staged),
            Outcome::CompressedInput | Outcome::NewMode => None,
        }
    }
}

/// Drives one snapshot transition through the patch chain.
pub struct PdiffHook<K = SystemClock> {
    config: HookConfig,
    clock: K,
}

impl PdiffHook<SystemClock> {
    pub fn new(config: HookConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<K: Clock> PdiffHook<K> {
    pub fn with_clock(config: HookConfig, clock: K) -> Self {
        Self { config, clock }
    }

    pub async fn run(&self, inv: &Invocation) -> Result<Outcome, ChainError> {
        if inv.is_compressed_input() {
            tracing::debug!(old = %inv.old_file.display(), "compressed index, not diffing");
            return Ok(Outcome::CompressedInput);
        }

        let diff_rel = inv.diff_dir_rel();
        let diff_dir = inv.workdir.join(&diff_rel);
        let existing = manifest::has_committed(&diff_dir).then(|| diff_rel.join(MANIFEST_NAME));

        match inv.mode {
            Mode::Old => return Ok(Outcome::OldMode { manifest: existing }),
            // TODO: drop a stale Index and patches left from an earlier life of this file.
            Mode::New => return Ok(Outcome::NewMode),
            Mode::Change => {}
        }

        let old_path = inv.workdir.join(&inv.old_file);
        let new_path = inv.workdir.join(&inv.new_file);
        tracing::info!(
            old = %old_path.display(),
            new = %new_path.display(),
            "making diffs"
        );

        let artifacts = ArtifactDir::new(&diff_dir, self.config.compressor.extension());
        let store = ManifestStore::new(
            artifacts.clone(),
            self.config.digest,
            self.config.max_history,
        );
        let mut manifest = store.load()?.manifest;

        let old_sig = digest::signature_blocking(&old_path, self.config.digest).await?;
        if let Some(recorded) = &manifest.current {
            if *recorded != old_sig {
                return Err(ChainError::Consistency {
                    recorded: recorded.clone(),
                    actual: old_sig,
                });
            }
        }

        let new_sig = digest::signature_blocking(&new_path, self.config.digest).await?;
        if new_sig == old_sig {
            tracing::info!("file unchanged, not generating diff");
            return Ok(Outcome::Unchanged { manifest: existing });
        }

        std::fs::create_dir_all(&diff_dir).map_err(|e| ChainError::io(&diff_dir, e))?;
        let label =
            naming::resolve_label(&self.clock, &artifacts, &manifest, self.config.labels).await?;
        let patch_path = artifacts.raw_path(&label);
        tracing::info!(label = %label, "generating diff");

        self.config.differ.generate(&old_path, &new_path, &patch_path).await?;
        let patch_sig = digest::signature_blocking(&patch_path, self.config.digest).await?;
        let compressed = self.config.compressor.compress(&patch_path).await?;
        tracing::debug!(patch = %compressed.display(), size = patch_sig.size, "patch written");

        manifest.history.insert(
            label.clone(),
            PatchRecord {
                from: old_sig,
                patch: patch_sig,
            },
        );
        manifest.current = Some(new_sig);

        let staged = store.stage(&mut manifest)?;
        tracing::info!(
            manifest = %staged.path.display(),
            patches = manifest.history.len(),
            evicted = staged.evicted.len(),
            "staged manifest"
        );

        Ok(Outcome::Published {
            staged: diff_rel.join(STAGED_NAME),
            label,
            evicted: staged.evicted,
        })
    }
}
