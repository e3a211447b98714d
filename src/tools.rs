use std::path::{Path, PathBuf};
use std::process::Stdio;

use clap::ValueEnum;
use tokio::process::Command;

use crate::error::ChainError;

/// Produces an ed-script patch by running an external `diff`.
#[derive(Debug, Clone)]
pub struct EdDiff {
    pub program: PathBuf,
}

impl Default for EdDiff {
    fn default() -> Self {
        Self {
            program: PathBuf::from("diff"),
        }
    }
}

impl EdDiff {
    /// Write the ed script turning `old` into `new` to `output`.
    pub async fn generate(&self, old: &Path, new: &Path, output: &Path) -> Result<(), ChainError> {
        let out = std::fs::File::create(output).map_err(|e| ChainError::io(output, e))?;
        let tool = self.program.display().to_string();

        let status = Command::new(&self.program)
            .arg("-e")
            .arg(old)
            .arg(new)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .status()
            .await
            .map_err(|e| ChainError::collaborator(&tool, format!("could not start: {e}")))?;

        // diff exits 1 when the inputs differ, which is the expected case.
        match status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(ChainError::collaborator(tool, format!("exited with {status}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompressorKind {
    Gzip,
    Zstd,
}

/// Compresses a finished patch in place, replacing it with `<patch><ext>`.
#[derive(Debug, Clone)]
pub enum Compressor {
    /// External gzip, the format apt clients fetch.
    Gzip { program: PathBuf, level: u32 },
    Zstd { level: i32 },
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor::Gzip {
            program: PathBuf::from("gzip"),
            level: 9,
        }
    }
}

impl Compressor {
    pub fn extension(&self) -> &'static str {
        match self {
            Compressor::Gzip { .. } => ".gz",
            Compressor::Zstd { .. } => ".zst",
        }
    }

    /// Compress `patch`, returning the path of the compressed file.
    pub async fn compress(&self, patch: &Path) -> Result<PathBuf, ChainError> {
        let mut target = patch.as_os_str().to_owned();
        target.push(self.extension());
        let target = PathBuf::from(target);

        match self {
            Compressor::Gzip { program, level } => {
                let tool = program.display().to_string();
                // -n keeps the name and mtime out of the header so output is reproducible.
                let status = Command::new(program)
                    .arg(format!("-{level}"))
                    .arg("-n")
                    .arg("-f")
                    .arg(patch)
                    .stdin(Stdio::null())
                    .status()
                    .await
                    .map_err(|e| ChainError::collaborator(&tool, format!("could not start: {e}")))?;
                if !status.success() {
                    return Err(ChainError::collaborator(tool, format!("exited with {status}")));
                }
                if !target.is_file() {
                    return Err(ChainError::collaborator(
                        tool,
                        format!("did not produce {}", target.display()),
                    ));
                }
            }
            Compressor::Zstd { level } => {
                let level = *level;
                let src = patch.to_path_buf();
                let dst = target.clone();
                tokio::task::spawn_blocking(move || zstd_file(&src, &dst, level)).await??;
            }
        }
        Ok(target)
    }
}

fn zstd_file(src: &Path, dst: &Path, level: i32) -> Result<(), ChainError> {
    let input = std::fs::File::open(src).map_err(|e| ChainError::io(src, e))?;
    let output = std::fs::File::create(dst).map_err(|e| ChainError::io(dst, e))?;
    zstd::stream::copy_encode(input, output, level)
        .map_err(|e| ChainError::collaborator("zstd", e.to_string()))?;
    std::fs::remove_file(src).map_err(|e| ChainError::io(src, e))
}
