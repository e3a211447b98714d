mod artifact;
mod config;
mod digest;
mod error;
mod hook;
mod manifest;
mod naming;
mod tools;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{HookConfig, DEFAULT_MAX_HISTORY};
use crate::digest::DigestAlgorithm;
use crate::hook::{Invocation, Mode, Outcome, PdiffHook};
use crate::naming::LabelPolicy;
use crate::tools::{Compressor, CompressorKind, EdDiff};

#[derive(Parser)]
#[command(
    name = "pdiff-hook",
    version,
    about = "Maintain ed-style pdiffs for Packages/Sources index files",
    long_about = "Maintain ed-style pdiffs for Packages/Sources index files.\n\n\
        Intended to be called by a repository manager as an index hook. The path of\n\
        the manifest to publish is written as a single line to --report-fd, or to\n\
        stdout when no descriptor is given. Managers that read the report from fd 3\n\
        need PDIFF_REPORT_FD=3 (or --report-fd 3)."
)]
struct Cli {
    /// Repository directory the index paths are relative to
    directory: PathBuf,
    /// Index file about to replace the old one
    new_file: PathBuf,
    /// Index file currently published
    old_file: PathBuf,
    /// `old`, `new`, or anything else to generate a diff
    mode: String,

    /// Number of patches to keep per index file
    #[arg(
        long,
        env = "PDIFF_MAX_HISTORY",
        default_value_t = DEFAULT_MAX_HISTORY as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_history: u64,
    /// Checksum algorithm for signatures in the manifest
    #[arg(long, env = "PDIFF_DIGEST", value_enum, default_value_t = DigestAlgorithm::Sha1)]
    digest: DigestAlgorithm,
    /// Compression applied to each patch
    #[arg(long, env = "PDIFF_COMPRESSOR", value_enum, default_value_t = CompressorKind::Gzip)]
    compressor: CompressorKind,
    /// Compression level (default 9 for gzip, 19 for zstd)
    #[arg(long, env = "PDIFF_LEVEL")]
    level: Option<i32>,
    /// diff program producing ed scripts
    #[arg(long, env = "PDIFF_DIFF_PROGRAM", default_value = "diff")]
    diff_program: PathBuf,
    /// gzip program
    #[arg(long, env = "PDIFF_GZIP_PROGRAM", default_value = "gzip")]
    gzip_program: PathBuf,
    /// Wait before retrying when a patch label is already taken
    #[arg(long, env = "PDIFF_LABEL_RETRY_MS", default_value_t = 2000)]
    label_retry_ms: u64,
    /// Give up after this many taken labels
    #[arg(
        long,
        env = "PDIFF_MAX_LABEL_ATTEMPTS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    max_label_attempts: u32,
    /// Already-open file descriptor receiving the report line (unix only).
    ///
    /// Without it the report goes to stdout. Repository managers following the
    /// classic hook protocol read fd 3, so set `PDIFF_REPORT_FD=3` for them.
    #[arg(long, env = "PDIFF_REPORT_FD")]
    report_fd: Option<i32>,
}

impl Cli {
    fn config(&self) -> anyhow::Result<HookConfig> {
        let compressor = match self.compressor {
            CompressorKind::Gzip => {
                let level = self.level.unwrap_or(9);
                anyhow::ensure!(
                    (1..=9).contains(&level),
                    "gzip level must be 1-9, got {level}"
                );
                Compressor::Gzip {
                    program: self.gzip_program.clone(),
                    level: level as u32,
                }
            }
            CompressorKind::Zstd => {
                let level = self.level.unwrap_or(19);
                anyhow::ensure!(
                    (1..=22).contains(&level),
                    "zstd level must be 1-22, got {level}"
                );
                Compressor::Zstd { level }
            }
        };

        Ok(HookConfig {
            max_history: usize::try_from(self.max_history)
                .context("--max-history is too large")?,
            digest: self.digest,
            differ: EdDiff {
                program: self.diff_program.clone(),
            },
            compressor,
            labels: LabelPolicy {
                retry_delay: Duration::from_millis(self.label_retry_ms),
                max_attempts: self.max_label_attempts,
            },
        })
    }

    fn invocation(&self) -> Invocation {
        Invocation {
            workdir: self.directory.clone(),
            new_file: self.new_file.clone(),
            old_file: self.old_file.clone(),
            mode: Mode::from_arg(&self.mode),
        }
    }
}

/// Where the report line goes.
enum ReportSink {
    Stdout,
    Fd { fd: i32, file: std::fs::File },
}

impl ReportSink {
    /// Open the caller's descriptor up front, so a descriptor that was never
    /// passed in fails the run before anything is staged.
    fn open(report_fd: Option<i32>) -> anyhow::Result<Self> {
        match report_fd {
            None => Ok(ReportSink::Stdout),
            Some(fd) => Ok(ReportSink::Fd {
                fd,
                file: open_fd(fd)?,
            }),
        }
    }

    /// Hand the manifest path to the caller.
    fn write(self, path: &Path) -> anyhow::Result<()> {
        let line = path.to_str().context("report path is not valid UTF-8")?;
        match self {
            ReportSink::Stdout => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{line}").context("Failed to write report to stdout")?;
            }
            ReportSink::Fd { fd, mut file } => {
                writeln!(file, "{line}")
                    .with_context(|| format!("Failed to write report to fd {fd}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn open_fd(fd: i32) -> anyhow::Result<std::fs::File> {
    anyhow::ensure!(fd >= 0, "--report-fd must not be negative, got {fd}");
    std::fs::OpenOptions::new()
        .append(true)
        .open(format!("/dev/fd/{fd}"))
        .with_context(|| format!("Report descriptor {fd} is not open for writing"))
}

#[cfg(not(unix))]
fn open_fd(_fd: i32) -> anyhow::Result<std::fs::File> {
    anyhow::bail!("--report-fd is only supported on unix")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;
    let invocation = cli.invocation();
    // Before the runtime exists, so its own descriptors can't be mistaken for the caller's.
    let report = ReportSink::open(cli.report_fd)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    let start = Instant::now();
    let outcome = runtime
        .block_on(PdiffHook::new(config).run(&invocation))
        .with_context(|| format!("pdiff for {} failed", invocation.old_file.display()))?;

    if let Outcome::Published { label, evicted, .. } = &outcome {
        tracing::info!(
            label = %label,
            evicted = evicted.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "patch published"
        );
    }
    if let Some(path) = outcome.report() {
        report.write(path)?;
    }

    Ok(())
}
