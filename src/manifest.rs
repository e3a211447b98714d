use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::artifact::ArtifactDir;
use crate::digest::{DigestAlgorithm, Signature};
use crate::error::ChainError;

/// Name of the committed manifest inside a `.diff` directory.
pub const MANIFEST_NAME: &str = "Index";
/// Name the new manifest is staged under; the caller renames it into place.
pub const STAGED_NAME: &str = "Index.new";

/// One link of the chain: the snapshot a patch starts from, and the patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub from: Signature,
    pub patch: Signature,
}

/// In-memory form of an `Index` document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub canonical_path: Option<String>,
    /// Signature of the snapshot most recently diffed into the chain.
    pub current: Option<Signature>,
    /// Ordered by label, which sorts chronologically.
    pub history: BTreeMap<String, PatchRecord>,
}

/// A line the lenient parser ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    pub line_number: usize,
    pub line: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedManifest {
    pub manifest: Manifest,
    /// Algorithm named by the first checksum field, if any.
    pub algorithm: Option<DigestAlgorithm>,
    pub skipped: Vec<SkippedLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    None,
    History,
    Patches,
}

/// Parse one ` <digest> <size> <label>` entry.
fn parse_entry(line: &str) -> Option<(String, Signature)> {
    let mut fields = line.split_whitespace();
    let digest = fields.next()?;
    let size = fields.next()?.parse().ok()?;
    let label = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    Some((label.to_string(), Signature::new(digest, size)))
}

/// Parse an `Index` document, skipping anything malformed instead of failing.
pub fn parse(text: &str) -> ParsedManifest {
    let mut parsed = ParsedManifest::default();
    let mut halves: BTreeMap<String, (Option<Signature>, Option<Signature>)> = BTreeMap::new();
    let mut block = Block::None;

    for (idx, line) in text.lines().enumerate() {
        let mut skip = |reason: &'static str| {
            parsed.skipped.push(SkippedLine {
                line_number: idx + 1,
                line: line.to_string(),
                reason,
            })
        };

        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            let slot = match block {
                Block::None => {
                    skip("continuation line outside a checksum block");
                    continue;
                }
                Block::History => 0,
                Block::Patches => 1,
            };
            match parse_entry(line) {
                Some((label, sig)) => {
                    let entry = halves.entry(label).or_default();
                    if slot == 0 {
                        entry.0 = Some(sig);
                    } else {
                        entry.1 = Some(sig);
                    }
                }
                None => skip("malformed checksum entry"),
            }
            continue;
        }

        block = Block::None;
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else { continue };
        let values: Vec<&str> = fields.collect();

        if key == "Canonical-Path:" || key == "Canonical-Name:" {
            match values.as_slice() {
                [path] => parsed.manifest.canonical_path = Some((*path).to_string()),
                _ => skip("canonical path needs exactly one value"),
            }
            continue;
        }

        let Some((prefix, field)) = key
            .strip_suffix(':')
            .and_then(|name| name.rsplit_once('-'))
        else {
            skip("unrecognised line");
            continue;
        };
        let Some(algorithm) = DigestAlgorithm::from_field_prefix(prefix) else {
            skip("unknown field");
            continue;
        };
        if !matches!(field, "Current" | "History" | "Patches") {
            skip("unknown field");
            continue;
        }
        match parsed.algorithm {
            None => parsed.algorithm = Some(algorithm),
            Some(seen) if seen != algorithm => {
                skip("checksum field for a second algorithm");
                continue;
            }
            Some(_) => {}
        }

        match field {
            "Current" => match values.as_slice() {
                [digest, size] => match size.parse() {
                    Ok(size) => parsed.manifest.current = Some(Signature::new(*digest, size)),
                    Err(_) => skip("current size is not a number"),
                },
                _ => skip("current signature needs a digest and a size"),
            },
            "History" => block = Block::History,
            _ => block = Block::Patches,
        }
    }

    for (label, pair) in halves {
        match pair {
            (Some(from), Some(patch)) => {
                parsed.manifest.history.insert(label, PatchRecord { from, patch });
            }
            _ => parsed.skipped.push(SkippedLine {
                line_number: 0,
                line: label,
                reason: "label listed in only one of History and Patches",
            }),
        }
    }

    parsed
}

impl Manifest {
    /// Drop the oldest records until at most `max_history` remain.
    /// Returns the evicted labels, oldest first.
    pub fn rotate(&mut self, max_history: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.history.len() > max_history {
            match self.history.pop_first() {
                Some((label, _)) => evicted.push(label),
                None => break,
            }
        }
        evicted
    }

    /// Render the document; the History and Patches blocks share label order.
    pub fn render(&self, algorithm: DigestAlgorithm) -> String {
        let prefix = algorithm.field_prefix();
        let mut out = String::new();

        if let Some(path) = &self.canonical_path {
            let _ = writeln!(out, "Canonical-Path: {path}");
        }
        if let Some(current) = &self.current {
            let _ = writeln!(out, "{prefix}-Current: {} {:>7}", current.digest, current.size);
        }

        let _ = writeln!(out, "{prefix}-History:");
        for (label, record) in &self.history {
            let _ = writeln!(out, " {} {:>7} {label}", record.from.digest, record.from.size);
        }
        let _ = writeln!(out, "{prefix}-Patches:");
        for (label, record) in &self.history {
            let _ = writeln!(out, " {} {:>7} {label}", record.patch.digest, record.patch.size);
        }
        out
    }
}

/// Result of staging a manifest.
#[derive(Debug, Clone)]
pub struct Staged {
    pub path: PathBuf,
    pub evicted: Vec<String>,
}

/// Reads and stages the manifest of one `.diff` directory.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    artifacts: ArtifactDir,
    algorithm: DigestAlgorithm,
    max_history: usize,
}

impl ManifestStore {
    pub fn new(artifacts: ArtifactDir, algorithm: DigestAlgorithm, max_history: usize) -> Self {
        Self {
            artifacts,
            algorithm,
            max_history,
        }
    }

    pub fn committed_path(&self) -> PathBuf {
        self.artifacts.dir().join(MANIFEST_NAME)
    }

    pub fn staged_path(&self) -> PathBuf {
        self.artifacts.dir().join(STAGED_NAME)
    }

    /// Load the committed manifest; a missing file is an empty chain.
    pub fn load(&self) -> Result<ParsedManifest, ChainError> {
        let path = self.committed_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ParsedManifest::default());
            }
            Err(e) => return Err(ChainError::io(&path, e)),
        };

        let parsed = parse(&text);
        for skipped in &parsed.skipped {
            tracing::warn!(
                manifest = %path.display(),
                line = skipped.line_number,
                content = %skipped.line,
                reason = skipped.reason,
                "skipping manifest line"
            );
        }
        if let Some(found) = parsed.algorithm {
            if found != self.algorithm {
                return Err(ChainError::AlgorithmMismatch {
                    found,
                    expected: self.algorithm,
                });
            }
        }
        Ok(parsed)
    }

    /// Rotate the chain, delete evicted patches and render the document.
    pub fn serialize(&self, manifest: &mut Manifest) -> (Vec<u8>, Vec<String>) {
        let evicted = manifest.rotate(self.max_history);
        for label in &evicted {
            tracing::info!(label = %label, "evicting patch beyond history limit");
            self.artifacts.remove(label);
        }
        (manifest.render(self.algorithm).into_bytes(), evicted)
    }

    /// Write the rotated manifest next to the committed one, never over it.
    pub fn stage(&self, manifest: &mut Manifest) -> Result<Staged, ChainError> {
        let (bytes, evicted) = self.serialize(manifest);
        let path = self.staged_path();
        std::fs::write(&path, bytes).map_err(|e| ChainError::io(&path, e))?;
        Ok(Staged { path, evicted })
    }
}

/// True if `dir` holds a committed manifest.
pub fn has_committed(dir: &Path) -> bool {
    dir.join(MANIFEST_NAME).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Canonical-Path: dists/sid/main/binary-amd64/Packages
SHA1-Current: 2f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c  123456
SHA1-History:
 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa  120000 2026-10-18-0900.12
 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb  121000 2026-10-19-0900.45
SHA1-Patches:
 cccccccccccccccccccccccccccccccccccccccc     512 2026-10-18-0900.12
 dddddddddddddddddddddddddddddddddddddddd     640 2026-10-19-0900.45
";

    fn record(from: (&str, u64), patch: (&str, u64)) -> PatchRecord {
        PatchRecord {
            from: Signature::new(from.0, from.1),
            patch: Signature::new(patch.0, patch.1),
        }
    }

    #[test]
    fn test_parse_full_document() {
        let parsed = parse(SAMPLE);
        assert!(parsed.skipped.is_empty(), "{:?}", parsed.skipped);
        assert_eq!(parsed.algorithm, Some(DigestAlgorithm::Sha1));

        let m = parsed.manifest;
        assert_eq!(m.canonical_path.as_deref(), Some("dists/sid/main/binary-amd64/Packages"));
        assert_eq!(
            m.current,
            Some(Signature::new("2f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c", 123456))
        );
        assert_eq!(m.history.len(), 2);
        assert_eq!(
            m.history["2026-10-19-0900.45"],
            record(("b".repeat(40).as_str(), 121000), ("d".repeat(40).as_str(), 640))
        );
    }

    #[test]
    fn test_render_layout() {
        let mut m = Manifest::default();
        m.current = Some(Signature::new("d2", 120));
        m.history.insert("label1".into(), record(("d1", 100), ("dP", 42)));

        let text = m.render(DigestAlgorithm::Sha1);
        assert_eq!(
            text,
            "SHA1-Current: d2     120\n\
             SHA1-History:\n d1     100 label1\n\
             SHA1-Patches:\n dP      42 label1\n"
        );
    }

    #[test]
    fn test_empty_manifest_still_has_blocks() {
        let text = Manifest::default().render(DigestAlgorithm::Sha256);
        assert_eq!(text, "SHA256-History:\nSHA256-Patches:\n");
    }

    #[test]
    fn test_render_then_parse_is_identity() {
        let parsed = parse(SAMPLE);
        let rendered = parsed.manifest.render(DigestAlgorithm::Sha1);
        let reparsed = parse(&rendered);
        assert!(reparsed.skipped.is_empty());
        assert_eq!(reparsed.manifest, parsed.manifest);
    }

    #[test]
    fn test_malformed_lines_are_reported() {
        let text = concat!(
            " orphan 1 label\n",
            "SHA1-Current: abc\n",
            "SHA1-History:\n",
            " d1 notanumber l1\n",
            " d1 100 l2\n",
            "SHA1-Patches:\n",
            " p2 10 l2\n",
            " p3 11 l3\n",
            "X-Unknown: value\n",
        );
        let parsed = parse(text);
        let reasons: Vec<_> = parsed.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![
                "continuation line outside a checksum block",
                "current signature needs a digest and a size",
                "malformed checksum entry",
                "unknown field",
                "label listed in only one of History and Patches",
            ]
        );
        assert_eq!(parsed.skipped[0].line_number, 1);
        assert_eq!(parsed.manifest.current, None);
        assert_eq!(parsed.manifest.history.len(), 1);
        assert!(parsed.manifest.history.contains_key("l2"));
    }

    #[test]
    fn test_canonical_name_alias() {
        let parsed = parse("Canonical-Name: Sources\n");
        assert_eq!(parsed.manifest.canonical_path.as_deref(), Some("Sources"));
        assert_eq!(parsed.algorithm, None);
    }

    #[test]
    fn test_second_algorithm_is_ignored() {
        let text = "\
SHA256-Current: aa 10
SHA1-Current: bb 20
";
        let parsed = parse(text);
        assert_eq!(parsed.algorithm, Some(DigestAlgorithm::Sha256));
        assert_eq!(parsed.manifest.current, Some(Signature::new("aa", 10)));
        assert_eq!(parsed.skipped.len(), 1);
    }

    #[test]
    fn test_rotate_evicts_lowest_labels() {
        let mut m = Manifest::default();
        for i in 0..5 {
            m.history.insert(format!("l{i}"), record(("f", i), ("p", i)));
        }
        let evicted = m.rotate(3);
        assert_eq!(evicted, vec!["l0", "l1"]);
        assert_eq!(m.history.keys().collect::<Vec<_>>(), vec!["l2", "l3", "l4"]);
        assert!(m.rotate(3).is_empty());
    }

    #[test]
    fn test_store_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(
            ArtifactDir::new(dir.path().join("Packages.diff"), ".gz"),
            DigestAlgorithm::Sha1,
            14,
        );
        let parsed = store.load().unwrap();
        assert_eq!(parsed.manifest, Manifest::default());
    }

    #[test]
    fn test_store_rejects_other_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_NAME), SAMPLE).unwrap();
        let store = ManifestStore::new(
            ArtifactDir::new(dir.path(), ".gz"),
            DigestAlgorithm::Blake3,
            14,
        );
        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            ChainError::AlgorithmMismatch {
                found: DigestAlgorithm::Sha1,
                expected: DigestAlgorithm::Blake3
            }
        ));
    }

    #[test]
    fn test_stage_rotates_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path(), ".gz");
        let store = ManifestStore::new(artifacts.clone(), DigestAlgorithm::Sha1, 2);

        let mut m = Manifest::default();
        for label in ["a", "b", "c"] {
            std::fs::write(artifacts.compressed_path(label), b"patch").unwrap();
            m.history.insert(label.into(), record(("f", 1), ("p", 1)));
        }
        std::fs::write(store.committed_path(), b"untouched").unwrap();

        let staged = store.stage(&mut m).unwrap();
        assert_eq!(staged.path, dir.path().join(STAGED_NAME));
        assert_eq!(staged.evicted, vec!["a"]);
        assert!(!artifacts.exists("a"));
        assert!(artifacts.exists("b"));
        assert_eq!(std::fs::read(store.committed_path()).unwrap(), b"untouched");

        let reloaded = parse(&std::fs::read_to_string(&staged.path).unwrap());
        assert_eq!(reloaded.manifest.history.keys().collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
