use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::artifact::ArtifactDir;
use crate::error::ChainError;
use crate::manifest::Manifest;

/// Source of the wall-clock time patch labels are derived from.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// How hard to look for a free label.
#[derive(Debug, Clone, Copy)]
pub struct LabelPolicy {
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

/// Format a label as `YYYY-MM-DD-HHMM.SS`; labels sort chronologically.
pub fn format_label(at: OffsetDateTime) -> Result<String, ChainError> {
    let format = format_description!("[year]-[month]-[day]-[hour][minute].[second]");
    Ok(at.format(&format)?)
}

/// Pick a label that no existing patch uses and that sorts after every
/// label already in the chain.
///
/// Two hooks running within the same second would otherwise write the same
/// artifact, and a clock that stepped backwards would file the new patch in
/// the middle of the chain; either way, wait and ask the clock again.
pub async fn resolve_label<K: Clock>(
    clock: &K,
    artifacts: &ArtifactDir,
    manifest: &Manifest,
    policy: LabelPolicy,
) -> Result<String, ChainError> {
    let newest = manifest.history.keys().next_back();
    for attempt in 1..=policy.max_attempts {
        let label = format_label(clock.now())?;
        if newest.is_some_and(|newest| label.as_str() <= newest.as_str()) {
            tracing::warn!(
                label = %label,
                newest = newest.map(String::as_str).unwrap_or_default(),
                attempt,
                "label does not sort after the newest patch, waiting a bit"
            );
        } else if artifacts.exists(&label) {
            tracing::warn!(
                label = %label,
                attempt,
                "patch already exists for this label, waiting a bit"
            );
        } else {
            return Ok(label);
        }
        tokio::time::sleep(policy.retry_delay).await;
    }
    Err(ChainError::LabelsExhausted {
        attempts: policy.max_attempts,
    })
}


#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::testing::SteppingClock;
    use super::*;
    use crate::digest::Signature;
    use crate::manifest::PatchRecord;

    fn policy(max_attempts: u32) -> LabelPolicy {
        LabelPolicy {
            retry_delay: Duration::ZERO,
            max_attempts,
        }
    }

    #[test]
    fn test_label_format() {
        let label = format_label(datetime!(2026-10-19 14:02:07 UTC)).unwrap();
        assert_eq!(label, "2026-10-19-1402.07");
    }

    #[test]
    fn test_labels_sort_chronologically() {
        let a = format_label(datetime!(2026-09-30 23:59:59 UTC)).unwrap();
        let b = format_label(datetime!(2026-10-01 00:00:00 UTC)).unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_free_label_taken_first_try() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path(), ".gz");
        let clock = SteppingClock::new(datetime!(2026-10-19 14:02:07 UTC), time::Duration::SECOND);

        let label = resolve_label(&clock, &artifacts, &Manifest::default(), policy(5))
            .await
            .unwrap();
        assert_eq!(label, "2026-10-19-1402.07");
        assert_eq!(clock.reads(), 1);
    }

    #[tokio::test]
    async fn test_collision_picks_next_label() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path(), ".gz");
        std::fs::write(artifacts.compressed_path("2026-10-19-1402.07"), b"taken").unwrap();
        let clock = SteppingClock::new(datetime!(2026-10-19 14:02:07 UTC), time::Duration::SECOND);

        let label = resolve_label(&clock, &artifacts, &Manifest::default(), policy(5))
            .await
            .unwrap();
        assert_eq!(label, "2026-10-19-1402.08");
        assert!(!artifacts.exists(&label));
        assert_eq!(clock.reads(), 2);
    }

    #[tokio::test]
    async fn test_label_already_in_chain_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path(), ".gz");
        let mut manifest = Manifest::default();
        manifest.history.insert(
            "2026-10-19-1402.07".into(),
            PatchRecord {
                from: Signature::new("f", 1),
                patch: Signature::new("p", 1),
            },
        );
        let clock = SteppingClock::new(datetime!(2026-10-19 14:02:07 UTC), time::Duration::SECOND);

        let label = resolve_label(&clock, &artifacts, &manifest, policy(5)).await.unwrap();
        assert_eq!(label, "2026-10-19-1402.08");
    }

    #[tokio::test]
    async fn test_label_older_than_chain_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path(), ".gz");
        let mut manifest = Manifest::default();
        manifest.history.insert(
            "2026-10-19-1402.09".into(),
            PatchRecord {
                from: Signature::new("f", 1),
                patch: Signature::new("p", 1),
            },
        );
        // Clock is two seconds behind the newest patch.
        let clock = SteppingClock::new(datetime!(2026-10-19 14:02:07 UTC), time::Duration::SECOND);

        let label = resolve_label(&clock, &artifacts, &manifest, policy(5)).await.unwrap();
        assert_eq!(label, "2026-10-19-1402.10");
        assert_eq!(clock.reads(), 4);
    }

    #[tokio::test]
    async fn test_clock_far_behind_chain_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path(), ".gz");
        let mut manifest = Manifest::default();
        manifest.history.insert(
            "2026-10-19-2000.00".into(),
            PatchRecord {
                from: Signature::new("f", 1),
                patch: Signature::new("p", 1),
            },
        );
        let clock = SteppingClock::new(datetime!(2026-10-19 13:30:00 UTC), time::Duration::SECOND);

        let err = resolve_label(&clock, &artifacts, &manifest, policy(3)).await.unwrap_err();
        assert!(matches!(err, ChainError::LabelsExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_stuck_clock_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path(), ".gz");
        std::fs::write(artifacts.raw_path("2026-10-19-1402.07"), b"taken").unwrap();
        let clock = SteppingClock::new(datetime!(2026-10-19 14:02:07 UTC), time::Duration::ZERO);

        let err = resolve_label(&clock, &artifacts, &Manifest::default(), policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::LabelsExhausted { attempts: 3 }));
        assert_eq!(clock.reads(), 3);
    }
}
