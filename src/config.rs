use std::time::Duration;

use crate::digest::DigestAlgorithm;
use crate::naming::LabelPolicy;
use crate::tools::{Compressor, EdDiff};

/// Patches kept per index file unless configured otherwise.
pub const DEFAULT_MAX_HISTORY: usize = 14;

/// Tunables for one hook invocation.
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub max_history: usize,
    pub digest: DigestAlgorithm,
    pub differ: EdDiff,
    pub compressor: Compressor,
    pub labels: LabelPolicy,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            digest: DigestAlgorithm::Sha1,
            differ: EdDiff::default(),
            compressor: Compressor::default(),
            labels: LabelPolicy {
                retry_delay: Duration::from_secs(2),
                max_attempts: 30,
            },
        }
    }
}
