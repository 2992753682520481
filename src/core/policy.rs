// logsieve - core/policy.rs
//
// Memory usage policy values and the retention seam entities consult
// before keeping a derived cache.
//
// The policy only ever governs recomputable caches. Entities and filter
// results are never dropped on its account.

use crate::util::constants::{DEFAULT_ADAPTIVE_FALLBACK_BYTES, MIN_ADAPTIVE_QUOTA_BYTES};
use serde::{Deserialize, Serialize};

/// Quota and response strategy for one record group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum MemoryUsagePolicy {
    /// No quota: every cache may be retained.
    #[default]
    Unlimited,

    /// Fixed quota; caches beyond it are shed and not retained.
    Fixed { quota_bytes: u64 },

    /// Quota is a share of currently available system memory.
    Adaptive { percent: u8 },
}

impl MemoryUsagePolicy {
    /// Resolve the quota in bytes. `available` is the measured free system
    /// memory (adaptive policy only). `None` means no limit.
    pub fn quota_bytes(&self, available: Option<u64>) -> Option<u64> {
        match *self {
            Self::Unlimited => None,
            Self::Fixed { quota_bytes } => Some(quota_bytes),
            Self::Adaptive { percent } => {
                let quota = match available {
                    Some(bytes) => bytes.saturating_mul(u64::from(percent)) / 100,
                    None => DEFAULT_ADAPTIVE_FALLBACK_BYTES,
                };
                Some(quota.max(MIN_ADAPTIVE_QUOTA_BYTES))
            }
        }
    }

    /// Whether resolving the quota needs a system memory reading.
    pub fn needs_system_memory(&self) -> bool {
        matches!(self, Self::Adaptive { .. })
    }

    /// Short name used in config files and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unlimited => "unlimited",
            Self::Fixed { .. } => "fixed",
            Self::Adaptive { .. } => "adaptive",
        }
    }
}

impl std::fmt::Display for MemoryUsagePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Fixed { quota_bytes } => {
                write!(f, "fixed ({} MiB)", quota_bytes / (1_024 * 1_024))
            }
            Self::Adaptive { percent } => write!(f, "adaptive ({percent}% of available)"),
        }
    }
}

/// Decides whether an optional cache of `bytes` may be retained.
pub trait CacheRetention {
    fn may_retain(&self, bytes: usize) -> bool;
}

impl<F> CacheRetention for F
where
    F: Fn(usize) -> bool,
{
    fn may_retain(&self, bytes: usize) -> bool {
        self(bytes)
    }
}

/// Retention that always allows caching.
pub struct RetainAll;

impl CacheRetention for RetainAll {
    fn may_retain(&self, _bytes: usize) -> bool {
        true
    }
}
