// logsieve - app/memory.rs
//
// Runtime side of the memory usage policy: resolves the active quota,
// answers cache retention requests, sheds caches and pauses new passes
// while a group is over quota.
//
// Only recomputable caches are ever shed; entities and match sets are
// never touched here.

use crate::core::group::RecordGroup;
use crate::core::policy::{CacheRetention, MemoryUsagePolicy};
use crate::platform::memory::available_memory_bytes;
use crate::util::constants::{MEMORY_SAMPLE_REFRESH_MS, PAUSE_CHECK_INTERVAL_MS};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

type MemorySampler = fn() -> Option<u64>;

/// Policy holder shared by a session and its processors.
pub struct MemoryGovernor {
    policy: RwLock<MemoryUsagePolicy>,
    max_pause: Duration,
    sampler: MemorySampler,
    last_sample: Mutex<Option<(Instant, Option<u64>)>>,
}

impl MemoryGovernor {
    pub fn new(policy: MemoryUsagePolicy, max_pause: Duration) -> Self {
        Self::with_sampler(policy, max_pause, available_memory_bytes)
    }

    /// Governor with a custom system memory sampler.
    pub fn with_sampler(policy: MemoryUsagePolicy, max_pause: Duration, sampler: MemorySampler) -> Self {
        Self {
            policy: RwLock::new(policy),
            max_pause,
            sampler,
            last_sample: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> MemoryUsagePolicy {
        *self
            .policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_policy(&self, policy: MemoryUsagePolicy) {
        let mut current = self
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != policy {
            tracing::info!(from = %*current, to = %policy, "Memory usage policy changed");
            *current = policy;
        }
    }

    fn available(&self) -> Option<u64> {
        let mut last = self
            .last_sample
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let refresh = Duration::from_millis(MEMORY_SAMPLE_REFRESH_MS);
        match *last {
            Some((at, value)) if at.elapsed() < refresh => value,
            _ => {
                let value = (self.sampler)();
                *last = Some((Instant::now(), value));
                value
            }
        }
    }

    /// Active quota in bytes, `None` when unlimited.
    pub fn quota_bytes(&self) -> Option<u64> {
        let policy = self.policy();
        let available = if policy.needs_system_memory() {
            self.available()
        } else {
            None
        };
        policy.quota_bytes(available)
    }

    /// Whether `bytes` more may be retained on top of `usage`.
    pub fn may_retain(&self, usage: usize, bytes: usize) -> bool {
        within(self.quota_bytes(), usage, bytes)
    }

    pub fn is_over_quota(&self, usage: usize) -> bool {
        self.quota_bytes().is_some_and(|quota| usage as u64 > quota)
    }

    /// Retention decisions against `group`, with the quota resolved once.
    pub fn retention_for<'a>(&self, group: &'a RecordGroup) -> GroupRetention<'a> {
        GroupRetention {
            group,
            quota: self.quota_bytes(),
        }
    }

    /// Shed `group`'s caches if it is over quota. Returns bytes freed.
    pub fn relieve(&self, group: &RecordGroup) -> usize {
        let usage = group.memory_usage();
        if !self.is_over_quota(usage) {
            return 0;
        }
        let freed = group.shed_caches();
        tracing::info!(
            group = group.id(),
            usage,
            freed,
            quota = ?self.quota_bytes(),
            "Memory quota exceeded; shed caches"
        );
        freed
    }

    /// Pause while `group` stays over quota, for at most the configured
    /// pause, re-checking `keep_waiting` every interval. Returns the time
    /// spent waiting.
    pub fn throttle(&self, group: &RecordGroup, keep_waiting: impl Fn() -> bool) -> Duration {
        let started = Instant::now();
        if !self.is_over_quota(group.memory_usage()) {
            return Duration::ZERO;
        }
        tracing::debug!(
            group = group.id(),
            usage = group.memory_usage(),
            max_pause_ms = self.max_pause.as_millis() as u64,
            "Pausing until memory usage falls under quota"
        );
        let interval = Duration::from_millis(PAUSE_CHECK_INTERVAL_MS);
        while started.elapsed() < self.max_pause
            && keep_waiting()
            && self.is_over_quota(group.memory_usage())
        {
            std::thread::sleep(interval.min(self.max_pause.saturating_sub(started.elapsed())));
        }
        started.elapsed()
    }
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("policy", &self.policy())
            .field("max_pause", &self.max_pause)
            .finish()
    }
}

fn within(quota: Option<u64>, usage: usize, bytes: usize) -> bool {
    quota.map_or(true, |quota| (usage as u64).saturating_add(bytes as u64) <= quota)
}

/// Cache retention bound to one group and a resolved quota.
pub struct GroupRetention<'a> {
    group: &'a RecordGroup,
    quota: Option<u64>,
}

impl CacheRetention for GroupRetention<'_> {
    fn may_retain(&self, bytes: usize) -> bool {
        within(self.quota, self.group.memory_usage(), bytes)
    }
}
