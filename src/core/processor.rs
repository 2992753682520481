// logsieve - core/processor.rs
//
// Processor lifecycle: identifiers, the state machine, status
// notifications and the shared handle through which a worker thread, its
// owner and the combiner coordinate.
//
// State graph:
//
//   Idle ──► Processing ──► Completed ──► Processing (source grew / resumed)
//     │          │  ▲            │
//     │          │  └ restart    │
//     ▼          ▼               ▼
//   Cancelled ◄──┴───────────────┘      Processing ──► Faulted (terminal)
//     │
//     └──► Processing (fresh full pass)
//
// Every pass runs under a generation number. Cancelling or restarting
// bumps the generation, so work tagged with an older generation is
// recognisably stale wherever it ends up.

use crate::core::source::SourceSequence;
use crate::util::constants::{
    DEFAULT_BACKGROUND_CHUNK_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_REALTIME_CHUNK_SIZE,
};
use crate::util::error::ProcessorError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique processor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(u64);

impl ProcessorId {
    pub fn next() -> Self {
        Self(NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorState {
    Idle,
    Processing,
    Completed,
    Cancelled,
    Faulted,
}

impl ProcessorState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Faulted => "Faulted",
        }
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(&self, next: ProcessorState) -> bool {
        use ProcessorState::*;
        matches!(
            (self, next),
            (Idle, Processing)
                | (Idle, Cancelled)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Cancelled)
                | (Processing, Faulted)
                | (Completed, Processing)
                | (Completed, Cancelled)
                | (Cancelled, Processing)
        )
    }

    /// Cancelled and faulted processors contribute nothing further.
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Faulted)
    }

    fn to_bits(self) -> u8 {
        self as u8
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Processing,
            2 => Self::Completed,
            3 => Self::Cancelled,
            4 => Self::Faulted,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Scheduling priority; selects how many entities a worker evaluates
/// between checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingPriority {
    Realtime,
    #[default]
    Default,
    Background,
}

impl ProcessingPriority {
    pub fn default_chunk_size(&self) -> usize {
        match self {
            Self::Realtime => DEFAULT_REALTIME_CHUNK_SIZE,
            Self::Default => DEFAULT_CHUNK_SIZE,
            Self::Background => DEFAULT_BACKGROUND_CHUNK_SIZE,
        }
    }
}

/// Status notification emitted by a processor handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorStatus {
    pub processor: ProcessorId,
    pub generation: u64,
    pub kind: StatusKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusKind {
    State(ProcessorState),
    /// Fraction of the source evaluated in the current pass, 0.0..=1.0.
    Progress(f64),
    /// A single entity was skipped.
    Warning(String),
    /// Terminal error; followed by `State(Faulted)`.
    Fault(String),
}

// =============================================================================
// Handle
// =============================================================================

struct Lifecycle {
    state: ProcessorState,
    generation: u64,
    fault: Option<String>,
    observers: Vec<Sender<ProcessorStatus>>,
}

struct ProcessorShared {
    id: ProcessorId,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    /// Mirrors of `Lifecycle::generation` and `Lifecycle::state` for
    /// lock-free reads, including from inside `apply_if_current`.
    generation: AtomicU64,
    state: AtomicU8,
    progress_bits: AtomicU64,
    skipped: AtomicUsize,
}

/// Shared lifecycle handle. Cloned into worker threads and the combiner.
#[derive(Clone)]
pub struct ProcessorHandle {
    shared: Arc<ProcessorShared>,
}

impl Default for ProcessorHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                id: ProcessorId::next(),
                lifecycle: Mutex::new(Lifecycle {
                    state: ProcessorState::Idle,
                    generation: 0,
                    fault: None,
                    observers: Vec::new(),
                }),
                changed: Condvar::new(),
                generation: AtomicU64::new(0),
                state: AtomicU8::new(ProcessorState::Idle.to_bits()),
                progress_bits: AtomicU64::new(0f64.to_bits()),
                skipped: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.shared.id
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.shared
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, lifecycle: &mut Lifecycle, kind: StatusKind) {
        let status = ProcessorStatus {
            processor: self.shared.id,
            generation: lifecycle.generation,
            kind,
        };
        lifecycle
            .observers
            .retain(|observer| observer.send(status.clone()).is_ok());
    }

    fn enter(&self, lifecycle: &mut Lifecycle, next: ProcessorState) {
        tracing::debug!(
            processor = %self.shared.id,
            from = lifecycle.state.name(),
            to = next.name(),
            generation = lifecycle.generation,
            "Processor state change"
        );
        lifecycle.state = next;
        self.shared.state.store(next.to_bits(), Ordering::Release);
        self.emit(lifecycle, StatusKind::State(next));
        self.shared.changed.notify_all();
    }

    fn bump_generation(&self, lifecycle: &mut Lifecycle) -> u64 {
        lifecycle.generation += 1;
        self.shared
            .generation
            .store(lifecycle.generation, Ordering::Release);
        lifecycle.generation
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_bits(self.shared.state.load(Ordering::Acquire))
    }

    /// Generation of the current (or most recent) pass.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Lock-free checkpoint: false once the pass tagged `generation` was
    /// cancelled or superseded.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn fault_reason(&self) -> Option<String> {
        self.lifecycle().fault.clone()
    }

    /// Start a fresh full pass. Fails only once the processor faulted.
    pub fn begin(&self) -> Result<u64, ProcessorError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == ProcessorState::Faulted {
            return Err(ProcessorError::Faulted {
                processor: self.shared.id.get(),
                reason: lifecycle.fault.clone().unwrap_or_default(),
            });
        }
        let generation = self.bump_generation(&mut lifecycle);
        self.shared.progress_bits.store(0f64.to_bits(), Ordering::Release);
        self.shared.skipped.store(0, Ordering::Release);
        self.enter(&mut lifecycle, ProcessorState::Processing);
        Ok(generation)
    }

    /// Re-enter `Processing` for incremental work within the same pass.
    /// Returns false if the pass was superseded or the processor is not
    /// in a resumable state.
    pub fn resume(&self, generation: u64) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation != generation {
            return false;
        }
        match lifecycle.state {
            ProcessorState::Processing => true,
            ProcessorState::Completed => {
                self.enter(&mut lifecycle, ProcessorState::Processing);
                true
            }
            _ => false,
        }
    }

    /// Mark the pass caught up with the source.
    pub fn complete(&self, generation: u64) -> bool {
        self.complete_if(generation, || true)
    }

    /// Complete only if `caught_up` holds. The check runs under the
    /// lifecycle lock, so a concurrent `resume` either lands before it
    /// (and the check sees the new work) or after the transition.
    pub fn complete_if(&self, generation: u64, caught_up: impl FnOnce() -> bool) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation != generation
            || lifecycle.state != ProcessorState::Processing
            || !caught_up()
        {
            return false;
        }
        self.shared.progress_bits.store(1f64.to_bits(), Ordering::Release);
        self.emit(&mut lifecycle, StatusKind::Progress(1.0));
        self.enter(&mut lifecycle, ProcessorState::Completed);
        true
    }

    /// Move to the terminal `Faulted` state.
    pub fn fault(&self, generation: u64, reason: impl Into<String>) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation != generation
            || !lifecycle.state.can_transition_to(ProcessorState::Faulted)
        {
            return false;
        }
        let reason = reason.into();
        tracing::error!(processor = %self.shared.id, generation, reason = %reason, "Processor faulted");
        lifecycle.fault = Some(reason.clone());
        self.emit(&mut lifecycle, StatusKind::Fault(reason));
        self.enter(&mut lifecycle, ProcessorState::Faulted);
        true
    }

    /// Cancel from any non-terminal state. Returns false if already
    /// cancelled or faulted.
    ///
    /// Once this returns, no consumer running through
    /// [`apply_if_current`](Self::apply_if_current) will apply output
    /// from the cancelled pass.
    pub fn cancel(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if !lifecycle.state.can_transition_to(ProcessorState::Cancelled) {
            return false;
        }
        self.bump_generation(&mut lifecycle);
        self.enter(&mut lifecycle, ProcessorState::Cancelled);
        true
    }

    /// Supersede the running pass and start a new one in place
    /// (parameter change). Same as `begin` but only from a live state.
    pub fn restart(&self) -> Result<u64, ProcessorError> {
        let state = self.state();
        if state == ProcessorState::Idle || state == ProcessorState::Cancelled {
            return Err(ProcessorError::InvalidTransition {
                processor: self.shared.id.get(),
                from: state.name(),
                to: "Restart",
            });
        }
        self.begin()
    }

    /// Run `apply` only if `generation` is still current, holding the
    /// lifecycle lock so a concurrent `cancel` waits for it to finish.
    /// `apply` must not call back into this handle except through its
    /// lock-free readers (`state`, `generation`, `is_current`).
    pub fn apply_if_current<R>(&self, generation: u64, apply: impl FnOnce() -> R) -> Option<R> {
        let lifecycle = self.lifecycle();
        if lifecycle.generation != generation {
            return None;
        }
        let result = apply();
        drop(lifecycle);
        Some(result)
    }

    pub fn set_progress(&self, generation: u64, fraction: f64) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation != generation {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.shared
            .progress_bits
            .store(fraction.to_bits(), Ordering::Release);
        self.emit(&mut lifecycle, StatusKind::Progress(fraction));
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.shared.progress_bits.load(Ordering::Acquire))
    }

    /// Record a skipped entity. Returns the number skipped in this pass.
    pub fn warn(&self, generation: u64, message: impl Into<String>) -> usize {
        let skipped = self.shared.skipped.fetch_add(1, Ordering::AcqRel) + 1;
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation == generation {
            self.emit(&mut lifecycle, StatusKind::Warning(message.into()));
        }
        skipped
    }

    /// Entities skipped during the current pass.
    pub fn skipped(&self) -> usize {
        self.shared.skipped.load(Ordering::Acquire)
    }

    /// Subscribe to status notifications from now on.
    pub fn subscribe(&self) -> Receiver<ProcessorStatus> {
        let (tx, rx) = mpsc::channel();
        self.lifecycle().observers.push(tx);
        rx
    }

    /// Block until `predicate` holds for the state or `timeout` elapses.
    /// Returns the last observed state when the predicate held.
    pub fn wait_for_state(
        &self,
        predicate: impl Fn(ProcessorState) -> bool,
        timeout: Duration,
    ) -> Option<ProcessorState> {
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.lifecycle();
        loop {
            if predicate(lifecycle.state) {
                return Some(lifecycle.state);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(lifecycle, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            lifecycle = guard;
        }
    }
}

impl std::fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// An incremental pipeline stage over a source sequence.
pub trait Processor: Send {
    fn id(&self) -> ProcessorId;

    /// Bind the observable source. Re-attaching the same source is a no-op.
    fn attach(&mut self, source: &SourceSequence) -> Result<(), ProcessorError>;

    /// Begin or resume work. Never blocks on the work itself.
    fn process(&mut self) -> Result<(), ProcessorError>;

    /// Cooperative cancel; safe while a pass is in flight.
    fn cancel(&self);

    fn state(&self) -> ProcessorState;

    fn progress(&self) -> f64;

    /// Estimated bytes retained by the processor itself.
    fn memory_size(&self) -> usize;

    /// Lifecycle handle shared with the combiner.
    fn handle(&self) -> ProcessorHandle;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_graph() {
        use ProcessorState::*;
        assert!(Idle.can_transition_to(Processing));
        assert!(Completed.can_transition_to(Processing));
        assert!(Cancelled.can_transition_to(Processing));
        assert!(!Faulted.can_transition_to(Processing));
        assert!(!Idle.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Faulted));
    }

    #[test]
    fn test_state_readable_while_applying() {
        let handle = ProcessorHandle::new();
        let generation = handle.begin().unwrap();
        let seen = handle.apply_if_current(generation, || handle.state());
        assert_eq!(seen, Some(ProcessorState::Processing));
        handle.cancel();
        assert_eq!(handle.state(), ProcessorState::Cancelled);
        assert_eq!(handle.apply_if_current(generation, || ()), None);
    }

    #[test]
    fn test_begin_complete_resume() {
        let handle = ProcessorHandle::new();
        let generation = handle.begin().unwrap();
        assert_eq!(handle.state(), ProcessorState::Processing);
        assert!(handle.complete(generation));
        assert_eq!(handle.progress(), 1.0);
        assert!(handle.resume(generation));
        assert_eq!(handle.state(), ProcessorState::Processing);
    }

    #[test]
    fn test_cancel_supersedes_generation() {
        let handle = ProcessorHandle::new();
        let generation = handle.begin().unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.is_current(generation));
        assert!(!handle.complete(generation));
        assert!(handle.apply_if_current(generation, || ()).is_none());
        assert_eq!(handle.state(), ProcessorState::Cancelled);
    }

    #[test]
    fn test_fault_is_terminal() {
        let handle = ProcessorHandle::new();
        let generation = handle.begin().unwrap();
        assert!(handle.fault(generation, "boom"));
        assert!(!handle.cancel());
        assert!(matches!(
            handle.begin(),
            Err(ProcessorError::Faulted { reason, .. }) if reason == "boom"
        ));
        assert_eq!(handle.fault_reason().as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_notifications_in_order() {
        let handle = ProcessorHandle::new();
        let rx = handle.subscribe();
        let generation = handle.begin().unwrap();
        handle.set_progress(generation, 0.5);
        handle.complete(generation);

        let kinds: Vec<StatusKind> = rx.try_iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StatusKind::State(ProcessorState::Processing),
                StatusKind::Progress(0.5),
                StatusKind::Progress(1.0),
                StatusKind::State(ProcessorState::Completed),
            ]
        );
    }

    #[test]
    fn test_wait_for_state_times_out() {
        let handle = ProcessorHandle::new();
        assert_eq!(
            handle.wait_for_state(|s| s == ProcessorState::Completed, Duration::from_millis(20)),
            None
        );
        assert_eq!(
            handle.wait_for_state(|s| s == ProcessorState::Idle, Duration::from_millis(20)),
            Some(ProcessorState::Idle)
        );
    }

    #[test]
    fn test_restart_requires_live_pass() {
        let handle = ProcessorHandle::new();
        assert!(matches!(
            handle.restart(),
            Err(ProcessorError::InvalidTransition { .. })
        ));
        let first = handle.begin().unwrap();
        let second = handle.restart().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_priority_chunk_sizes_ordered() {
        assert!(
            ProcessingPriority::Realtime.default_chunk_size()
                < ProcessingPriority::Background.default_chunk_size()
        );
    }
}
