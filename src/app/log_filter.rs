// logsieve - app/log_filter.rs
//
// Background filter over a source sequence.
//
// Architecture:
//   - Each filter owns one worker thread per pass. The worker walks the
//     source in chunks sized by the filter's priority, checks its pass
//     generation before every entity, publishes each chunk's matches to
//     the filter's own live list, and reports them to the combiner
//     through the shared bounded queue.
//   - The owner talks to the worker through an unbounded signal channel:
//     source growth, invalidated positions, and criteria restarts. The
//     sender lives behind a shared slot so that cancelling simply drops
//     it and the worker's next blocking receive ends the thread.
//   - Memory pressure: caches are shed between chunks whenever the group
//     is over quota. A pass pauses (for a bounded time) only when it
//     starts.
//   - The filter's own list is written under the lifecycle lock, so once
//     `cancel` returns it no longer changes.
//   - A panic inside the worker (e.g. in a custom predicate) faults only
//     this filter; the combiner freezes its contribution.

use crate::app::combiner::PipelineMessage;
use crate::app::memory::MemoryGovernor;
use crate::app::session::{GroupCreated, SessionAccessor};
use crate::core::change::{DeltaKind, FilterDelta, ViewChange};
use crate::core::entity::Entity;
use crate::core::filter::{Filter, FilterCriteria};
use crate::core::group::RecordGroup;
use crate::core::policy::RetainAll;
use crate::core::processor::{
    ProcessingPriority, Processor, ProcessorHandle, ProcessorId, ProcessorState,
};
use crate::core::source::{SourceEvent, SourceSequence};
use crate::core::view::FilteredView;
use crate::platform::config::AppConfig;
use crate::util::constants::{MATCH_SET_SLOT_SIZE, MAX_ITEM_WARNINGS_LOGGED};
use crate::util::error::ProcessorError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Scheduling options for a [`LogFilter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFilterOptions {
    pub priority: ProcessingPriority,
    /// Overrides the priority's chunk size.
    pub chunk_size: Option<usize>,
}

impl LogFilterOptions {
    /// Options using the chunk size configured for `priority`.
    pub fn from_config(config: &AppConfig, priority: ProcessingPriority) -> Self {
        Self {
            priority,
            chunk_size: Some(config.chunk_size(priority)),
        }
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
            .unwrap_or_else(|| self.priority.default_chunk_size())
            .max(1)
    }
}

#[derive(Debug)]
enum WorkerSignal {
    Grown,
    Restart {
        criteria: Arc<FilterCriteria>,
        generation: u64,
    },
    Invalidate(Vec<usize>),
}

type Link = Arc<Mutex<Option<Sender<WorkerSignal>>>>;

fn lock_link(link: &Mutex<Option<Sender<WorkerSignal>>>) -> MutexGuard<'_, Option<Sender<WorkerSignal>>> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Incremental, cancellable filter feeding a [`Combiner`](crate::app::combiner::Combiner).
pub struct LogFilter {
    handle: ProcessorHandle,
    accessor: Arc<dyn SessionAccessor>,
    sink: SyncSender<PipelineMessage>,
    criteria: Arc<FilterCriteria>,
    source: Option<SourceSequence>,
    link: Link,
    worker: Option<JoinHandle<()>>,
    options: LogFilterOptions,
    /// Invalidations sent to the current worker but not yet received.
    pending: Arc<AtomicUsize>,
    /// This filter's own matches, in source order.
    filtered: FilteredView,
}

impl LogFilter {
    /// Create a filter and register it with the combiner behind `sink`.
    /// Registration is queued ahead of any output the filter produces.
    pub fn new(
        accessor: Arc<dyn SessionAccessor>,
        sink: SyncSender<PipelineMessage>,
        criteria: FilterCriteria,
        options: LogFilterOptions,
    ) -> Self {
        let handle = ProcessorHandle::new();
        if sink.send(PipelineMessage::AddFilter(handle.clone())).is_err() {
            tracing::warn!(processor = %handle.id(), "Combiner is gone; filter output will be dropped");
        }
        tracing::debug!(
            processor = %handle.id(),
            priority = ?options.priority,
            chunk_size = options.chunk_size(),
            criteria = ?criteria,
            "Filter created"
        );
        Self {
            handle,
            accessor,
            sink,
            criteria: Arc::new(criteria),
            source: None,
            link: Arc::new(Mutex::new(None)),
            worker: None,
            options,
            pending: Arc::new(AtomicUsize::new(0)),
            filtered: FilteredView::new(),
        }
    }

    /// Subscribe to changes of this filter's own match list.
    pub fn subscribe(&self) -> Receiver<ViewChange> {
        self.filtered.subscribe()
    }

    pub fn priority(&self) -> ProcessingPriority {
        self.options.priority
    }

    /// Entities skipped because they could not be evaluated in the
    /// current pass.
    pub fn skipped(&self) -> usize {
        self.handle.skipped()
    }

    fn worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    fn signal(&self, signal: WorkerSignal) -> bool {
        lock_link(&self.link)
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    fn faulted_error(&self) -> ProcessorError {
        ProcessorError::Faulted {
            processor: self.handle.id().get(),
            reason: self.handle.fault_reason().unwrap_or_default(),
        }
    }
}

impl Processor for LogFilter {
    fn id(&self) -> ProcessorId {
        self.handle.id()
    }

    fn attach(&mut self, source: &SourceSequence) -> Result<(), ProcessorError> {
        if let Some(current) = &self.source {
            if current.id() == source.id() {
                return Ok(());
            }
            return Err(ProcessorError::AlreadyAttached {
                processor: self.handle.id().get(),
                current: current.id(),
                requested: source.id(),
            });
        }

        let link = Arc::downgrade(&self.link);
        let handle = self.handle.clone();
        source.subscribe_with(Arc::new(move |_event: &SourceEvent| {
            let Some(link) = link.upgrade() else {
                return false;
            };
            handle.resume(handle.generation());
            if let Some(tx) = lock_link(&link).as_ref() {
                let _ = tx.send(WorkerSignal::Grown);
            }
            true
        }));
        tracing::debug!(
            processor = %self.handle.id(),
            source = source.id(),
            subscribers = source.subscriber_count(),
            "Filter attached"
        );
        self.source = Some(source.clone());
        Ok(())
    }

    fn process(&mut self) -> Result<(), ProcessorError> {
        let Some(source) = self.source.clone() else {
            return Err(ProcessorError::NotAttached {
                processor: self.handle.id().get(),
            });
        };
        match self.handle.state() {
            ProcessorState::Faulted => return Err(self.faulted_error()),
            ProcessorState::Processing | ProcessorState::Completed if self.worker_alive() => {
                return Ok(());
            }
            _ => {}
        }
        if let Some(previous) = self.worker.take() {
            let _ = previous.join();
        }

        let generation = self.handle.begin()?;
        let (tx, rx) = mpsc::channel();
        *lock_link(&self.link) = Some(tx);
        self.pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            handle: self.handle.clone(),
            governor: self.accessor.memory_governor(),
            group_events: self.accessor.on_group_created(),
            accessor: Arc::clone(&self.accessor),
            group: None,
            sink: self.sink.clone(),
            source,
            criteria: Arc::clone(&self.criteria),
            signals: rx,
            chunk_size: self.options.chunk_size(),
            pending: Arc::clone(&self.pending),
            filtered: self.filtered.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("logsieve-filter-{}", self.handle.id().get()))
            .spawn(move || worker.run(generation));
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                lock_link(&self.link).take();
                let reason = format!("cannot start worker thread: {e}");
                self.handle.fault(generation, reason.clone());
                let _ = self.sink.send(PipelineMessage::Wake);
                Err(ProcessorError::Faulted {
                    processor: self.handle.id().get(),
                    reason,
                })
            }
        }
    }

    fn cancel(&self) {
        if !self.handle.cancel() {
            return;
        }
        lock_link(&self.link).take();
        tracing::info!(processor = %self.handle.id(), "Filter cancelled");
    }

    fn state(&self) -> ProcessorState {
        self.handle.state()
    }

    fn progress(&self) -> f64 {
        self.handle.progress()
    }

    fn memory_size(&self) -> usize {
        self.filtered.len() * MATCH_SET_SLOT_SIZE + std::mem::size_of::<Self>()
    }

    fn handle(&self) -> ProcessorHandle {
        self.handle.clone()
    }
}

impl Filter for LogFilter {
    fn criteria(&self) -> Arc<FilterCriteria> {
        Arc::clone(&self.criteria)
    }

    fn filtered(&self) -> FilteredView {
        self.filtered.clone()
    }

    fn set_criteria(&mut self, criteria: FilterCriteria) -> Result<(), ProcessorError> {
        tracing::debug!(processor = %self.handle.id(), criteria = ?criteria, "Filter criteria changed");
        self.criteria = Arc::new(criteria);
        let live = matches!(
            self.handle.state(),
            ProcessorState::Processing | ProcessorState::Completed
        ) && self.worker_alive();
        if !live {
            return Ok(());
        }
        let generation = self.handle.restart()?;
        self.signal(WorkerSignal::Restart {
            criteria: Arc::clone(&self.criteria),
            generation,
        });
        Ok(())
    }

    fn invalidate(&self, indices: &[usize]) {
        if indices.is_empty() || !self.criteria.depends_on_marks() {
            return;
        }
        let link = lock_link(&self.link);
        let Some(tx) = link.as_ref() else {
            return;
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.handle.resume(self.handle.generation());
        if tx.send(WorkerSignal::Invalidate(indices.to_vec())).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for LogFilter {
    fn drop(&mut self) {
        self.handle.cancel();
        lock_link(&self.link).take();
        let _ = self.sink.send(PipelineMessage::RemoveFilter(self.handle.id()));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for LogFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFilter")
            .field("handle", &self.handle)
            .field("priority", &self.options.priority)
            .field("criteria", &self.criteria)
            .finish()
    }
}

// =============================================================================
// Worker
// =============================================================================

enum PassOutcome {
    Restarted(u64),
    Stop,
}

struct Worker {
    handle: ProcessorHandle,
    accessor: Arc<dyn SessionAccessor>,
    governor: Arc<MemoryGovernor>,
    group_events: Receiver<GroupCreated>,
    group: Option<RecordGroup>,
    sink: SyncSender<PipelineMessage>,
    source: SourceSequence,
    criteria: Arc<FilterCriteria>,
    signals: Receiver<WorkerSignal>,
    chunk_size: usize,
    pending: Arc<AtomicUsize>,
    filtered: FilteredView,
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}

impl Worker {
    fn run(mut self, mut generation: u64) {
        let processor = self.handle.id();
        tracing::debug!(processor = %processor, generation, "Filter worker started");
        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| self.pass(generation))) {
                Ok(PassOutcome::Restarted(next)) => generation = next,
                Ok(PassOutcome::Stop) => break,
                Err(payload) => {
                    let reason = panic_reason(&*payload);
                    if self.handle.fault(generation, reason.clone()) {
                        self.emit(generation, DeltaKind::Faulted { reason });
                    }
                    break;
                }
            }
        }
        tracing::debug!(processor = %processor, "Filter worker stopped");
    }

    fn emit(&self, generation: u64, kind: DeltaKind) -> bool {
        self.sink
            .send(PipelineMessage::Delta(FilterDelta {
                processor: self.handle.id(),
                generation,
                kind,
            }))
            .is_ok()
    }

    fn pass(&mut self, generation: u64) -> PassOutcome {
        tracing::debug!(
            processor = %self.handle.id(),
            generation,
            source_len = self.source.len(),
            "Filter pass started"
        );
        let filtered = &self.filtered;
        let cleared = self.handle.apply_if_current(generation, || {
            if !filtered.is_empty() {
                filtered.replace(Vec::new(), Vec::new());
            }
        });
        if cleared.is_none() {
            return self.await_restart();
        }
        if !self.emit(generation, DeltaKind::Reset) {
            return PassOutcome::Stop;
        }
        self.refresh_group();
        self.relieve_memory();
        self.pause_for_memory(generation);

        let mut next = 0usize;
        let mut invalidated = Vec::new();
        loop {
            if let Some(outcome) = self.drain_signals(generation, &mut invalidated) {
                return outcome;
            }
            if !self.handle.is_current(generation) {
                return self.await_restart();
            }
            if !invalidated.is_empty() && !self.revise(generation, next, &mut invalidated) {
                return PassOutcome::Stop;
            }

            let len = self.source.len();
            if next < len {
                match self.evaluate_chunk(generation, next, len) {
                    Some(end) => next = end,
                    None if !self.handle.is_current(generation) => continue,
                    None => return PassOutcome::Stop,
                }
                continue;
            }

            let pending = &self.pending;
            let source = &self.source;
            if self.handle.complete_if(generation, || {
                source.len() <= next && pending.load(Ordering::Acquire) == 0
            }) {
                tracing::debug!(
                    processor = %self.handle.id(),
                    generation,
                    evaluated = next,
                    matched = self.filtered.len(),
                    skipped = self.handle.skipped(),
                    "Filter caught up"
                );
            }
            if self.source.len() > next || self.pending.load(Ordering::Acquire) > 0 {
                continue;
            }
            if !self.handle.is_current(generation) {
                continue;
            }
            match self.signals.recv() {
                Ok(signal) => {
                    if let Some(outcome) = self.on_signal(signal, generation, &mut invalidated) {
                        return outcome;
                    }
                }
                Err(_) => return PassOutcome::Stop,
            }
        }
    }

    fn on_signal(
        &mut self,
        signal: WorkerSignal,
        generation: u64,
        invalidated: &mut Vec<usize>,
    ) -> Option<PassOutcome> {
        match signal {
            WorkerSignal::Grown => {
                self.handle.resume(generation);
                None
            }
            WorkerSignal::Invalidate(indices) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                self.handle.resume(generation);
                invalidated.extend(indices);
                None
            }
            WorkerSignal::Restart {
                criteria,
                generation,
            } => {
                self.criteria = criteria;
                Some(PassOutcome::Restarted(generation))
            }
        }
    }

    fn drain_signals(
        &mut self,
        generation: u64,
        invalidated: &mut Vec<usize>,
    ) -> Option<PassOutcome> {
        loop {
            match self.signals.try_recv() {
                Ok(signal) => {
                    if let Some(outcome) = self.on_signal(signal, generation, invalidated) {
                        return Some(outcome);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(PassOutcome::Stop),
            }
        }
    }

    /// Pass superseded: wait for the restart that superseded it, or for
    /// the owner to hang up.
    fn await_restart(&mut self) -> PassOutcome {
        loop {
            match self.signals.recv() {
                Ok(WorkerSignal::Restart {
                    criteria,
                    generation,
                }) => {
                    self.criteria = criteria;
                    return PassOutcome::Restarted(generation);
                }
                Ok(WorkerSignal::Invalidate(_)) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(WorkerSignal::Grown) => {}
                Err(_) => return PassOutcome::Stop,
            }
        }
    }

    fn refresh_group(&mut self) {
        let mut announced = false;
        while self.group_events.try_recv().is_ok() {
            announced = true;
        }
        if announced || self.group.as_ref().is_some_and(|group| !group.is_open()) {
            self.group = self.accessor.group();
        }
    }

    fn relieve_memory(&self) {
        if let Some(group) = &self.group {
            self.governor.relieve(group);
        }
    }

    fn pause_for_memory(&self, generation: u64) {
        let Some(group) = &self.group else {
            return;
        };
        let paused = self
            .governor
            .throttle(group, || self.handle.is_current(generation));
        if !paused.is_zero() {
            tracing::debug!(
                processor = %self.handle.id(),
                paused_ms = paused.as_millis() as u64,
                "Filter resumed after memory pause"
            );
        }
    }

    fn evaluate(&self, generation: u64, index: usize, entity: &Entity) -> bool {
        let result = match &self.group {
            Some(group) => self
                .criteria
                .matches(entity, &self.governor.retention_for(group)),
            None => self.criteria.matches(entity, &RetainAll),
        };
        match result {
            Ok(matched) => matched,
            Err(e) => {
                let skipped = self
                    .handle
                    .warn(generation, format!("entity at {index} skipped: {e}"));
                if skipped <= MAX_ITEM_WARNINGS_LOGGED {
                    tracing::warn!(processor = %self.handle.id(), index, error = %e, "Entity skipped");
                } else {
                    tracing::debug!(processor = %self.handle.id(), index, error = %e, "Entity skipped");
                }
                false
            }
        }
    }

    /// Evaluate one chunk starting at `start` and report it. Returns the
    /// new watermark, or None if the pass was superseded mid-chunk or the
    /// combiner hung up.
    fn evaluate_chunk(&mut self, generation: u64, start: usize, len: usize) -> Option<usize> {
        self.refresh_group();
        self.relieve_memory();

        let end = start.saturating_add(self.chunk_size).min(len);
        let entities = self.source.slice(start..end);
        let end = start + entities.len();
        let mut matches = Vec::new();
        for (offset, entity) in entities.iter().enumerate() {
            if !self.handle.is_current(generation) {
                return None;
            }
            if self.evaluate(generation, start + offset, entity) {
                matches.push(start + offset);
            }
        }

        let count = matches.len();
        let filtered = &self.filtered;
        let published = self.handle.apply_if_current(generation, || {
            filtered.apply(matches.iter().map(|&index| (index, true)), |index| {
                index
                    .checked_sub(start)
                    .and_then(|offset| entities.get(offset))
                    .cloned()
            })
        });
        if published.is_none() {
            return None;
        }
        if !self.emit(
            generation,
            DeltaKind::Matched {
                range: start..end,
                matches,
            },
        ) {
            return None;
        }
        self.handle
            .set_progress(generation, end as f64 / self.source.len().max(1) as f64);
        tracing::trace!(
            processor = %self.handle.id(),
            generation,
            range = ?(start..end),
            matched = count,
            "Chunk evaluated"
        );
        Some(end)
    }

    /// Re-evaluate invalidated positions already reported in this pass.
    /// Positions at or past `next` are covered by the forward scan.
    fn revise(&mut self, generation: u64, next: usize, invalidated: &mut Vec<usize>) -> bool {
        self.refresh_group();
        invalidated.sort_unstable();
        invalidated.dedup();
        let changes: Vec<(usize, bool)> = invalidated
            .drain(..)
            .filter(|&index| index < next)
            .filter_map(|index| {
                self.source
                    .get(index)
                    .map(|entity| (index, self.evaluate(generation, index, &entity)))
            })
            .collect();
        if changes.is_empty() {
            return true;
        }
        let filtered = &self.filtered;
        let source = &self.source;
        let published = self.handle.apply_if_current(generation, || {
            filtered.apply(changes.iter().copied(), |index| source.get(index))
        });
        if published.is_none() {
            return true;
        }
        tracing::debug!(
            processor = %self.handle.id(),
            generation,
            revised = changes.len(),
            "Invalidated entities re-evaluated"
        );
        self.emit(generation, DeltaKind::Revised { changes })
    }
}
