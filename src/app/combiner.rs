// logsieve - app/combiner.rs
//
// Merges the match sets of every registered filter into one live,
// source-ordered filtered view.
//
// Architecture:
//   - One combiner thread is the single writer of the view. Filters, the
//     source and the owner all talk to it through one bounded queue, so a
//     filter that outruns the combiner blocks instead of dropping deltas.
//   - `settled` is the source prefix the view is known to agree with.
//     It only advances up to the lowest watermark among live filters, so
//     each entity's membership is decided once, from every filter's
//     answer, and changes are emitted in source order.
//   - Adding a filter or restarting one lowers `settled` to zero; its new
//     results then revise the view incrementally as they arrive. The first
//     filter over a mirrored view replaces the mirror with one `Reset`.
//   - Mode changes and filter removals rebuild the settled prefix in
//     parallel and emit a single `Reset`.
//   - Cancelled and faulted filters are frozen: what they matched still
//     counts, nothing past their watermark matches, and they no longer
//     hold back settlement once other activity (an append, another
//     filter's output) makes the combiner settle again.
//   - A delta is applied and published while its filter's lifecycle lock
//     is held, so once `cancel` returns nothing from that pass reaches
//     the view.

use crate::core::change::{DeltaKind, FilterDelta, ViewChange};
use crate::core::entity::Entity;
use crate::core::model::CombinationMode;
use crate::core::processor::{ProcessorHandle, ProcessorId, ProcessorState};
use crate::core::saving::SavingOptions;
use crate::core::source::{SourceEvent, SourceSequence};
use crate::core::view::FilteredView;
use rayon::prelude::*;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Everything the combiner thread consumes, in delivery order.
#[derive(Debug)]
pub enum PipelineMessage {
    /// Output of one filter.
    Delta(FilterDelta),
    /// The source now holds `len` entities.
    SourceGrown { len: usize },
    /// Start combining a filter's output. Must precede its deltas.
    AddFilter(ProcessorHandle),
    /// Stop combining a filter's output.
    RemoveFilter(ProcessorId),
    /// Switch the combination mode.
    SetMode(CombinationMode),
    /// Re-evaluate settlement (a filter's state changed).
    Wake,
    /// Answered once every earlier message has been applied.
    Barrier(Sender<()>),
    Shutdown,
}

// =============================================================================
// Combiner thread state
// =============================================================================

struct Slot {
    handle: ProcessorHandle,
    generation: u64,
    /// Evaluated prefix of the source; `hits[i]` is the verdict for `i`.
    hits: Vec<bool>,
    faulted: bool,
}

impl Slot {
    fn new(handle: ProcessorHandle) -> Self {
        let generation = handle.generation();
        Self {
            handle,
            generation,
            hits: Vec::new(),
            faulted: false,
        }
    }

    fn watermark(&self) -> usize {
        self.hits.len()
    }

    fn matches(&self, index: usize) -> bool {
        self.hits.get(index).copied().unwrap_or(false)
    }

    fn is_frozen(&self) -> bool {
        self.faulted || self.handle.state().is_frozen()
    }
}

fn is_member(slots: &[Slot], mode: CombinationMode, index: usize) -> bool {
    if slots.is_empty() {
        return true;
    }
    match mode {
        CombinationMode::Union => slots.iter().any(|s| s.matches(index)),
        CombinationMode::Intersection => slots.iter().all(|s| s.matches(index)),
    }
}

struct CombinerState {
    source: SourceSequence,
    slots: Vec<Slot>,
    mode: CombinationMode,
    settled: usize,
    source_len: usize,
    view: FilteredView,
    handles: Arc<Mutex<Vec<ProcessorHandle>>>,
}

impl CombinerState {
    fn handles(&self) -> MutexGuard<'_, Vec<ProcessorHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run(mut self, inbox: Receiver<PipelineMessage>) {
        tracing::debug!(source = self.source.id(), mode = %self.mode, "Combiner started");
        while let Ok(message) = inbox.recv() {
            match message {
                PipelineMessage::Delta(delta) => self.on_delta(delta),
                PipelineMessage::SourceGrown { len } => {
                    self.source_len = self.source_len.max(len);
                    self.settle();
                }
                PipelineMessage::AddFilter(handle) => self.add_filter(handle),
                PipelineMessage::RemoveFilter(id) => self.remove_filter(id),
                PipelineMessage::SetMode(mode) => {
                    if mode != self.mode {
                        tracing::info!(from = %self.mode, to = %mode, "Combination mode changed");
                        self.mode = mode;
                        self.rebuild();
                    }
                }
                PipelineMessage::Wake => self.settle(),
                PipelineMessage::Barrier(reply) => {
                    let _ = reply.send(());
                }
                PipelineMessage::Shutdown => break,
            }
        }
        tracing::debug!(source = self.source.id(), "Combiner stopped");
    }

    fn add_filter(&mut self, handle: ProcessorHandle) {
        if self.slots.iter().any(|s| s.handle.id() == handle.id()) {
            return;
        }
        tracing::debug!(processor = %handle.id(), "Filter added to combiner");
        let mirrored = self.slots.is_empty() && self.settled > 0;
        self.handles().push(handle.clone());
        self.slots.push(Slot::new(handle));
        if mirrored {
            self.rebuild();
        } else {
            self.settled = 0;
        }
    }

    fn remove_filter(&mut self, id: ProcessorId) {
        let before = self.slots.len();
        self.slots.retain(|s| s.handle.id() != id);
        if self.slots.len() == before {
            return;
        }
        self.handles().retain(|h| h.id() != id);
        tracing::debug!(processor = %id, "Filter removed from combiner");
        self.rebuild();
    }

    fn on_delta(&mut self, delta: FilterDelta) {
        let Some(position) = self
            .slots
            .iter()
            .position(|s| s.handle.id() == delta.processor)
        else {
            tracing::trace!(processor = %delta.processor, "Delta from unregistered filter dropped");
            return;
        };
        let handle = self.slots[position].handle.clone();
        let processor = delta.processor;
        let generation = delta.generation;
        if handle
            .apply_if_current(generation, || self.absorb(position, delta))
            .is_none()
        {
            tracing::trace!(processor = %processor, generation, "Stale delta dropped");
        }
    }

    /// Fold a current delta into its slot and publish the consequences.
    fn absorb(&mut self, position: usize, delta: FilterDelta) {
        let slot = &mut self.slots[position];
        let mut revised = Vec::new();
        let mut reset = false;
        if slot.generation != delta.generation {
            slot.generation = delta.generation;
            slot.hits.clear();
            reset = true;
        }
        match delta.kind {
            DeltaKind::Reset => {
                slot.hits.clear();
                slot.faulted = false;
                reset = true;
            }
            DeltaKind::Matched { range, matches } => {
                if range.start != slot.hits.len() {
                    tracing::warn!(
                        processor = %delta.processor,
                        expected = slot.hits.len(),
                        got = range.start,
                        "Out-of-order match range ignored"
                    );
                } else {
                    slot.hits.resize(range.end, false);
                    for index in matches {
                        if let Some(hit) = slot.hits.get_mut(index) {
                            *hit = true;
                        }
                    }
                }
            }
            DeltaKind::Revised { changes } => {
                for (index, matched) in changes {
                    if let Some(hit) = slot.hits.get_mut(index) {
                        if *hit != matched {
                            *hit = matched;
                            revised.push(index);
                        }
                    }
                }
            }
            DeltaKind::Faulted { reason } => {
                tracing::warn!(
                    processor = %delta.processor,
                    reason = %reason,
                    "Filter faulted; freezing its contribution"
                );
                slot.faulted = true;
            }
        }

        if reset {
            self.settled = 0;
        }
        if !revised.is_empty() {
            revised.sort_unstable();
            let settled = self.settled;
            let updates: Vec<(usize, bool)> = revised
                .into_iter()
                .filter(|&i| i < settled)
                .map(|i| (i, is_member(&self.slots, self.mode, i)))
                .collect();
            self.publish(updates, 0, &[]);
        }
        self.settle();
    }

    /// Highest source position the view may currently agree with.
    fn settle_target(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.is_frozen())
            .map(Slot::watermark)
            .min()
            .unwrap_or(self.source_len)
            .min(self.source_len)
    }

    fn settle(&mut self) {
        let target = self.settle_target();
        if target <= self.settled {
            return;
        }
        let start = self.settled;
        let entities = self.source.slice(start..target);
        let end = start + entities.len();
        let updates: Vec<(usize, bool)> = (start..end)
            .map(|i| (i, is_member(&self.slots, self.mode, i)))
            .collect();
        self.settled = end;
        self.publish(updates, start, &entities);
    }

    /// Apply membership verdicts in ascending source order. `window`
    /// holds the entities for positions starting at `window_start`;
    /// anything outside it is fetched from the source.
    fn publish(&self, updates: Vec<(usize, bool)>, window_start: usize, window: &[Entity]) {
        if updates.is_empty() {
            return;
        }
        self.view.apply(updates, |index| {
            index
                .checked_sub(window_start)
                .and_then(|offset| window.get(offset))
                .cloned()
                .or_else(|| self.source.get(index))
        });
    }

    /// Recompute the whole settled prefix and publish it as one reset.
    fn rebuild(&mut self) {
        let target = self.settle_target();
        let slots = &self.slots;
        let mode = self.mode;
        let members: Vec<usize> = (0..target)
            .into_par_iter()
            .filter(|&i| is_member(slots, mode, i))
            .collect();
        let source = self.source.slice(0..target);
        let (indices, entities): (Vec<usize>, Vec<Entity>) = members
            .into_iter()
            .filter_map(|i| source.get(i).map(|e| (i, e.clone())))
            .unzip();
        self.settled = source.len();
        tracing::debug!(
            len = entities.len(),
            settled = self.settled,
            mode = %self.mode,
            "Filtered view rebuilt"
        );
        self.view.replace(indices, entities);
    }
}

// =============================================================================
// Combiner
// =============================================================================

/// Owner-side handle of the combiner thread.
pub struct Combiner {
    sink: SyncSender<PipelineMessage>,
    view: FilteredView,
    handles: Arc<Mutex<Vec<ProcessorHandle>>>,
    mode: CombinationMode,
    worker: Option<JoinHandle<()>>,
}

impl Combiner {
    /// Start a combiner over `source`. `capacity` bounds the queue shared
    /// by every filter feeding it.
    pub fn new(source: &SourceSequence, mode: CombinationMode, capacity: usize) -> Self {
        let (sink, inbox) = mpsc::sync_channel(capacity.max(1));
        let view = FilteredView::new();
        let handles = Arc::new(Mutex::new(Vec::new()));

        let grown = sink.clone();
        source.subscribe_with(Arc::new(move |event: &SourceEvent| {
            let SourceEvent::ItemsAdded { index, count, .. } = event;
            grown
                .send(PipelineMessage::SourceGrown {
                    len: index + count,
                })
                .is_ok()
        }));
        tracing::debug!(
            source = source.id(),
            subscribers = source.subscriber_count(),
            "Combiner subscribed to source"
        );

        let state = CombinerState {
            source: source.clone(),
            slots: Vec::new(),
            mode,
            settled: 0,
            source_len: 0,
            view: view.clone(),
            handles: Arc::clone(&handles),
        };
        let worker = std::thread::Builder::new()
            .name("logsieve-combiner".to_string())
            .spawn(move || state.run(inbox));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "Cannot start combiner thread");
                None
            }
        };

        let combiner = Self {
            sink,
            view,
            handles,
            mode,
            worker,
        };
        // Entities appended before the subscription existed.
        combiner.send(PipelineMessage::SourceGrown { len: source.len() });
        combiner
    }

    fn send(&self, message: PipelineMessage) {
        if self.sink.send(message).is_err() {
            tracing::warn!("Combiner thread is gone; message dropped");
        }
    }

    /// Queue endpoint for filters feeding this combiner.
    pub fn sink(&self) -> SyncSender<PipelineMessage> {
        self.sink.clone()
    }

    /// Register a processor's output. Filters built on [`sink`](Self::sink)
    /// register themselves.
    pub fn add_filter(&self, handle: ProcessorHandle) {
        self.send(PipelineMessage::AddFilter(handle));
    }

    /// Stop combining a filter's output; publishes one reset.
    pub fn remove_filter(&self, id: ProcessorId) {
        self.send(PipelineMessage::RemoveFilter(id));
    }

    pub fn mode(&self) -> CombinationMode {
        self.mode
    }

    /// Switch the combination mode; publishes one reset.
    pub fn set_mode(&mut self, mode: CombinationMode) {
        self.mode = mode;
        self.send(PipelineMessage::SetMode(mode));
    }

    /// Live view of the combined output.
    pub fn view(&self) -> FilteredView {
        self.view.clone()
    }

    /// Subscribe to view changes applied after this call.
    pub fn subscribe(&self) -> Receiver<ViewChange> {
        self.view.subscribe()
    }

    /// Handles of the filters currently registered.
    pub fn filters(&self) -> Vec<ProcessorHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Block until every message queued before this call is applied.
    pub fn sync(&self) {
        let (tx, rx) = mpsc::channel();
        self.send(PipelineMessage::Barrier(tx));
        let _ = rx.recv();
    }

    /// Wait for every registered filter to stop processing, then sync.
    /// Returns false on timeout.
    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        self.sync();
        let settled = self.filters().iter().all(|handle| {
            handle
                .wait_for_state(|s| s != ProcessorState::Processing, timeout)
                .is_some()
        });
        self.sync();
        settled
    }

    /// Frozen snapshot of the current view for an exporter.
    pub fn saving_options(&self) -> SavingOptions {
        SavingOptions::new(self.view.snapshot())
    }
}

impl Drop for Combiner {
    fn drop(&mut self) {
        let _ = self.sink.send(PipelineMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::group::RecordGroup;
    use crate::core::model::{Level, Record};

    fn source_of(group: &RecordGroup, n: usize) -> SourceSequence {
        let source = SourceSequence::new();
        source.append(
            (0..n)
                .map(|i| group.wrap(Record::new(Level::Info, format!("r{i}"))).unwrap())
                .collect(),
        );
        source
    }

    fn feed(combiner: &Combiner, handle: &ProcessorHandle, generation: u64, len: usize, hits: &[usize]) {
        let sink = combiner.sink();
        sink.send(PipelineMessage::Delta(FilterDelta {
            processor: handle.id(),
            generation,
            kind: DeltaKind::Reset,
        }))
        .unwrap();
        sink.send(PipelineMessage::Delta(FilterDelta {
            processor: handle.id(),
            generation,
            kind: DeltaKind::Matched {
                range: 0..len,
                matches: hits.to_vec(),
            },
        }))
        .unwrap();
    }

    #[test]
    fn test_no_filters_mirrors_source() {
        let group = RecordGroup::new(1, None);
        let source = source_of(&group, 3);
        let combiner = Combiner::new(&source, CombinationMode::Intersection, 8);
        combiner.sync();
        assert_eq!(combiner.view().source_indices(), vec![0, 1, 2]);
    }

    #[test]
    fn test_hand_fed_union_and_intersection() {
        let group = RecordGroup::new(1, None);
        let source = source_of(&group, 5);
        let mut combiner = Combiner::new(&source, CombinationMode::Intersection, 8);
        let a = ProcessorHandle::new();
        let b = ProcessorHandle::new();
        let ga = a.begin().unwrap();
        let gb = b.begin().unwrap();
        combiner.add_filter(a.clone());
        combiner.add_filter(b.clone());
        feed(&combiner, &a, ga, 5, &[0, 2, 4]);
        feed(&combiner, &b, gb, 5, &[2, 3]);
        combiner.sync();
        assert_eq!(combiner.view().source_indices(), vec![2]);

        let rx = combiner.subscribe();
        combiner.set_mode(CombinationMode::Union);
        combiner.sync();
        assert_eq!(combiner.view().source_indices(), vec![0, 2, 3, 4]);
        assert_eq!(rx.try_recv().unwrap(), ViewChange::Reset { len: 4 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_lagging_filter_holds_back_settlement() {
        let group = RecordGroup::new(1, None);
        let source = source_of(&group, 4);
        let combiner = Combiner::new(&source, CombinationMode::Union, 8);
        let a = ProcessorHandle::new();
        let b = ProcessorHandle::new();
        let ga = a.begin().unwrap();
        b.begin().unwrap();
        combiner.add_filter(a.clone());
        combiner.add_filter(b.clone());
        feed(&combiner, &a, ga, 4, &[1, 3]);
        combiner.sync();
        assert!(combiner.view().is_empty());

        // Cancelling the lagging filter freezes it and releases settlement.
        b.cancel();
        combiner.sink().send(PipelineMessage::Wake).unwrap();
        combiner.sync();
        assert_eq!(combiner.view().source_indices(), vec![1, 3]);
    }

    #[test]
    fn test_stale_generation_dropped() {
        let group = RecordGroup::new(1, None);
        let source = source_of(&group, 3);
        let combiner = Combiner::new(&source, CombinationMode::Union, 8);
        let a = ProcessorHandle::new();
        let old = a.begin().unwrap();
        combiner.add_filter(a.clone());
        let current = a.begin().unwrap();
        feed(&combiner, &a, old, 3, &[0, 1, 2]);
        feed(&combiner, &a, current, 3, &[1]);
        combiner.sync();
        assert_eq!(combiner.view().source_indices(), vec![1]);
    }

    #[test]
    fn test_first_filter_replaces_mirror_with_reset() {
        let group = RecordGroup::new(1, None);
        let source = source_of(&group, 3);
        let combiner = Combiner::new(&source, CombinationMode::Intersection, 8);
        combiner.sync();
        assert_eq!(combiner.view().len(), 3);

        let rx = combiner.subscribe();
        let a = ProcessorHandle::new();
        let ga = a.begin().unwrap();
        combiner.add_filter(a.clone());
        feed(&combiner, &a, ga, 3, &[1]);
        combiner.sync();

        let received: Vec<ViewChange> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ViewChange::Reset { len: 0 },
                ViewChange::Added {
                    index: 0,
                    entities: vec![source.get(1).unwrap()],
                },
            ]
        );
    }

    #[test]
    fn test_cancelled_filter_output_never_published() {
        let group = RecordGroup::new(1, None);
        let source = source_of(&group, 4);
        let combiner = Combiner::new(&source, CombinationMode::Union, 8);
        let a = ProcessorHandle::new();
        let b = ProcessorHandle::new();
        let ga = a.begin().unwrap();
        let gb = b.begin().unwrap();
        combiner.add_filter(a.clone());
        combiner.add_filter(b.clone());
        feed(&combiner, &a, ga, 4, &[1, 3]);
        feed(&combiner, &b, gb, 2, &[0]);
        combiner.sync();
        assert_eq!(combiner.view().source_indices(), vec![0, 1]);

        let rx = combiner.subscribe();
        b.cancel();
        combiner
            .sink()
            .send(PipelineMessage::Delta(FilterDelta {
                processor: b.id(),
                generation: gb,
                kind: DeltaKind::Matched {
                    range: 2..4,
                    matches: vec![2],
                },
            }))
            .unwrap();
        combiner.sync();
        assert!(rx.try_recv().is_err());
        assert_eq!(combiner.view().source_indices(), vec![0, 1]);

        // Later source growth settles past the frozen filter.
        source.append(vec![group.wrap(Record::new(Level::Info, "r4")).unwrap()]);
        combiner.sync();
        assert_eq!(combiner.view().source_indices(), vec![0, 1, 3]);
    }
}
