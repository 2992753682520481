// logsieve - core/view.rs
//
// Live, source-ordered list of entities with index-accurate change
// notifications. The combiner publishes its merged output through one;
// every filter publishes its own match set through another.
//
// Each list has a single writer. Readers take consistent snapshots and
// observers receive changes in the order they were applied.

use crate::core::change::ViewChange;
use crate::core::entity::Entity;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct ViewState {
    indices: Vec<usize>,
    entities: Vec<Entity>,
    version: u64,
    observers: Vec<Sender<ViewChange>>,
}

impl ViewState {
    fn publish(&mut self, changes: &[ViewChange]) {
        self.version += 1;
        self.observers.retain(|observer| {
            changes
                .iter()
                .all(|change| observer.send(change.clone()).is_ok())
        });
    }
}

/// Shared handle on a live filtered list.
#[derive(Clone, Default)]
pub struct FilteredView {
    state: Arc<RwLock<ViewState>>,
}

impl FilteredView {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ViewState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ViewState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entities.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Entity> {
        self.read().entities.get(index).cloned()
    }

    /// Consistent copy of the current entities.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.read().entities.clone()
    }

    /// Source positions of the current entities, ascending.
    pub fn source_indices(&self) -> Vec<usize> {
        self.read().indices.clone()
    }

    /// Whether the source position `index` is currently in the list.
    pub fn contains(&self, index: usize) -> bool {
        self.read().indices.binary_search(&index).is_ok()
    }

    /// Incremented on every applied change batch.
    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// Subscribe to changes applied after this call.
    pub fn subscribe(&self) -> Receiver<ViewChange> {
        let (tx, rx) = mpsc::channel();
        self.write().observers.push(tx);
        rx
    }

    /// Apply membership verdicts given in ascending source order.
    /// `lookup` supplies the entity for each position being inserted;
    /// positions it cannot resolve are skipped. Returns whether anything
    /// changed.
    pub(crate) fn apply(
        &self,
        updates: impl IntoIterator<Item = (usize, bool)>,
        lookup: impl Fn(usize) -> Option<Entity>,
    ) -> bool {
        let mut batch = ChangeBatch::default();
        let mut view = self.write();
        for (index, member) in updates {
            match (view.indices.binary_search(&index), member) {
                (Ok(position), false) => {
                    view.indices.remove(position);
                    let entity = view.entities.remove(position);
                    batch.removed(position, entity);
                }
                (Err(position), true) => {
                    let Some(entity) = lookup(index) else {
                        continue;
                    };
                    view.indices.insert(position, index);
                    view.entities.insert(position, entity.clone());
                    batch.added(position, entity);
                }
                _ => {}
            }
        }
        let changes = batch.finish();
        if changes.is_empty() {
            return false;
        }
        view.publish(&changes);
        tracing::trace!(
            changes = changes.len(),
            len = view.entities.len(),
            version = view.version,
            "Filtered view updated"
        );
        true
    }

    /// Replace the whole content and publish a single reset.
    pub(crate) fn replace(&self, indices: Vec<usize>, entities: Vec<Entity>) {
        debug_assert_eq!(indices.len(), entities.len());
        let mut view = self.write();
        view.indices = indices;
        view.entities = entities;
        let change = ViewChange::Reset {
            len: view.entities.len(),
        };
        view.publish(std::slice::from_ref(&change));
    }
}

impl std::fmt::Debug for FilteredView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("FilteredView")
            .field("len", &state.entities.len())
            .field("version", &state.version)
            .finish()
    }
}

/// Accumulates view edits, coalescing contiguous runs of the same kind.
#[derive(Default)]
struct ChangeBatch {
    pending: Option<ViewChange>,
    done: Vec<ViewChange>,
}

impl ChangeBatch {
    fn added(&mut self, position: usize, entity: Entity) {
        if let Some(ViewChange::Added { index, entities }) = &mut self.pending {
            if position == *index + entities.len() {
                entities.push(entity);
                return;
            }
        }
        self.flush();
        self.pending = Some(ViewChange::Added {
            index: position,
            entities: vec![entity],
        });
    }

    fn removed(&mut self, position: usize, entity: Entity) {
        if let Some(ViewChange::Removed { index, entities }) = &mut self.pending {
            if position == *index {
                entities.push(entity);
                return;
            }
        }
        self.flush();
        self.pending = Some(ViewChange::Removed {
            index: position,
            entities: vec![entity],
        });
    }

    fn flush(&mut self) {
        if let Some(change) = self.pending.take() {
            self.done.push(change);
        }
    }

    fn finish(mut self) -> Vec<ViewChange> {
        self.flush();
        self.done
    }
}
