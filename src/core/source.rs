// logsieve - core/source.rs
//
// Append-only, observable sequence of entities.
//
// Appends are serialised; subscribers are notified after the new items are
// visible, in append order, and never while the item lock is held so a
// callback may read the sequence freely.

use crate::core::entity::Entity;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Notification raised by a source sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// `count` items were appended starting at `index`.
    ItemsAdded {
        batch: u64,
        index: usize,
        count: usize,
    },
}

/// Return `false` from a subscriber to unsubscribe.
pub type SourceCallback = Arc<dyn Fn(&SourceEvent) -> bool + Send + Sync>;

/// Summary of one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceBatch {
    pub batch: u64,
    pub index: usize,
    pub count: usize,
}

/// Shared handle to an append-only entity sequence.
#[derive(Clone)]
pub struct SourceSequence {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    id: u64,
    items: RwLock<Vec<Entity>>,
    subscribers: Mutex<Vec<SourceCallback>>,
    append_lock: Mutex<u64>,
}

impl Default for SourceSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceSequence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SourceInner {
                id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
                items: RwLock::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                append_lock: Mutex::new(0),
            }),
        }
    }

    /// Unique source identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn items(&self) -> RwLockReadGuard<'_, Vec<Entity>> {
        self.inner
            .items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<SourceCallback>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Entity> {
        self.items().get(index).cloned()
    }

    /// Clone the entities in `range`, clamped to the current length.
    pub fn slice(&self, range: Range<usize>) -> Vec<Entity> {
        let items = self.items();
        let end = range.end.min(items.len());
        let start = range.start.min(end);
        items[start..end].to_vec()
    }

    /// Append entities and notify subscribers. Empty appends are ignored.
    pub fn append(&self, entities: Vec<Entity>) -> Option<SourceBatch> {
        if entities.is_empty() {
            return None;
        }
        let mut next_batch = self
            .inner
            .append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let count = entities.len();
        let index = {
            let mut items = self
                .inner
                .items
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let index = items.len();
            items.extend(entities);
            index
        };
        let batch = SourceBatch {
            batch: *next_batch,
            index,
            count,
        };
        *next_batch += 1;

        tracing::trace!(source = self.inner.id, index, count, "Source items added");
        let event = SourceEvent::ItemsAdded {
            batch: batch.batch,
            index,
            count,
        };
        // Snapshot so a callback may subscribe without deadlocking.
        let callbacks: Vec<SourceCallback> = self.subscribers().clone();
        let dropped: Vec<SourceCallback> = callbacks
            .into_iter()
            .filter(|callback| !callback(&event))
            .collect();
        if !dropped.is_empty() {
            self.subscribers()
                .retain(|s| !dropped.iter().any(|d| Arc::ptr_eq(s, d)));
        }
        Some(batch)
    }

    /// Register a callback invoked synchronously on every append.
    pub fn subscribe_with(&self, callback: SourceCallback) {
        self.subscribers().push(callback);
    }

    /// Channel-based subscription. The subscription ends when the
    /// receiver is dropped.
    pub fn subscribe(&self) -> Receiver<SourceEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribe_with(Arc::new(move |event: &SourceEvent| {
            tx.send(event.clone()).is_ok()
        }));
        rx
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl std::fmt::Debug for SourceSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSequence")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::group::RecordGroup;
    use crate::core::model::{Level, Record};

    fn entities(group: &RecordGroup, n: usize) -> Vec<Entity> {
        (0..n)
            .map(|i| group.wrap(Record::new(Level::Info, format!("r{i}"))).unwrap())
            .collect()
    }

    #[test]
    fn test_append_notifies_in_order() {
        let group = RecordGroup::new(1, None);
        let source = SourceSequence::new();
        let rx = source.subscribe();

        source.append(entities(&group, 3));
        source.append(entities(&group, 2));
        assert!(source.append(Vec::new()).is_none());

        assert_eq!(
            rx.try_recv().unwrap(),
            SourceEvent::ItemsAdded {
                batch: 0,
                index: 0,
                count: 3
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SourceEvent::ItemsAdded {
                batch: 1,
                index: 3,
                count: 2
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(source.len(), 5);
    }

    #[test]
    fn test_dropped_receiver_unsubscribes() {
        let group = RecordGroup::new(1, None);
        let source = SourceSequence::new();
        let rx = source.subscribe();
        drop(rx);
        source.append(entities(&group, 1));
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_slice_clamps() {
        let group = RecordGroup::new(1, None);
        let source = SourceSequence::new();
        source.append(entities(&group, 4));
        assert_eq!(source.slice(2..10).len(), 2);
        assert!(source.slice(7..9).is_empty());
    }
}
