// logsieve - core/group.rs
//
// The record group owns every entity created for one session, the shared
// key interner, and the running memory counter.
//
// Invariants:
//   - every entity belongs to exactly one group (its creator),
//   - `memory_usage()` equals the sum of `estimated_size()` over the
//     group's live entities,
//   - wrap/release are O(1) on the counter and serialised by the entity
//     map lock; reads of the counter are lock-free.

use crate::core::entity::Entity;
use crate::core::model::Record;
use crate::util::error::GroupError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback fired exactly once, on the group's first successful wrap.
pub type CreatedHook = Box<dyn Fn(u64) + Send + Sync>;

/// Owner of all entities and shared caches for one session.
#[derive(Clone)]
pub struct RecordGroup {
    shared: Arc<GroupShared>,
}

pub(crate) struct GroupShared {
    id: u64,
    entities: Mutex<HashMap<u64, Entity>>,
    memory: AtomicUsize,
    next_entity: AtomicU64,
    interner: Mutex<HashSet<Arc<str>>>,
    open: AtomicBool,
    announced: AtomicBool,
    on_created: Option<CreatedHook>,
}

impl GroupShared {
    pub(crate) fn charge(&self, bytes: usize) {
        self.memory.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn credit(&self, bytes: usize) {
        // Saturating so a racing close() that already zeroed the counter
        // cannot wrap it around.
        let _ = self
            .memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn entities(&self) -> MutexGuard<'_, HashMap<u64, Entity>> {
        self.entities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for GroupShared {
    fn drop(&mut self) {
        let entities = self
            .entities
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entity in entities.values() {
            entity.mark_released();
        }
    }
}

impl RecordGroup {
    /// Create an open, empty group.
    pub fn new(id: u64, on_created: Option<CreatedHook>) -> Self {
        Self {
            shared: Arc::new(GroupShared {
                id,
                entities: Mutex::new(HashMap::new()),
                memory: AtomicUsize::new(0),
                next_entity: AtomicU64::new(0),
                interner: Mutex::new(HashSet::new()),
                open: AtomicBool::new(true),
                announced: AtomicBool::new(false),
                on_created,
            }),
        }
    }

    /// Group identifier.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// False once the group has been closed.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Current estimated memory usage of all live entities, in bytes.
    pub fn memory_usage(&self) -> usize {
        self.shared.memory.load(Ordering::Acquire)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.shared.entities().len()
    }

    /// True if the group holds no live entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `entity` is a live member of this group.
    pub fn contains(&self, entity: &Entity) -> bool {
        entity.group_id() == self.shared.id
            && self
                .shared
                .entities()
                .get(&entity.id())
                .is_some_and(|e| e == entity)
    }

    fn intern_keys(&self, record: &Record) -> Vec<Arc<str>> {
        let mut interner = self
            .shared
            .interner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        record
            .fields
            .keys()
            .map(|key| {
                let lowered = key.to_lowercase();
                if let Some(existing) = interner.get(lowered.as_str()) {
                    Arc::clone(existing)
                } else {
                    let interned: Arc<str> = Arc::from(lowered);
                    interner.insert(Arc::clone(&interned));
                    interned
                }
            })
            .collect()
    }

    /// Wrap a record into a new entity owned by this group.
    ///
    /// The first successful wrap fires the group's created hook.
    pub fn wrap(&self, record: impl Into<Arc<Record>>) -> Result<Entity, GroupError> {
        let group = self.shared.id;
        if !self.is_open() {
            return Err(GroupError::Closed { group });
        }
        let record = record.into();
        let keys = self.intern_keys(&record);
        let id = self.shared.next_entity.fetch_add(1, Ordering::Relaxed);
        let entity = Entity::new(id, group, record, keys, Arc::downgrade(&self.shared));
        let size = entity.estimated_size();

        {
            let mut entities = self.shared.entities();
            // Checked again under the lock: close() drains under it.
            if !self.is_open() {
                return Err(GroupError::Closed { group });
            }
            entities
                .try_reserve(1)
                .map_err(|_| GroupError::AllocationFailed {
                    group,
                    requested: 1,
                })?;
            entities.insert(id, entity.clone());
            self.shared.charge(size);
        }

        if !self.shared.announced.swap(true, Ordering::AcqRel) {
            tracing::debug!(group, "Record group created");
            if let Some(hook) = &self.shared.on_created {
                hook(group);
            }
        }
        Ok(entity)
    }

    /// Release an entity. Returns false (and does nothing) if it was
    /// already released or belongs to another group.
    pub fn release(&self, entity: &Entity) -> bool {
        if entity.group_id() != self.shared.id {
            return false;
        }
        let mut entities = self.shared.entities();
        if entities.remove(&entity.id()).is_none() {
            return false;
        }
        if let Some(size) = entity.mark_released() {
            self.shared.credit(size);
        }
        true
    }

    /// Drop every entity's derived caches. Returns the bytes freed.
    pub fn shed_caches(&self) -> usize {
        let members: Vec<Entity> = self.shared.entities().values().cloned().collect();
        let freed: usize = members.iter().map(Entity::shed_cache).sum();
        if freed > 0 {
            tracing::debug!(group = self.shared.id, freed, "Shed entity caches");
        }
        freed
    }

    /// Close the group: every entity becomes stale and the counter drops
    /// to zero. Further wraps fail with `GroupError::Closed`.
    pub fn close(&self) {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Entity> = {
            let mut entities = self.shared.entities();
            let drained: Vec<Entity> = entities.drain().map(|(_, e)| e).collect();
            for entity in &drained {
                entity.mark_released();
            }
            self.shared.memory.store(0, Ordering::Release);
            drained
        };
        tracing::info!(
            group = self.shared.id,
            entities = drained.len(),
            "Record group closed"
        );
    }
}

impl std::fmt::Debug for RecordGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordGroup")
            .field("id", &self.shared.id)
            .field("open", &self.is_open())
            .field("memory", &self.memory_usage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Level;
    use crate::util::error::EntityError;
    use std::sync::atomic::AtomicUsize;

    fn record(message: &str) -> Record {
        Record::new(Level::Info, message)
    }

    #[test]
    fn test_wrap_charges_estimated_size() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("alpha")).unwrap();
        let b = group.wrap(record("beta with a longer message")).unwrap();
        assert_eq!(
            group.memory_usage(),
            a.estimated_size() + b.estimated_size()
        );
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("alpha")).unwrap();
        let b = group.wrap(record("beta")).unwrap();
        assert!(group.release(&a));
        assert!(!group.release(&a));
        assert_eq!(group.memory_usage(), b.estimated_size());
        assert!(matches!(a.record(), Err(EntityError::Stale { .. })));
    }

    #[test]
    fn test_created_hook_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let group = RecordGroup::new(
            9,
            Some(Box::new(move |id| {
                assert_eq!(id, 9);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        group.wrap(record("one")).unwrap();
        group.wrap(record("two")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_equal_records_are_distinct_entities() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("same")).unwrap();
        let b = group.wrap(record("same")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_cache_bytes_follow_counter() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("Hello World")).unwrap();
        let before = group.memory_usage();
        let allow = |_bytes: usize| true;
        assert_eq!(&*a.normalized_message(&allow).unwrap(), "hello world");
        assert_eq!(group.memory_usage(), before + "hello world".len());
        assert_eq!(group.memory_usage(), a.estimated_size());

        assert_eq!(group.shed_caches(), "hello world".len());
        assert_eq!(group.memory_usage(), before);
        assert!(!a.has_cached_message());
    }

    #[test]
    fn test_denied_retention_computes_without_caching() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("ABC")).unwrap();
        let before = group.memory_usage();
        let deny = |_bytes: usize| false;
        assert_eq!(&*a.normalized_message(&deny).unwrap(), "abc");
        assert!(!a.has_cached_message());
        assert_eq!(group.memory_usage(), before);
    }

    #[test]
    fn test_close_invalidates_entities() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("alpha")).unwrap();
        group.close();
        assert!(a.is_stale());
        assert_eq!(group.memory_usage(), 0);
        assert!(matches!(
            group.wrap(record("late")),
            Err(GroupError::Closed { group: 1 })
        ));
    }

    #[test]
    fn test_released_entity_rejects_mark_access() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("alpha")).unwrap();
        a.set_marked(true).unwrap();
        assert!(a.is_marked().unwrap());
        let size = a.estimated_size();

        assert!(group.release(&a));
        assert!(matches!(a.is_marked(), Err(EntityError::Stale { .. })));
        assert!(matches!(a.set_marked(false), Err(EntityError::Stale { .. })));
        assert_eq!(a.estimated_size(), size);
    }

    #[test]
    fn test_dropped_group_invalidates_entities() {
        let group = RecordGroup::new(1, None);
        let a = group.wrap(record("alpha")).unwrap();
        drop(group);
        assert!(matches!(a.record(), Err(EntityError::Stale { .. })));
    }

    #[test]
    fn test_field_lookup_ignores_case() {
        let group = RecordGroup::new(1, None);
        let a = group
            .wrap(record("x").with_field("Request-ID", "42"))
            .unwrap();
        assert_eq!(a.field("request-id").unwrap(), Some("42"));
        assert_eq!(a.field("REQUEST-ID").unwrap(), Some("42"));
        assert_eq!(a.field("missing").unwrap(), None);
    }

    #[test]
    fn test_release_from_other_group_is_noop() {
        let first = RecordGroup::new(1, None);
        let second = RecordGroup::new(2, None);
        let a = first.wrap(record("alpha")).unwrap();
        assert!(!second.release(&a));
        assert!(!a.is_stale());
    }
}
