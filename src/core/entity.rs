// logsieve - core/entity.rs
//
// An Entity wraps one immutable Record with session-scoped state: a
// back-reference to its owning group, a marked flag, and derived caches
// whose bytes are charged to the group's memory counter.
//
// Identity is by reference. Two entities wrapping equal records are
// distinct; equality and hashing use the shared allocation.

use crate::core::group::GroupShared;
use crate::core::model::Record;
use crate::core::policy::CacheRetention;
use crate::util::constants::ENTITY_BASE_SIZE;
use crate::util::error::EntityError;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Handle to a wrapped record. Cheap to clone.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

struct EntityInner {
    id: u64,
    group_id: u64,
    record: Arc<Record>,
    /// Lower-cased, group-interned keys in the same order as `record.fields`.
    field_keys: Vec<Arc<str>>,
    group: Weak<GroupShared>,
    marked: AtomicBool,
    /// Payload estimate fixed at creation (record bytes + overhead).
    base_size: usize,
    /// Guards the release flag together with the caches so that the bytes
    /// charged to the group never drift from the bytes actually held.
    slot: Mutex<EntitySlot>,
}

#[derive(Default)]
struct EntitySlot {
    released: bool,
    normalized_message: Option<Arc<str>>,
}

impl EntitySlot {
    fn cache_bytes(&self) -> usize {
        self.normalized_message.as_ref().map_or(0, |s| s.len())
    }
}

impl Entity {
    pub(crate) fn new(
        id: u64,
        group_id: u64,
        record: Arc<Record>,
        field_keys: Vec<Arc<str>>,
        group: Weak<GroupShared>,
    ) -> Self {
        let base_size = ENTITY_BASE_SIZE
            + record.estimated_size()
            + field_keys.len() * std::mem::size_of::<Arc<str>>();
        Self {
            inner: Arc::new(EntityInner {
                id,
                group_id,
                record,
                field_keys,
                group,
                marked: AtomicBool::new(false),
                base_size,
                slot: Mutex::new(EntitySlot::default()),
            }),
        }
    }

    /// Sequence number of this entity within its group.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// ID of the owning group.
    pub fn group_id(&self) -> u64 {
        self.inner.group_id
    }

    fn slot(&self) -> MutexGuard<'_, EntitySlot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stale_error(&self) -> EntityError {
        EntityError::Stale {
            entity: self.inner.id,
            group: self.inner.group_id,
        }
    }

    /// True once the entity was released or its group closed or dropped.
    pub fn is_stale(&self) -> bool {
        self.slot().released || self.inner.group.strong_count() == 0
    }

    fn ensure_live(&self) -> Result<(), EntityError> {
        if self.is_stale() {
            Err(self.stale_error())
        } else {
            Ok(())
        }
    }

    /// The wrapped record.
    pub fn record(&self) -> Result<&Record, EntityError> {
        self.ensure_live()?;
        Ok(&self.inner.record)
    }

    /// Look up a field by name, ignoring case.
    pub fn field(&self, name: &str) -> Result<Option<&str>, EntityError> {
        self.ensure_live()?;
        let wanted = name.to_lowercase();
        Ok(self
            .inner
            .field_keys
            .iter()
            .zip(self.inner.record.fields.values())
            .find(|(key, _)| key.as_ref() == wanted)
            .map(|(_, value)| value.as_str()))
    }

    /// Whether the user marked this entity.
    pub fn is_marked(&self) -> Result<bool, EntityError> {
        self.ensure_live()?;
        Ok(self.inner.marked.load(Ordering::Acquire))
    }

    /// Mark or unmark the entity. Filters that honour marks must be
    /// told through `invalidate` to re-evaluate it.
    pub fn set_marked(&self, marked: bool) -> Result<(), EntityError> {
        self.ensure_live()?;
        self.inner.marked.store(marked, Ordering::Release);
        Ok(())
    }

    /// Lower-cased message text, cached when `retention` allows it.
    ///
    /// The cache is a recomputable derived value; when retention is denied
    /// the text is computed and returned without being kept.
    pub fn normalized_message(
        &self,
        retention: &dyn CacheRetention,
    ) -> Result<Arc<str>, EntityError> {
        let mut slot = self.slot();
        if slot.released || self.inner.group.strong_count() == 0 {
            return Err(self.stale_error());
        }
        if let Some(cached) = &slot.normalized_message {
            return Ok(Arc::clone(cached));
        }
        let normalized: Arc<str> = Arc::from(self.inner.record.message.to_lowercase());
        if retention.may_retain(normalized.len()) {
            slot.normalized_message = Some(Arc::clone(&normalized));
            if let Some(group) = self.inner.group.upgrade() {
                group.charge(normalized.len());
            }
        }
        Ok(normalized)
    }

    /// Whether a normalized message is currently cached.
    pub fn has_cached_message(&self) -> bool {
        self.slot().normalized_message.is_some()
    }

    /// Estimated footprint: payload plus retained caches.
    ///
    /// Accounting metadata rather than record access, so it also answers
    /// for stale entities: a released entity reports its payload alone.
    pub fn estimated_size(&self) -> usize {
        self.inner.base_size + self.slot().cache_bytes()
    }

    /// Drop derived caches. Returns the bytes released from the group.
    pub(crate) fn shed_cache(&self) -> usize {
        let mut slot = self.slot();
        if slot.released {
            return 0;
        }
        let freed = slot.cache_bytes();
        slot.normalized_message = None;
        if freed > 0 {
            if let Some(group) = self.inner.group.upgrade() {
                group.credit(freed);
            }
        }
        freed
    }

    /// Flip to released. Returns the footprint to subtract from the group,
    /// or `None` when the entity was already released.
    pub(crate) fn mark_released(&self) -> Option<usize> {
        let mut slot = self.slot();
        if slot.released {
            return None;
        }
        slot.released = true;
        let size = self.inner.base_size + slot.cache_bytes();
        slot.normalized_message = None;
        Some(size)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .field("group", &self.inner.group_id)
            .field("level", &self.inner.record.level)
            .field("message", &self.inner.record.message)
            .finish()
    }
}
