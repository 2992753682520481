// logsieve - app/session.rs
//
// Session boundary: owns the current record group and the memory
// governor, and hands processors a narrow accessor instead of itself.
//
// Design principles:
// - The group is created lazily on the first wrap, and its creation is
//   announced once to every accessor subscriber. Late subscribers get
//   the current group's announcement replayed so lazy consumers never
//   miss it.
// - Ending the session closes the group: every entity becomes stale and
//   the memory counter returns to zero. A later wrap starts a new group.
// - Processors can read the group and policy but cannot end the session
//   or change its policy.

use crate::app::memory::MemoryGovernor;
use crate::core::entity::Entity;
use crate::core::group::RecordGroup;
use crate::core::model::Record;
use crate::core::policy::MemoryUsagePolicy;
use crate::platform::config::AppConfig;
use crate::util::error::GroupError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

/// Announcement that a record group produced its first entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCreated {
    pub group: u64,
}

/// Read-only view of a session given to processors.
pub trait SessionAccessor: Send + Sync {
    /// The current group, if one has been created.
    fn group(&self) -> Option<RecordGroup>;

    /// Subscribe to group creation. The current group, if already
    /// announced, is delivered immediately.
    fn on_group_created(&self) -> Receiver<GroupCreated>;

    /// The active memory usage policy.
    fn memory_usage_policy(&self) -> MemoryUsagePolicy;

    /// Governor answering retention and throttling questions for the
    /// active policy.
    fn memory_governor(&self) -> Arc<MemoryGovernor>;
}

#[derive(Default)]
struct Announcements {
    current: Option<u64>,
    subscribers: Vec<Sender<GroupCreated>>,
}

struct SessionShared {
    group: RwLock<Option<RecordGroup>>,
    next_group: AtomicU64,
    announcements: Mutex<Announcements>,
    governor: Arc<MemoryGovernor>,
}

impl SessionShared {
    fn announcements(&self) -> MutexGuard<'_, Announcements> {
        self.announcements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn announce(&self, group: u64) {
        let mut announcements = self.announcements();
        announcements.current = Some(group);
        let event = GroupCreated { group };
        announcements
            .subscribers
            .retain(|subscriber| subscriber.send(event).is_ok());
        tracing::info!(group, "Record group created");
    }

    fn current_group(&self) -> Option<RecordGroup> {
        self.group
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// One processing session.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(policy: MemoryUsagePolicy, max_pause: Duration) -> Self {
        Self::with_governor(Arc::new(MemoryGovernor::new(policy, max_pause)))
    }

    pub fn with_governor(governor: Arc<MemoryGovernor>) -> Self {
        tracing::debug!(policy = %governor.policy(), "Session started");
        Self {
            shared: Arc::new(SessionShared {
                group: RwLock::new(None),
                next_group: AtomicU64::new(1),
                announcements: Mutex::new(Announcements::default()),
                governor,
            }),
        }
    }

    /// Session using the memory settings of a loaded config.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.memory_policy, config.max_pause)
    }

    fn group_or_create(&self) -> RecordGroup {
        if let Some(group) = self.shared.current_group() {
            return group;
        }
        let mut slot = self
            .shared
            .group
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(group) = slot.as_ref() {
            return group.clone();
        }
        let id = self.shared.next_group.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<SessionShared> = Arc::downgrade(&self.shared);
        let group = RecordGroup::new(
            id,
            Some(Box::new(move |group_id| {
                if let Some(shared) = weak.upgrade() {
                    shared.announce(group_id);
                }
            })),
        );
        *slot = Some(group.clone());
        group
    }

    /// Wrap one record into the current group.
    pub fn wrap(&self, record: impl Into<Arc<Record>>) -> Result<Entity, GroupError> {
        self.group_or_create().wrap(record)
    }

    /// Wrap several records, stopping at the first failure.
    pub fn wrap_all<I>(&self, records: I) -> Result<Vec<Entity>, GroupError>
    where
        I: IntoIterator,
        I::Item: Into<Arc<Record>>,
    {
        let group = self.group_or_create();
        let records = records.into_iter();
        let mut entities = Vec::with_capacity(records.size_hint().0);
        for record in records {
            entities.push(group.wrap(record)?);
        }
        Ok(entities)
    }

    /// Release an entity from the current group.
    pub fn release(&self, entity: &Entity) -> bool {
        self.shared
            .current_group()
            .is_some_and(|group| group.release(entity))
    }

    pub fn group(&self) -> Option<RecordGroup> {
        self.shared.current_group()
    }

    /// End the session: close and drop the current group.
    pub fn end(&self) {
        let group = self
            .shared
            .group
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(group) = group {
            group.close();
        }
        self.shared.announcements().current = None;
    }

    pub fn memory_usage_policy(&self) -> MemoryUsagePolicy {
        self.shared.governor.policy()
    }

    pub fn set_memory_usage_policy(&self, policy: MemoryUsagePolicy) {
        self.shared.governor.set_policy(policy);
        if let Some(group) = self.shared.current_group() {
            self.shared.governor.relieve(&group);
        }
    }

    /// Estimated bytes held by the current group.
    pub fn memory_usage(&self) -> usize {
        self.shared
            .current_group()
            .map_or(0, |group| group.memory_usage())
    }

    pub fn memory_governor(&self) -> Arc<MemoryGovernor> {
        Arc::clone(&self.shared.governor)
    }

    /// Narrow accessor for processors.
    pub fn accessor(&self) -> Arc<dyn SessionAccessor> {
        Arc::new(SessionAccess {
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.end();
    }
}

struct SessionAccess {
    shared: Arc<SessionShared>,
}

impl SessionAccessor for SessionAccess {
    fn group(&self) -> Option<RecordGroup> {
        self.shared.current_group()
    }

    fn on_group_created(&self) -> Receiver<GroupCreated> {
        let (tx, rx) = mpsc::channel();
        let mut announcements = self.shared.announcements();
        if let Some(group) = announcements.current {
            // Receiver is alive: the send cannot fail.
            let _ = tx.send(GroupCreated { group });
        }
        announcements.subscribers.push(tx);
        rx
    }

    fn memory_usage_policy(&self) -> MemoryUsagePolicy {
        self.shared.governor.policy()
    }

    fn memory_governor(&self) -> Arc<MemoryGovernor> {
        Arc::clone(&self.shared.governor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Level;
    use crate::util::error::EntityError;

    fn session() -> Session {
        Session::new(MemoryUsagePolicy::Unlimited, Duration::ZERO)
    }

    #[test]
    fn test_group_created_lazily_and_announced_once() {
        let session = session();
        let accessor = session.accessor();
        let rx = accessor.on_group_created();
        assert!(accessor.group().is_none());

        session.wrap(Record::new(Level::Info, "first")).unwrap();
        session.wrap(Record::new(Level::Info, "second")).unwrap();

        let group = accessor.group().unwrap();
        assert_eq!(rx.try_recv().unwrap(), GroupCreated { group: group.id() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_late_subscriber_gets_replay() {
        let session = session();
        session.wrap(Record::new(Level::Info, "first")).unwrap();
        let rx = session.accessor().on_group_created();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_end_invalidates_and_next_wrap_starts_new_group() {
        let session = session();
        let accessor = session.accessor();
        let rx = accessor.on_group_created();
        let entity = session.wrap(Record::new(Level::Info, "old")).unwrap();
        let first = rx.try_recv().unwrap();

        session.end();
        assert!(matches!(entity.record(), Err(EntityError::Stale { .. })));
        assert_eq!(session.memory_usage(), 0);
        assert!(accessor.group().is_none());
        assert!(accessor.on_group_created().try_recv().is_err());

        session.wrap(Record::new(Level::Info, "new")).unwrap();
        let second = rx.try_recv().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrap_all_and_release() {
        let session = session();
        let entities = session
            .wrap_all((0..3).map(|i| Record::new(Level::Debug, format!("r{i}"))))
            .unwrap();
        let total: usize = entities.iter().map(Entity::estimated_size).sum();
        assert_eq!(session.memory_usage(), total);
        assert!(session.release(&entities[0]));
        assert!(!session.release(&entities[0]));
        assert_eq!(
            session.memory_usage(),
            total - entities[0].estimated_size()
        );
    }

    #[test]
    fn test_accessor_sees_policy_changes() {
        let session = session();
        let accessor = session.accessor();
        let policy = MemoryUsagePolicy::Fixed { quota_bytes: 4_096 };
        session.set_memory_usage_policy(policy);
        assert_eq!(accessor.memory_usage_policy(), policy);
    }
}
