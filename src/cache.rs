use crate::entity::{Entity, EntityInner};
use crate::id::EntityId;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Per-document weak-valued map from entity id to its live entity. The
/// cache never keeps entities alive; it only guarantees that two lookups
/// of the same id yield the same object while one is alive.
#[derive(Default)]
pub(crate) struct EntityCache {
    entries: Mutex<FnvHashMap<EntityId, Weak<EntityInner>>>,
}

impl EntityCache {
    pub(crate) fn insert(&self, id: EntityId, entity: &Arc<EntityInner>) {
        self.entries.lock().insert(id, Arc::downgrade(entity));
    }

    pub(crate) fn live(&self, id: &EntityId) -> Option<Entity> {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(weak) => match weak.upgrade() {
                Some(inner) => Some(Entity::from_inner(inner)),
                None => {
                    entries.remove(id);
                    None
                }
            },
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn lookups_preserve_identity() {
        let cache = EntityCache::default();
        let entity = testutil::models().holder.create_empty().unwrap();
        cache.insert(entity.id(), entity.inner());
        let live = cache.live(&entity.id()).unwrap();
        assert!(live.same(&entity));
    }

    #[test]
    fn collected_entries_vanish() {
        let cache = EntityCache::default();
        let id = {
            let entity = testutil::models().holder.create_empty().unwrap();
            cache.insert(entity.id(), entity.inner());
            entity.id()
        };
        assert!(cache.live(&id).is_none());
    }
}
