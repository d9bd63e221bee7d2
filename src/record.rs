use crate::entity::Entity;
use crate::error::Result;
use crate::reference;
use crate::tracking::{self, Key, Target};
use crate::txn::{self, PendingOp};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A string-keyed view over a record field. For child records the record
/// key doubles as the child's parent sub-key.
#[derive(Clone)]
pub struct Record {
    owner: Entity,
    field: Arc<str>,
    child: bool,
}

impl Record {
    pub(crate) fn new(owner: Entity, field: Arc<str>, child: bool) -> Self {
        Self {
            owner,
            field,
            child,
        }
    }

    pub fn owner(&self) -> &Entity {
        &self.owner
    }

    fn proxy(&self) -> Target {
        Target::field(self.owner.id(), self.field.clone())
    }

    fn report_field_access(&self) {
        tracking::report_access(
            &Target::entity(self.owner.id()),
            &Key::Field(self.field.clone()),
        );
    }

    fn mirror(&self) -> BTreeMap<String, Value> {
        self.owner.slot_entries(&self.field)
    }

    // ------------------------------------------------------------------
    // reads

    pub fn get(&self, key: &str) -> Option<Value> {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::Field(key.into()));
        self.mirror().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::Indices);
        self.mirror().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::Indices);
        self.mirror().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::Indices);
        self.mirror().keys().cloned().collect()
    }

    /// A snapshot of the entries; reports a whole-container access.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::All);
        self.mirror()
    }

    pub fn iter(&self) -> std::collections::btree_map::IntoIter<String, Value> {
        self.to_map().into_iter()
    }

    // ------------------------------------------------------------------
    // writes

    /// Sets an entry. For child records the previous occupant is orphaned
    /// and a child arriving from another key of this record moves, its
    /// parent sub-key updated in the same transaction.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        value.check()?;
        txn::with(|| {
            let mirror = self.mirror();
            if mirror.get(key) == Some(&value) {
                return Ok(());
            }
            let mut next = mirror.clone();
            let mut moved_from: Option<String> = None;
            if self.child {
                if let Value::Entity(_) = &value {
                    moved_from = mirror.iter().find_map(|(existing_key, existing)| {
                        (existing == &value && existing_key.as_str() != key)
                            .then(|| existing_key.clone())
                    });
                }
            }
            if let Some(old_key) = &moved_from {
                next.remove(old_key);
            }
            let displaced = next.insert(key.to_string(), value.clone());

            if self.child {
                if let Some(Value::Entity(old)) = &displaced {
                    old.inform_orphanization()?;
                }
                if let Value::Entity(entity) = &value {
                    if moved_from.is_some() {
                        entity.inform_adoption(&self.owner, &self.field, Some(key.to_string()))?;
                    } else {
                        entity.request_adoption(
                            &self.owner,
                            &self.field,
                            Some(key.to_string()),
                        )?;
                    }
                }
            }

            if let Some(doc) = self.owner.binding() {
                if let Some(old_key) = &moved_from {
                    txn::enqueue(
                        &doc,
                        PendingOp::MapRemove {
                            id: self.owner.id(),
                            field: self.field.clone(),
                            key: old_key.clone(),
                        },
                    );
                }
                let encoded = reference::encode_value(&doc, &value)?;
                txn::enqueue(
                    &doc,
                    PendingOp::MapSet {
                        id: self.owner.id(),
                        field: self.field.clone(),
                        key: key.to_string(),
                        value: encoded,
                    },
                );
            }

            let keyset_changed = displaced.is_none() || moved_from.is_some();
            self.owner.install_entries(&self.field, next);
            let proxy = self.proxy();
            tracking::report_modify(&proxy, &Key::Field(key.into()));
            if let Some(old_key) = &moved_from {
                tracking::report_modify(&proxy, &Key::Field(old_key.as_str().into()));
            }
            if keyset_changed {
                tracking::report_modify(&proxy, &Key::Indices);
            }
            Ok(())
        })
    }

    /// Removes an entry; a removed child is orphaned.
    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        txn::with(|| {
            let mut next = self.mirror();
            let Some(removed) = next.remove(key) else {
                return Ok(None);
            };
            if self.child {
                if let Value::Entity(entity) = &removed {
                    entity.inform_orphanization()?;
                }
            }
            if let Some(doc) = self.owner.binding() {
                txn::enqueue(
                    &doc,
                    PendingOp::MapRemove {
                        id: self.owner.id(),
                        field: self.field.clone(),
                        key: key.to_string(),
                    },
                );
            }
            self.owner.install_entries(&self.field, next);
            let proxy = self.proxy();
            tracking::report_modify(&proxy, &Key::Field(key.into()));
            tracking::report_modify(&proxy, &Key::Indices);
            Ok(Some(removed))
        })
    }

    pub fn clear(&self) -> Result<()> {
        txn::with(|| {
            let mirror = self.mirror();
            if mirror.is_empty() {
                return Ok(());
            }
            if self.child {
                for value in mirror.values() {
                    if let Value::Entity(entity) = value {
                        entity.inform_orphanization()?;
                    }
                }
            }
            if let Some(doc) = self.owner.binding() {
                txn::enqueue(
                    &doc,
                    PendingOp::MapClear {
                        id: self.owner.id(),
                        field: self.field.clone(),
                    },
                );
            }
            self.owner.install_entries(&self.field, BTreeMap::new());
            let proxy = self.proxy();
            tracking::report_modify(&proxy, &Key::All);
            tracking::report_modify(&proxy, &Key::Indices);
            Ok(())
        })
    }

    /// Clears, then bulk-sets `entries`.
    pub fn assign(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        txn::with(|| {
            self.clear()?;
            for (key, value) in entries {
                self.set(&key, value)?;
            }
            Ok(())
        })
    }

    /// Removes the entry at `key` if it holds `entity`, without running
    /// the parent protocol; used by emancipation.
    pub(crate) fn remove_raw(&self, key: &str, entity: &Entity) -> Result<()> {
        let mut next = self.mirror();
        let holds = matches!(next.get(key), Some(Value::Entity(e)) if e.same(entity));
        if !holds {
            return Ok(());
        }
        next.remove(key);
        if let Some(doc) = self.owner.binding() {
            txn::enqueue(
                &doc,
                PendingOp::MapRemove {
                    id: self.owner.id(),
                    field: self.field.clone(),
                    key: key.to_string(),
                },
            );
        }
        self.owner.install_entries(&self.field, next);
        let proxy = self.proxy();
        tracking::report_modify(&proxy, &Key::Field(key.into()));
        tracking::report_modify(&proxy, &Key::Indices);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Init;
    use crate::testutil::models;

    fn node(name: &str) -> Entity {
        models()
            .node
            .create(Init::new().with("name", name))
            .unwrap()
    }

    #[test]
    fn entries_round_trip() {
        let owner = node("o");
        let meta = owner.record("meta").unwrap();
        meta.set("a", 1i64).unwrap();
        meta.set("b", "two").unwrap();
        assert_eq!(meta.get("a").unwrap(), Value::from(1i64));
        assert_eq!(meta.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(meta.remove("a").unwrap(), Some(Value::from(1i64)));
        assert!(meta.get("a").is_none());
    }

    #[test]
    fn child_entries_record_their_key_as_sub_key() {
        let owner = node("o");
        let child = node("c");
        let slots = owner.record("slots").unwrap();
        slots.set("header", &child).unwrap();

        let (parent, field, sub_key) = child.parent_info().unwrap();
        assert!(parent.same(&owner));
        assert_eq!(&*field, "slots");
        assert_eq!(sub_key.as_deref(), Some("header"));
    }

    #[test]
    fn moving_a_child_between_keys_updates_the_sub_key() {
        let owner = node("o");
        let child = node("c");
        let slots = owner.record("slots").unwrap();
        slots.set("a", &child).unwrap();
        slots.set("b", &child).unwrap();

        assert!(slots.get("a").is_none());
        assert!(slots.get("b").unwrap().as_entity().unwrap().same(&child));
        let (_, _, sub_key) = child.parent_info().unwrap();
        assert_eq!(sub_key.as_deref(), Some("b"));
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn displaced_children_are_orphaned() {
        let owner = node("o");
        let (a, b) = (node("a"), node("b"));
        let slots = owner.record("slots").unwrap();
        slots.set("k", &a).unwrap();
        slots.set("k", &b).unwrap();
        assert!(a.parent().is_none());
        assert!(b.parent().unwrap().same(&owner));
    }

    #[test]
    fn assign_replaces_everything() {
        let owner = node("o");
        let (a, b) = (node("a"), node("b"));
        let slots = owner.record("slots").unwrap();
        slots.set("old", &a).unwrap();

        let mut entries = BTreeMap::new();
        entries.insert("new".to_string(), Value::from(&b));
        slots.assign(entries).unwrap();

        assert!(a.parent().is_none());
        assert!(b.parent().unwrap().same(&owner));
        assert_eq!(slots.keys(), vec!["new".to_string()]);
    }

    #[test]
    fn keyed_readers_wake_precisely() {
        let owner = node("o");
        let meta = owner.record("meta").unwrap();
        meta.set("a", 1i64).unwrap();
        meta.set("b", 1i64).unwrap();

        use std::cell::Cell;
        use std::rc::Rc;
        let woken = Rc::new(Cell::new(0));
        let seen = woken.clone();
        let view = meta.clone();
        let (_, reader) = tracking::tracked_read(
            move || seen.set(seen.get() + 1),
            || view.get("a"),
        );
        meta.set("b", 2i64).unwrap();
        assert_eq!(woken.get(), 0);
        assert!(reader.is_armed());
        meta.set("a", 2i64).unwrap();
        assert_eq!(woken.get(), 1);
    }
}
