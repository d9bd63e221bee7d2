use crate::doc::DocShared;
use crate::entity::PARENT_FIELD;
use crate::id::EntityId;
use crate::list::report_index_diff;
use crate::reference;
use crate::schema::Shape;
use crate::tracking::{self, Key, Target};
use crate::txn::ParentEntry;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use yrs::types::{Event, PathSegment};
use yrs::{Any, Array, DeepObservable, Map, MapRef, Out, ReadTxn, Subscription, TransactionMut};

// Every document carries one deep subscription on its models map. Remote
// updates, undo steps and the echo of local transactions all arrive here;
// mirrors are refreshed against the stored state and only actual changes
// are reported, so locally mirrored writes never notify twice.

pub(crate) fn install(doc: &Arc<DocShared>, models: &MapRef) -> Subscription {
    let weak: Weak<DocShared> = Arc::downgrade(doc);
    models.observe_deep(move |txn, events| {
        let Some(doc) = weak.upgrade() else {
            return;
        };
        tracking::defer_notifications(|| {
            for event in events.iter() {
                dispatch(&doc, txn, event);
            }
        });
    })
}

fn dispatch(doc: &Arc<DocShared>, txn: &TransactionMut, event: &Event) {
    let path: Vec<PathSegment> = match event {
        Event::Map(event) => event.path().into_iter().collect(),
        Event::Array(event) => event.path().into_iter().collect(),
        _ => return,
    };
    match path.as_slice() {
        // the models map itself: entities appearing or vanishing; there is
        // no mirror to refresh until someone loads them
        [] => {}
        [PathSegment::Key(id)] => refresh_entity(doc, txn, &EntityId::from(id.as_ref())),
        [PathSegment::Key(id), PathSegment::Key(field)] => {
            refresh_field(doc, txn, &EntityId::from(id.as_ref()), field)
        }
        _ => {}
    }
}

fn stored_entity_map(doc: &Arc<DocShared>, txn: &TransactionMut, id: &EntityId) -> Option<MapRef> {
    match doc.models(txn).get(txn, id.as_str()) {
        Some(Out::YMap(map)) => Some(map),
        _ => None,
    }
}

/// Reconciles the value-shaped fields and the parent pointer of a cached
/// entity with its stored subtree.
fn refresh_entity(doc: &Arc<DocShared>, txn: &TransactionMut, id: &EntityId) {
    let Some(entity) = doc.cache.live(id) else {
        return;
    };
    let Some(map) = stored_entity_map(doc, txn, id) else {
        return;
    };

    let stored_parent = map
        .get(txn, crate::doc::PARENT_KEY)
        .and_then(|out| match out {
            Out::Any(any) => ParentEntry::from_any(&any),
            _ => None,
        });
    if stored_parent != entity.parent_entry() {
        entity.install_parent_entry(stored_parent);
        tracking::report_modify(
            &Target::entity(entity.id()),
            &Key::Field(PARENT_FIELD.into()),
        );
    }

    for (name, descriptor) in entity.model().schema().iter() {
        if descriptor.kind.shape() != Shape::Value {
            continue;
        }
        let stored = match map.get(txn, name) {
            None => crate::value::Value::Null,
            Some(out) => match reference::decode_stored(doc, txn, &out) {
                Ok(value) => value,
                Err(err) => {
                    tracing::error!(id = %id, field = %name, %err, "undecodable stored value");
                    continue;
                }
            },
        };
        if entity.slot_value(name) != stored {
            entity.install_value(name, stored);
            tracking::report_modify(&Target::entity(entity.id()), &Key::Field(name.clone()));
        }
    }
}

/// Reconciles one container field of a cached entity with its stored
/// container, emitting the narrowest keys the diff allows.
fn refresh_field(doc: &Arc<DocShared>, txn: &TransactionMut, id: &EntityId, field: &str) {
    let Some(entity) = doc.cache.live(id) else {
        return;
    };
    let Some((name, shape, is_set)) = entity
        .model()
        .schema()
        .iter()
        .find(|(name, _)| &***name == field)
        .map(|(name, descriptor)| {
            (
                name.clone(),
                descriptor.kind.shape(),
                descriptor.kind.is_set(),
            )
        })
    else {
        return;
    };
    let Some(map) = stored_entity_map(doc, txn, id) else {
        return;
    };
    let proxy = Target::field(entity.id(), name.clone());

    match (shape, map.get(txn, field)) {
        (Shape::Array, Some(Out::YArray(array))) => {
            let mut stored = Vec::with_capacity(array.len(txn) as usize);
            for item in array.iter(txn) {
                match reference::decode_stored(doc, txn, &item) {
                    Ok(value) => stored.push(value),
                    Err(err) => {
                        tracing::error!(id = %id, field, %err, "undecodable array element");
                        return;
                    }
                }
            }
            let mirror = entity.slot_values(&name);
            if mirror == stored {
                return;
            }
            entity.install_values(&name, stored.clone(), is_set);
            if is_set {
                tracking::report_modify(&proxy, &Key::Indices);
            } else {
                report_index_diff(&proxy, &mirror, &stored);
            }
        }
        (Shape::Map, Some(Out::YMap(record))) => {
            let keys: Vec<String> = record.iter(txn).map(|(key, _)| key.to_string()).collect();
            let mut stored = BTreeMap::new();
            for key in keys {
                let Some(item) = record.get(txn, &key) else {
                    continue;
                };
                match reference::decode_stored(doc, txn, &item) {
                    Ok(value) => {
                        stored.insert(key, value);
                    }
                    Err(err) => {
                        tracing::error!(id = %id, field, %err, "undecodable record entry");
                        return;
                    }
                }
            }
            let mirror = entity.slot_entries(&name);
            if mirror == stored {
                return;
            }
            let all_keys: std::collections::BTreeSet<&String> =
                mirror.keys().chain(stored.keys()).collect();
            let mut keyset_changed = false;
            for key in all_keys {
                match (mirror.get(key), stored.get(key)) {
                    (Some(a), Some(b)) if a == b => {}
                    (Some(_), Some(_)) => {
                        tracking::report_modify(&proxy, &Key::Field(key.as_str().into()))
                    }
                    _ => {
                        keyset_changed = true;
                        tracking::report_modify(&proxy, &Key::Field(key.as_str().into()));
                    }
                }
            }
            if keyset_changed {
                tracking::report_modify(&proxy, &Key::Indices);
            }
            entity.install_entries(&name, stored);
        }
        _ => {}
    }
}

/// Reads a stored metadata string outside any entity machinery.
pub(crate) fn metadata_string(doc: &yrs::Doc, key: &str) -> Option<String> {
    use yrs::Transact;
    let txn = doc.transact();
    let metadata = txn.get_map(crate::doc::METADATA)?;
    match metadata.get(&txn, key) {
        Some(Out::Any(Any::String(value))) => Some(value.to_string()),
        Some(Out::Any(Any::Number(value))) => Some(value.to_string()),
        _ => None,
    }
}
