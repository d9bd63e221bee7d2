use crate::doc::DocShared;
use crate::error::Result;
use crate::id::EntityId;
use crate::schema::Shape;
use crate::tracking;
use std::cell::RefCell;
use std::sync::Arc;
use yrs::{Any, Array, ArrayPrelim, ArrayRef, Map, MapPrelim, MapRef, Out, ReadTxn, Transact, TransactionMut};

/// The stored shape of a parent pointer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ParentEntry {
    pub id: EntityId,
    pub field: Arc<str>,
    pub sub_key: Option<String>,
}

impl ParentEntry {
    pub(crate) fn to_any(&self) -> Any {
        let mut parts = vec![
            Any::String(self.id.as_str().into()),
            Any::String(self.field.clone()),
        ];
        if let Some(sub_key) = &self.sub_key {
            parts.push(Any::String(sub_key.as_str().into()));
        }
        Any::Array(parts.into())
    }

    pub(crate) fn from_any(any: &Any) -> Option<Self> {
        let Any::Array(parts) = any else { return None };
        if parts.len() < 2 || parts.len() > 3 {
            return None;
        }
        let mut strings = parts.iter().map(|part| match part {
            Any::String(s) => Some(s.clone()),
            _ => None,
        });
        let id = strings.next()??;
        let field = strings.next()??;
        let sub_key = match strings.next() {
            Some(s) => Some(s?.to_string()),
            None => None,
        };
        Some(Self {
            id: EntityId::from(id.as_ref()),
            field,
            sub_key,
        })
    }
}

/// A CRDT write staged by a proxy or by materialization. Ops are plain
/// data so the whole batch can be applied in a single substrate
/// transaction when the outermost engine transaction commits.
pub(crate) enum PendingOp {
    CreateModel {
        id: EntityId,
        type_name: Arc<str>,
        parent: Option<ParentEntry>,
    },
    SetField {
        id: EntityId,
        field: Arc<str>,
        value: Any,
    },
    SetParent {
        id: EntityId,
        parent: Option<ParentEntry>,
    },
    EnsureContainer {
        id: EntityId,
        field: Arc<str>,
        shape: Shape,
    },
    ArrayInsert {
        id: EntityId,
        field: Arc<str>,
        index: u32,
        values: Vec<Any>,
    },
    ArrayRemove {
        id: EntityId,
        field: Arc<str>,
        index: u32,
        len: u32,
    },
    ArrayReplace {
        id: EntityId,
        field: Arc<str>,
        values: Vec<Any>,
    },
    MapSet {
        id: EntityId,
        field: Arc<str>,
        key: String,
        value: Any,
    },
    MapRemove {
        id: EntityId,
        field: Arc<str>,
        key: String,
    },
    MapClear {
        id: EntityId,
        field: Arc<str>,
    },
}

struct TxnState {
    depth: usize,
    dirty: Vec<Arc<DocShared>>,
}

thread_local! {
    static TXN: RefCell<TxnState> = RefCell::new(TxnState {
        depth: 0,
        dirty: Vec::new(),
    });
}

pub(crate) fn in_transaction() -> bool {
    TXN.with(|txn| txn.borrow().depth > 0)
}

fn enter() {
    TXN.with(|txn| txn.borrow_mut().depth += 1);
}

fn exit(commit: bool) {
    let outermost = TXN.with(|txn| txn.borrow().depth == 1);
    if outermost {
        // flush before leaving the transaction so observer-side
        // notifications stay queued until the drain below
        loop {
            let dirty = TXN.with(|txn| std::mem::take(&mut txn.borrow_mut().dirty));
            if dirty.is_empty() {
                break;
            }
            for doc in dirty {
                flush(&doc);
            }
        }
    }
    TXN.with(|txn| txn.borrow_mut().depth -= 1);
    if outermost {
        if commit {
            tracking::drain();
        } else {
            tracking::clear_queue();
        }
    }
}

/// Runs `f` inside the engine transaction, joining the enclosing one if
/// present. The outermost call flushes staged ops in one substrate
/// transaction and drains notifications on success; on error the queue of
/// notifications is discarded and the error propagates.
pub(crate) fn with<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    struct Guard {
        commit: bool,
    }
    impl Drop for Guard {
        fn drop(&mut self) {
            exit(self.commit);
        }
    }
    enter();
    let mut guard = Guard { commit: false };
    let result = f();
    guard.commit = result.is_ok();
    drop(guard);
    result
}

/// Stages a CRDT op for `doc` and marks it dirty in the current
/// transaction scope.
pub(crate) fn enqueue(doc: &Arc<DocShared>, op: PendingOp) {
    doc.pending.lock().push(op);
    TXN.with(|txn| {
        let mut txn = txn.borrow_mut();
        if !txn.dirty.iter().any(|dirty| Arc::ptr_eq(dirty, doc)) {
            txn.dirty.push(doc.clone());
        }
    });
}

fn entity_map<T: ReadTxn>(models: &MapRef, txn: &T, id: &EntityId) -> Option<MapRef> {
    match models.get(txn, id.as_str()) {
        Some(Out::YMap(map)) => Some(map),
        _ => {
            tracing::error!(id = %id, "staged op against a missing entity subtree");
            None
        }
    }
}

fn field_array<T: ReadTxn>(map: &MapRef, txn: &T, id: &EntityId, field: &str) -> Option<ArrayRef> {
    match map.get(txn, field) {
        Some(Out::YArray(array)) => Some(array),
        _ => {
            tracing::error!(id = %id, field, "staged array op against a non-array field");
            None
        }
    }
}

fn field_map<T: ReadTxn>(map: &MapRef, txn: &T, id: &EntityId, field: &str) -> Option<MapRef> {
    match map.get(txn, field) {
        Some(Out::YMap(map)) => Some(map),
        _ => {
            tracing::error!(id = %id, field, "staged map op against a non-map field");
            None
        }
    }
}

fn apply(txn: &mut TransactionMut, models: &MapRef, op: PendingOp) {
    match op {
        PendingOp::CreateModel {
            id,
            type_name,
            parent,
        } => {
            let map = models.insert(txn, id.as_str(), MapPrelim::default());
            map.insert(txn, crate::doc::TYPE_KEY, Any::String(type_name));
            if let Some(parent) = parent {
                map.insert(txn, crate::doc::PARENT_KEY, parent.to_any());
            }
        }
        PendingOp::SetField { id, field, value } => {
            if let Some(map) = entity_map(models, txn, &id) {
                map.insert(txn, field, value);
            }
        }
        PendingOp::SetParent { id, parent } => {
            if let Some(map) = entity_map(models, txn, &id) {
                match parent {
                    Some(parent) => {
                        map.insert(txn, crate::doc::PARENT_KEY, parent.to_any());
                    }
                    None => {
                        map.remove(txn, crate::doc::PARENT_KEY);
                    }
                }
            }
        }
        PendingOp::EnsureContainer { id, field, shape } => {
            if let Some(map) = entity_map(models, txn, &id) {
                match (shape, map.get(txn, &field)) {
                    (Shape::Array, Some(Out::YArray(_))) | (Shape::Map, Some(Out::YMap(_))) => {}
                    (Shape::Array, _) => {
                        map.insert(txn, field, ArrayPrelim::default());
                    }
                    (Shape::Map, _) => {
                        map.insert(txn, field, MapPrelim::default());
                    }
                    (Shape::Value, _) => {}
                }
            }
        }
        PendingOp::ArrayInsert {
            id,
            field,
            index,
            values,
        } => {
            if let Some(map) = entity_map(models, txn, &id) {
                if let Some(array) = field_array(&map, txn, &id, &field) {
                    array.insert_range(txn, index, values);
                }
            }
        }
        PendingOp::ArrayRemove {
            id,
            field,
            index,
            len,
        } => {
            if let Some(map) = entity_map(models, txn, &id) {
                if let Some(array) = field_array(&map, txn, &id, &field) {
                    array.remove_range(txn, index, len);
                }
            }
        }
        PendingOp::ArrayReplace { id, field, values } => {
            if let Some(map) = entity_map(models, txn, &id) {
                if let Some(array) = field_array(&map, txn, &id, &field) {
                    let len = array.len(txn);
                    if len > 0 {
                        array.remove_range(txn, 0, len);
                    }
                    if !values.is_empty() {
                        array.insert_range(txn, 0, values);
                    }
                }
            }
        }
        PendingOp::MapSet {
            id,
            field,
            key,
            value,
        } => {
            if let Some(map) = entity_map(models, txn, &id) {
                if let Some(record) = field_map(&map, txn, &id, &field) {
                    record.insert(txn, key, value);
                }
            }
        }
        PendingOp::MapRemove { id, field, key } => {
            if let Some(map) = entity_map(models, txn, &id) {
                if let Some(record) = field_map(&map, txn, &id, &field) {
                    record.remove(txn, &key);
                }
            }
        }
        PendingOp::MapClear { id, field } => {
            if let Some(map) = entity_map(models, txn, &id) {
                if let Some(record) = field_map(&map, txn, &id, &field) {
                    let keys: Vec<String> =
                        record.iter(txn).map(|(key, _)| key.to_string()).collect();
                    for key in keys {
                        record.remove(txn, &key);
                    }
                }
            }
        }
    }
}

fn flush(doc: &Arc<DocShared>) {
    let ops = std::mem::take(&mut *doc.pending.lock());
    if ops.is_empty() {
        return;
    }
    let mut txn = doc.doc.transact_mut_with(crate::doc::LOCAL_ORIGIN);
    let Some(models) = txn.get_map(crate::doc::MODELS) else {
        tracing::error!("document has no models map");
        return;
    };
    for op in ops {
        apply(&mut txn, &models, op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{report_access, report_modify, tracked_read, Key, Target};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn notifications_defer_to_the_outermost_commit() {
        let target = Target::entity(EntityId::generate());
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let t = target.clone();
        let (_, _reader) = tracked_read(
            move || seen.set(seen.get() + 1),
            || report_access(&t, &Key::All),
        );

        let observed_inside = Cell::new(0);
        with(|| {
            with(|| {
                report_modify(&target, &Key::All);
                Ok(())
            })?;
            observed_inside.set(count.get());
            Ok::<_, crate::Error>(())
        })
        .unwrap();

        assert_eq!(observed_inside.get(), 0);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn aborted_transactions_swallow_notifications() {
        let target = Target::entity(EntityId::generate());
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let t = target.clone();
        let (_, _reader) = tracked_read(
            move || seen.set(seen.get() + 1),
            || report_access(&t, &Key::All),
        );

        let result: crate::Result<()> = with(|| {
            report_modify(&target, &Key::All);
            Err(crate::Error::RootParent)
        });
        assert!(result.is_err());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn parent_entry_round_trip() {
        let entry = ParentEntry {
            id: EntityId::from("abc"),
            field: "components".into(),
            sub_key: Some("header".into()),
        };
        assert_eq!(ParentEntry::from_any(&entry.to_any()).unwrap(), entry);

        let no_key = ParentEntry {
            id: EntityId::from("abc"),
            field: "children".into(),
            sub_key: None,
        };
        assert_eq!(ParentEntry::from_any(&no_key.to_any()).unwrap(), no_key);
        assert!(ParentEntry::from_any(&Any::Array(vec![].into())).is_none());
    }
}
