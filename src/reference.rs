use crate::doc::DocShared;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::id::EntityId;
use crate::value::Value;
use std::sync::Arc;
use yrs::{Any, Map, Out, ReadTxn, Transact};

/// Encodes a value for storage in `doc`: primitives pass through, entity
/// references become compact tuples. An ephemeral entity materializes
/// into `doc` as a side effect.
pub(crate) fn encode_value(doc: &Arc<DocShared>, value: &Value) -> Result<Any> {
    match value {
        Value::Entity(entity) => encode_entity(doc, entity),
        primitive => Ok(primitive.to_any().expect("primitive")),
    }
}

/// `[id]` for a local or freshly materialized entity, `[id, depId]` for
/// an entity living in a registered dependency document.
pub(crate) fn encode_entity(doc: &Arc<DocShared>, entity: &Entity) -> Result<Any> {
    let local = |entity: &Entity| {
        Any::Array(vec![Any::String(entity.id().as_str().into())].into())
    };
    match entity.binding() {
        None => {
            entity.materialize_into(doc)?;
            Ok(local(entity))
        }
        Some(bound) if Arc::ptr_eq(&bound, doc) => Ok(local(entity)),
        Some(bound) => {
            let dep_id = bound
                .document_id()
                .ok_or_else(|| Error::CrossDocReference(entity.id()))?;
            let registered = doc
                .dependency(&dep_id)
                .ok_or_else(|| Error::CrossDocReference(entity.id()))?;
            if !Arc::ptr_eq(&registered, &bound) {
                return Err(Error::CrossDocReference(entity.id()));
            }
            Ok(Any::Array(
                vec![
                    Any::String(entity.id().as_str().into()),
                    Any::String(dep_id.as_str().into()),
                ]
                .into(),
            ))
        }
    }
}

/// Decodes a stored map value: primitives pass through, reference tuples
/// resolve to live entities, anything else is rejected.
pub(crate) fn decode_stored<T: ReadTxn>(doc: &Arc<DocShared>, txn: &T, out: &Out) -> Result<Value> {
    match out {
        Out::Any(any) => decode_any(doc, txn, any),
        _ => Err(Error::schema("nested container in value position")),
    }
}

pub(crate) fn decode_any<T: ReadTxn>(doc: &Arc<DocShared>, txn: &T, any: &Any) -> Result<Value> {
    match any {
        Any::Array(parts) => {
            let mut ids = Vec::with_capacity(parts.len());
            for part in parts.iter() {
                match part {
                    Any::String(s) => ids.push(s.clone()),
                    _ => return Err(Error::schema("malformed reference tuple")),
                }
            }
            match ids.as_slice() {
                [id] => Ok(Value::Entity(resolve_local(
                    doc,
                    txn,
                    &EntityId::from(id.as_ref()),
                )?)),
                [id, dep_id] => {
                    let dep = doc
                        .dependency(dep_id)
                        .ok_or_else(|| Error::MissingDependency(dep_id.to_string()))?;
                    let dep_txn = dep.doc.transact();
                    Ok(Value::Entity(resolve_local(
                        &dep,
                        &dep_txn,
                        &EntityId::from(id.as_ref()),
                    )?))
                }
                _ => Err(Error::schema("reference tuples carry one or two ids")),
            }
        }
        Any::Map(_) => Err(Error::schema("legacy reference shape rejected")),
        primitive => Value::from_any(primitive),
    }
}

/// The cached live entity for `id`, or a fresh rehydration bound to
/// `(id, doc)`.
pub(crate) fn resolve_local<T: ReadTxn>(
    doc: &Arc<DocShared>,
    txn: &T,
    id: &EntityId,
) -> Result<Entity> {
    if let Some(entity) = doc.cache.live(id) {
        return Ok(entity);
    }
    Entity::rehydrate(doc, txn, id)
}

/// Resolves `id` against `doc`, opening a read transaction of its own.
/// Returns `None` for an id with no stored entity.
pub(crate) fn load(doc: &Arc<DocShared>, id: &EntityId) -> Result<Option<Entity>> {
    if let Some(entity) = doc.cache.live(id) {
        return Ok(Some(entity));
    }
    let txn = doc.doc.transact();
    let models = doc.models(&txn);
    if models.get(&txn, id.as_str()).is_none() {
        return Ok(None);
    }
    Entity::rehydrate(doc, &txn, id).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{models, plexus};
    use crate::entity::Init;

    #[test]
    fn legacy_and_malformed_shapes_are_rejected() {
        let engine = plexus();
        let doc = engine.shared();
        let txn = doc.doc.transact();

        let legacy = Any::Map(Arc::new(
            [("__ref".to_string(), Any::String("x".into()))]
                .into_iter()
                .collect(),
        ));
        assert!(decode_any(&doc, &txn, &legacy).is_err());

        let empty = Any::Array(Vec::<Any>::new().into());
        assert!(decode_any(&doc, &txn, &empty).is_err());

        let three = Any::Array(
            vec![
                Any::String("a".into()),
                Any::String("b".into()),
                Any::String("c".into()),
            ]
            .into(),
        );
        assert!(decode_any(&doc, &txn, &three).is_err());

        let not_strings = Any::Array(vec![Any::Number(1.0)].into());
        assert!(decode_any(&doc, &txn, &not_strings).is_err());
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let engine = plexus();
        let doc = engine.shared();
        let entity = models()
            .component
            .create(Init::new().with("name", "x"))
            .unwrap();

        let encoded = engine
            .transact(|| encode_entity(&doc, &entity))
            .unwrap();
        assert!(entity.is_materialized());

        let txn = doc.doc.transact();
        let decoded = decode_any(&doc, &txn, &encoded).unwrap();
        assert!(decoded.as_entity().unwrap().same(&entity));
        drop(txn);

        // re-encoding the decoded entity yields the same tuple
        let again = engine
            .transact(|| encode_entity(&doc, &entity))
            .unwrap();
        assert_eq!(encoded, again);
    }

    #[test]
    fn decode_survives_collection_and_preserves_identity() {
        let engine = plexus();
        let doc = engine.shared();
        let id = {
            let entity = models()
                .component
                .create(Init::new().with("name", "x"))
                .unwrap();
            engine
                .transact(|| encode_entity(&doc, &entity))
                .unwrap();
            entity.id()
        };
        // the live object is gone; decode rehydrates a fresh one, and two
        // decodes agree on identity
        let txn = doc.doc.transact();
        let tuple = Any::Array(vec![Any::String(id.as_str().into())].into());
        let first = decode_any(&doc, &txn, &tuple).unwrap();
        let second = decode_any(&doc, &txn, &tuple).unwrap();
        assert!(first.as_entity().unwrap().same(second.as_entity().unwrap()));
        assert_eq!(first.as_entity().unwrap().id(), id);
    }
}
