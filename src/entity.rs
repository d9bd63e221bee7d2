use crate::doc::DocShared;
use crate::error::{Error, Result};
use crate::id::EntityId;
use crate::list::List;
use crate::record::Record;
use crate::reference;
use crate::registry::ModelType;
use crate::schema::{FieldDescriptor, FieldKind, Shape};
use crate::set::Set;
use crate::tracking::{self, Key, Target};
use crate::txn::{self, ParentEntry, PendingOp};
use crate::value::Value;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// The field name under which parent changes are tracked.
pub const PARENT_FIELD: &str = "parent";

/// Initial field values for entity construction. Absent keys fall back to
/// the schema default.
#[derive(Default)]
pub struct Init {
    entries: BTreeMap<Arc<str>, FieldInit>,
}

impl Init {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<Arc<str>>, value: impl Into<FieldInit>) -> Self {
        self.entries.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn contains(&self, field: &str) -> bool {
        self.entries.contains_key(field)
    }
}

/// An initial value: a single value for `val` kinds, items for lists and
/// sets, entries for records.
pub enum FieldInit {
    Value(Value),
    Items(Vec<Value>),
    Entries(BTreeMap<String, Value>),
}

macro_rules! field_init_from_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for FieldInit {
            fn from(value: $ty) -> Self {
                Self::Value(value.into())
            }
        })*
    };
}

field_init_from_value!(Value, bool, f64, i64, &str, String, Entity, &Entity);

impl From<Vec<Value>> for FieldInit {
    fn from(items: Vec<Value>) -> Self {
        Self::Items(items)
    }
}

impl From<BTreeMap<String, Value>> for FieldInit {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Entries(entries)
    }
}

/// One field's in-memory backing.
#[derive(Clone, Debug)]
pub(crate) enum FieldSlot {
    Value(Value),
    List(Vec<Value>),
    Set(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

/// Runtime parent pointer: a weak object pointer plus the durable triple.
pub(crate) struct ParentLink {
    weak: Weak<EntityInner>,
    pub(crate) entry: ParentEntry,
}

pub(crate) struct EntityState {
    pub(crate) fields: FnvHashMap<Arc<str>, FieldSlot>,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) binding: Option<Arc<DocShared>>,
    emancipating: bool,
}

pub struct EntityInner {
    id: Mutex<EntityId>,
    model: Arc<ModelType>,
    pub(crate) state: Mutex<EntityState>,
}

/// A live domain object. Cloning the handle clones a reference to the
/// same entity; identity is object identity.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}({})", self.type_name(), self.id())
    }
}

impl Entity {
    fn new_inner(model: Arc<ModelType>, id: EntityId) -> Entity {
        Entity {
            inner: Arc::new(EntityInner {
                id: Mutex::new(id),
                model,
                state: Mutex::new(EntityState {
                    fields: FnvHashMap::default(),
                    parent: None,
                    binding: None,
                    emancipating: false,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<EntityInner> {
        &self.inner
    }

    pub fn id(&self) -> EntityId {
        self.inner.id.lock().clone()
    }

    pub(crate) fn force_id(&self, id: EntityId) {
        *self.inner.id.lock() = id;
    }

    pub fn model(&self) -> &Arc<ModelType> {
        &self.inner.model
    }

    pub fn type_name(&self) -> &str {
        self.inner.model.name()
    }

    /// Object identity.
    pub fn same(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_materialized(&self) -> bool {
        self.inner.state.lock().binding.is_some()
    }

    pub(crate) fn binding(&self) -> Option<Arc<DocShared>> {
        self.inner.state.lock().binding.clone()
    }

    fn descriptor(&self, field: &str) -> Result<(Arc<str>, FieldDescriptor)> {
        self.inner
            .model
            .schema()
            .iter()
            .find(|(name, _)| &***name == field)
            .map(|(name, descriptor)| (name.clone(), descriptor.clone()))
            .ok_or_else(|| {
                Error::schema(format!(
                    "{} has no field {field:?}",
                    self.inner.model.name()
                ))
            })
    }

    // ------------------------------------------------------------------
    // construction

    /// Creates an ephemeral entity, applying schema defaults for absent
    /// init keys. `val` fields with neither default nor init value are
    /// required.
    pub(crate) fn create(model: Arc<ModelType>, init: Init) -> Result<Entity> {
        for (field, _) in &init.entries {
            if !model.schema().contains(field) {
                return Err(Error::schema(format!(
                    "{} has no field {field:?}",
                    model.name()
                )));
            }
        }
        for (field, descriptor) in model.schema().iter() {
            if descriptor.kind.is_val()
                && descriptor.default.is_none()
                && !init.contains(field)
            {
                return Err(Error::schema(format!(
                    "{} requires an initial value for {field:?}",
                    model.name()
                )));
            }
        }
        tracking::suppress_tracking(|| {
            let entity = Self::blank(model);
            entity.apply_init(init)?;
            Ok(entity)
        })
    }

    /// An entity with every field at its default, required or not.
    pub(crate) fn blank(model: Arc<ModelType>) -> Entity {
        let entity = Self::new_inner(model, EntityId::generate());
        {
            let mut state = entity.inner.state.lock();
            for (name, descriptor) in entity.inner.model.schema().iter() {
                let slot = match descriptor.kind {
                    FieldKind::Val | FieldKind::ChildVal => {
                        FieldSlot::Value(descriptor.default.clone().unwrap_or(Value::Null))
                    }
                    FieldKind::List | FieldKind::ChildList => FieldSlot::List(Vec::new()),
                    FieldKind::Set | FieldKind::ChildSet => FieldSlot::Set(Vec::new()),
                    FieldKind::Record | FieldKind::ChildRecord => {
                        FieldSlot::Record(BTreeMap::new())
                    }
                };
                state.fields.insert(name.clone(), slot);
            }
        }
        entity
    }

    /// Applies initial values through the normal setters.
    pub(crate) fn apply_init(&self, init: Init) -> Result<()> {
        for (field, value) in init.entries {
            let (_, descriptor) = self.descriptor(&field)?;
            match (descriptor.kind.shape(), value) {
                (Shape::Value, FieldInit::Value(value)) => self.assign(&field, value)?,
                (Shape::Array, FieldInit::Items(items)) if descriptor.kind.is_list() => {
                    self.list(&field)?.assign(items)?
                }
                (Shape::Array, FieldInit::Items(items)) => self.set(&field)?.assign(items)?,
                (Shape::Map, FieldInit::Entries(entries)) => {
                    self.record(&field)?.assign(entries)?
                }
                _ => {
                    return Err(Error::schema(format!(
                        "initial value for {field:?} does not match its kind"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Reconstructs an entity from its document subtree. The cache entry
    /// is registered before field seeding so cyclic references resolve.
    pub(crate) fn rehydrate<T: yrs::ReadTxn>(
        doc: &Arc<DocShared>,
        txn: &T,
        id: &EntityId,
    ) -> Result<Entity> {
        use yrs::{Map, Out};

        let models = doc.models(txn);
        let Some(Out::YMap(map)) = models.get(txn, id.as_str()) else {
            return Err(Error::schema(format!("no entity stored under id {id}")));
        };
        let type_name = match map.get(txn, crate::doc::TYPE_KEY) {
            Some(Out::Any(yrs::Any::String(name))) => name.to_string(),
            _ => return Err(Error::schema(format!("entity {id} has no type tag"))),
        };
        let model = crate::registry::Registry::global()
            .lookup(&type_name)
            .ok_or(Error::UnknownType(type_name))?;

        let entity = Self::new_inner(model, id.clone());
        {
            let mut state = entity.inner.state.lock();
            state.binding = Some(doc.clone());
        }
        doc.cache.insert(id.clone(), entity.inner());

        let parent = map
            .get(txn, crate::doc::PARENT_KEY)
            .and_then(|out| match out {
                Out::Any(any) => ParentEntry::from_any(&any),
                _ => None,
            });

        let mut fields: FnvHashMap<Arc<str>, FieldSlot> = FnvHashMap::default();
        for (name, descriptor) in entity.inner.model.schema().iter() {
            let stored = map.get(txn, name);
            let slot = match descriptor.kind.shape() {
                Shape::Value => match stored {
                    None => FieldSlot::Value(Value::Null),
                    Some(out) => FieldSlot::Value(reference::decode_stored(doc, txn, &out)?),
                },
                Shape::Array => {
                    let mut values = Vec::new();
                    match stored {
                        None => {}
                        Some(Out::YArray(array)) => {
                            use yrs::Array;
                            for item in array.iter(txn) {
                                values.push(reference::decode_stored(doc, txn, &item)?);
                            }
                        }
                        Some(_) => {
                            return Err(shape_mismatch(id, name, descriptor.kind.shape()))
                        }
                    }
                    if descriptor.kind.is_set() {
                        FieldSlot::Set(values)
                    } else {
                        FieldSlot::List(values)
                    }
                }
                Shape::Map => {
                    let mut entries = BTreeMap::new();
                    match stored {
                        None => {}
                        Some(Out::YMap(record)) => {
                            let keys: Vec<String> =
                                record.iter(txn).map(|(key, _)| key.to_string()).collect();
                            for key in keys {
                                if let Some(item) = record.get(txn, &key) {
                                    entries
                                        .insert(key, reference::decode_stored(doc, txn, &item)?);
                                }
                            }
                        }
                        Some(_) => {
                            return Err(shape_mismatch(id, name, descriptor.kind.shape()))
                        }
                    }
                    FieldSlot::Record(entries)
                }
            };
            fields.insert(name.clone(), slot);
        }

        {
            let mut state = entity.inner.state.lock();
            state.fields = fields;
            state.parent = parent.map(|entry| ParentLink {
                weak: Weak::new(),
                entry,
            });
        }
        Ok(entity)
    }

    // ------------------------------------------------------------------
    // materialization

    /// Binds this entity (and recursively everything it references) to
    /// `doc`. Idempotent for an entity already bound to `doc`; an entity
    /// bound elsewhere cannot be rebound.
    pub(crate) fn materialize_into(&self, doc: &Arc<DocShared>) -> Result<()> {
        {
            let state = self.inner.state.lock();
            if let Some(bound) = &state.binding {
                if Arc::ptr_eq(bound, doc) {
                    return Ok(());
                }
                return Err(Error::CrossDocReference(self.id()));
            }
        }
        let id = self.id();
        tracing::debug!(id = %id, model = self.type_name(), "materializing");

        doc.cache.insert(id.clone(), self.inner());
        let (parent, fields) = {
            let mut state = self.inner.state.lock();
            state.binding = Some(doc.clone());
            let parent = state.parent.as_ref().map(|link| link.entry.clone());
            let fields = state.fields.clone();
            (parent, fields)
        };

        // staged locally so a failed materialization leaves no trace
        let mut ops = vec![PendingOp::CreateModel {
            id: id.clone(),
            type_name: Arc::from(self.type_name()),
            parent,
        }];
        let result = (|| -> Result<()> {
            for (name, descriptor) in self.inner.model.schema().iter() {
                match fields.get(name) {
                    Some(FieldSlot::Value(value)) => {
                        ops.push(PendingOp::SetField {
                            id: id.clone(),
                            field: name.clone(),
                            value: reference::encode_value(doc, value)?,
                        });
                    }
                    Some(FieldSlot::List(values)) | Some(FieldSlot::Set(values)) => {
                        ops.push(PendingOp::EnsureContainer {
                            id: id.clone(),
                            field: name.clone(),
                            shape: Shape::Array,
                        });
                        if !values.is_empty() {
                            let mut encoded = Vec::with_capacity(values.len());
                            for value in values {
                                encoded.push(reference::encode_value(doc, value)?);
                            }
                            ops.push(PendingOp::ArrayInsert {
                                id: id.clone(),
                                field: name.clone(),
                                index: 0,
                                values: encoded,
                            });
                        }
                    }
                    Some(FieldSlot::Record(entries)) => {
                        ops.push(PendingOp::EnsureContainer {
                            id: id.clone(),
                            field: name.clone(),
                            shape: Shape::Map,
                        });
                        for (key, value) in entries {
                            ops.push(PendingOp::MapSet {
                                id: id.clone(),
                                field: name.clone(),
                                key: key.clone(),
                                value: reference::encode_value(doc, value)?,
                            });
                        }
                    }
                    None => {
                        return Err(shape_mismatch(&id, name, descriptor.kind.shape()));
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                for op in ops {
                    txn::enqueue(doc, op);
                }
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.state.lock();
                state.binding = None;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // val accessors

    /// Reads a `val` field.
    pub fn get(&self, field: &str) -> Result<Value> {
        let (name, descriptor) = self.descriptor(field)?;
        if !descriptor.kind.is_val() {
            return Err(Error::schema(format!(
                "{field:?} is a container field, use its view"
            )));
        }
        tracking::report_access(&Target::entity(self.id()), &Key::Field(name.clone()));
        let state = self.inner.state.lock();
        match state.fields.get(&name) {
            Some(FieldSlot::Value(value)) => Ok(value.clone()),
            _ => Ok(Value::Null),
        }
    }

    /// Writes a `val` field. Writing an identical value is a no-op; for
    /// `child-val` the old referent is orphaned and the new one adopted.
    pub fn assign(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let (name, descriptor) = self.descriptor(field)?;
        if !descriptor.kind.is_val() {
            return Err(Error::schema(format!(
                "{field:?} is a container field, use its view"
            )));
        }
        value.check()?;
        txn::with(|| {
            let current = {
                let state = self.inner.state.lock();
                match state.fields.get(&name) {
                    Some(FieldSlot::Value(value)) => value.clone(),
                    _ => Value::Null,
                }
            };
            if current == value {
                return Ok(());
            }
            if descriptor.kind.is_child() {
                if let Value::Entity(old) = &current {
                    old.inform_orphanization()?;
                }
                if let Value::Entity(new) = &value {
                    new.request_adoption(self, &name, None)?;
                }
            }
            if let Some(doc) = self.binding() {
                let encoded = reference::encode_value(&doc, &value)?;
                txn::enqueue(
                    &doc,
                    PendingOp::SetField {
                        id: self.id(),
                        field: name.clone(),
                        value: encoded,
                    },
                );
            }
            self.inner
                .state
                .lock()
                .fields
                .insert(name.clone(), FieldSlot::Value(value));
            tracking::report_modify(&Target::entity(self.id()), &Key::Field(name.clone()));
            Ok(())
        })
    }

    /// Clears a `child-val` slot during emancipation, without running the
    /// protocol on the departing child.
    pub(crate) fn clear_child_val(&self, field: &Arc<str>, child: &Entity) -> Result<()> {
        let holds_child = {
            let state = self.inner.state.lock();
            matches!(
                state.fields.get(field),
                Some(FieldSlot::Value(Value::Entity(current))) if current.same(child)
            )
        };
        if !holds_child {
            return Ok(());
        }
        if let Some(doc) = self.binding() {
            txn::enqueue(
                &doc,
                PendingOp::SetField {
                    id: self.id(),
                    field: field.clone(),
                    value: yrs::Any::Null,
                },
            );
        }
        self.inner
            .state
            .lock()
            .fields
            .insert(field.clone(), FieldSlot::Value(Value::Null));
        tracking::report_modify(&Target::entity(self.id()), &Key::Field(field.clone()));
        Ok(())
    }

    // ------------------------------------------------------------------
    // container views

    pub fn list(&self, field: &str) -> Result<List> {
        let (name, descriptor) = self.descriptor(field)?;
        if !descriptor.kind.is_list() {
            return Err(Error::schema(format!("{field:?} is not a list field")));
        }
        Ok(List::new(self.clone(), name, descriptor.kind.is_child()))
    }

    pub fn set(&self, field: &str) -> Result<Set> {
        let (name, descriptor) = self.descriptor(field)?;
        if !descriptor.kind.is_set() {
            return Err(Error::schema(format!("{field:?} is not a set field")));
        }
        Ok(Set::new(self.clone(), name, descriptor.kind.is_child()))
    }

    pub fn record(&self, field: &str) -> Result<Record> {
        let (name, descriptor) = self.descriptor(field)?;
        if !descriptor.kind.is_record() {
            return Err(Error::schema(format!("{field:?} is not a record field")));
        }
        Ok(Record::new(self.clone(), name, descriptor.kind.is_child()))
    }

    // ------------------------------------------------------------------
    // parent protocol

    /// The current parent, if any.
    pub fn parent(&self) -> Option<Entity> {
        self.parent_info().map(|(parent, _, _)| parent)
    }

    /// The current parent together with the referring field and sub-key.
    pub fn parent_info(&self) -> Option<(Entity, Arc<str>, Option<String>)> {
        tracking::report_access(
            &Target::entity(self.id()),
            &Key::Field(PARENT_FIELD.into()),
        );
        let (weak, entry, binding) = {
            let state = self.inner.state.lock();
            let link = state.parent.as_ref()?;
            (link.weak.clone(), link.entry.clone(), state.binding.clone())
        };
        let parent = weak.upgrade().map(Entity::from_inner).or_else(|| {
            let doc = binding?;
            reference::load(&doc, &entry.id).ok().flatten()
        })?;
        Some((parent, entry.field, entry.sub_key))
    }

    /// Sets the runtime parent without touching the previous one. An
    /// ephemeral entity adopted by a materialized parent materializes into
    /// the parent's document.
    pub(crate) fn inform_adoption(
        &self,
        parent: &Entity,
        field: &Arc<str>,
        sub_key: Option<String>,
    ) -> Result<()> {
        if self.id().is_root() {
            return Err(Error::RootParent);
        }
        let entry = ParentEntry {
            id: parent.id(),
            field: field.clone(),
            sub_key,
        };
        let was_bound = {
            let mut state = self.inner.state.lock();
            state.parent = Some(ParentLink {
                weak: Arc::downgrade(parent.inner()),
                entry: entry.clone(),
            });
            state.binding.is_some()
        };
        if let Some(doc) = parent.binding() {
            self.materialize_into(&doc)?;
        }
        if was_bound {
            if let Some(doc) = self.binding() {
                txn::enqueue(
                    &doc,
                    PendingOp::SetParent {
                        id: self.id(),
                        parent: Some(entry),
                    },
                );
            }
        }
        tracking::report_modify(
            &Target::entity(self.id()),
            &Key::Field(PARENT_FIELD.into()),
        );
        Ok(())
    }

    /// Leaves the previous parent, then adopts.
    pub(crate) fn request_adoption(
        &self,
        parent: &Entity,
        field: &Arc<str>,
        sub_key: Option<String>,
    ) -> Result<()> {
        if self.id().is_root() {
            return Err(Error::RootParent);
        }
        self.emancipate()?;
        self.inform_adoption(parent, field, sub_key)
    }

    /// Clears the runtime parent and the stored meta-entry.
    pub(crate) fn inform_orphanization(&self) -> Result<()> {
        let had_parent = {
            let mut state = self.inner.state.lock();
            state.parent.take().is_some()
        };
        if !had_parent {
            return Ok(());
        }
        if let Some(doc) = self.binding() {
            txn::enqueue(
                &doc,
                PendingOp::SetParent {
                    id: self.id(),
                    parent: None,
                },
            );
        }
        tracking::report_modify(
            &Target::entity(self.id()),
            &Key::Field(PARENT_FIELD.into()),
        );
        Ok(())
    }

    /// Leaves the previous parent, then clears the pointer.
    pub(crate) fn request_orphanization(&self) -> Result<()> {
        self.emancipate()?;
        self.inform_orphanization()
    }

    /// Removes this entity from the field of its current parent that
    /// references it. Re-entrant calls short-circuit.
    pub(crate) fn emancipate(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.emancipating {
                return Ok(());
            }
            state.emancipating = true;
        }
        let result = self.emancipate_inner();
        self.inner.state.lock().emancipating = false;
        result
    }

    fn emancipate_inner(&self) -> Result<()> {
        let Some((parent, field, sub_key)) = ({
            let state = self.inner.state.lock();
            state.parent.as_ref().map(|link| {
                (
                    link.weak.clone(),
                    link.entry.field.clone(),
                    link.entry.sub_key.clone(),
                )
            })
        })
        .and_then(|(weak, field, sub_key)| {
            weak.upgrade()
                .map(Entity::from_inner)
                .or_else(|| {
                    let entry_id = self.inner.state.lock().parent.as_ref()?.entry.id.clone();
                    let doc = self.binding()?;
                    reference::load(&doc, &entry_id).ok().flatten()
                })
                .map(|parent| (parent, field, sub_key))
        }) else {
            return Ok(());
        };

        let Some(descriptor) = parent.model().schema().get(&field).cloned() else {
            return Ok(());
        };
        match descriptor.kind {
            FieldKind::ChildVal => parent.clear_child_val(&field, self),
            FieldKind::ChildList => parent.list(&field)?.remove_occurrence_raw(self),
            FieldKind::ChildSet => parent.set(&field)?.remove_raw(self),
            FieldKind::ChildRecord => {
                if let Some(key) = sub_key {
                    parent.record(&field)?.remove_raw(&key, self)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // cloning

    /// Clones this entity and its owned subtree. Aliases between child and
    /// reference positions resolve to the same cloned object, with the
    /// child position winning ownership.
    pub fn duplicate(&self) -> Result<Entity> {
        self.duplicate_with(Init::default())
    }

    /// Clones with overrides; overrides win over both source values and
    /// defaults.
    pub fn duplicate_with(&self, overrides: Init) -> Result<Entity> {
        tracking::suppress_tracking(|| {
            let mut session = CloneSession::default();
            let clone = self.clone_into(&mut session)?;
            for deferred in session.deferred {
                deferred.apply(&session.map)?;
            }
            clone.apply_init(overrides)?;
            Ok(clone)
        })
    }

    fn clone_into(&self, session: &mut CloneSession) -> Result<Entity> {
        if let Some(clone) = session.map.get(&self.id()) {
            return Ok(clone.clone());
        }
        let clone = Entity::blank(self.inner.model.clone());
        session.map.insert(self.id(), clone.clone());

        for (name, descriptor) in self.inner.model.schema().iter() {
            match descriptor.kind.shape() {
                Shape::Value => {
                    let value = self.get(name)?;
                    if descriptor.kind.is_child() {
                        let value = match value {
                            Value::Entity(child) => {
                                Value::Entity(child.clone_into(session)?)
                            }
                            other => other,
                        };
                        clone.assign(name, value)?;
                    } else {
                        session.deferred.push(Deferred::Value {
                            clone: clone.clone(),
                            field: name.to_string(),
                            value,
                        });
                    }
                }
                Shape::Array => {
                    let items = if descriptor.kind.is_list() {
                        self.list(name)?.to_vec()
                    } else {
                        self.set(name)?.to_vec()
                    };
                    if descriptor.kind.is_child() {
                        let mut cloned = Vec::with_capacity(items.len());
                        for item in items {
                            cloned.push(match item {
                                Value::Entity(child) => {
                                    Value::Entity(child.clone_into(session)?)
                                }
                                other => other,
                            });
                        }
                        if descriptor.kind.is_list() {
                            clone.list(name)?.assign(cloned)?;
                        } else {
                            clone.set(name)?.assign(cloned)?;
                        }
                    } else {
                        session.deferred.push(Deferred::Items {
                            clone: clone.clone(),
                            field: name.to_string(),
                            is_list: descriptor.kind.is_list(),
                            items,
                        });
                    }
                }
                Shape::Map => {
                    let entries = self.record(name)?.to_map();
                    if descriptor.kind.is_child() {
                        let mut cloned = BTreeMap::new();
                        for (key, item) in entries {
                            cloned.insert(
                                key,
                                match item {
                                    Value::Entity(child) => {
                                        Value::Entity(child.clone_into(session)?)
                                    }
                                    other => other,
                                },
                            );
                        }
                        clone.record(name)?.assign(cloned)?;
                    } else {
                        session.deferred.push(Deferred::Entries {
                            clone: clone.clone(),
                            field: name.to_string(),
                            entries,
                        });
                    }
                }
            }
        }
        Ok(clone)
    }
}

fn shape_mismatch(id: &EntityId, field: &Arc<str>, expected: Shape) -> Error {
    Error::ShapeMismatch {
        id: id.clone(),
        field: field.to_string(),
        expected: expected.name(),
        found: "different shape",
    }
}

#[derive(Default)]
struct CloneSession {
    map: FnvHashMap<EntityId, Entity>,
    deferred: Vec<Deferred>,
}

/// Non-child assignments are substituted through the clone map once the
/// whole subtree has been cloned, so aliases into the subtree land on the
/// cloned peers.
enum Deferred {
    Value {
        clone: Entity,
        field: String,
        value: Value,
    },
    Items {
        clone: Entity,
        field: String,
        is_list: bool,
        items: Vec<Value>,
    },
    Entries {
        clone: Entity,
        field: String,
        entries: BTreeMap<String, Value>,
    },
}

fn substitute(map: &FnvHashMap<EntityId, Entity>, value: Value) -> Value {
    match value {
        Value::Entity(entity) => match map.get(&entity.id()) {
            Some(clone) => Value::Entity(clone.clone()),
            None => Value::Entity(entity),
        },
        other => other,
    }
}

impl Deferred {
    fn apply(self, map: &FnvHashMap<EntityId, Entity>) -> Result<()> {
        match self {
            Deferred::Value {
                clone,
                field,
                value,
            } => clone.assign(&field, substitute(map, value)),
            Deferred::Items {
                clone,
                field,
                is_list,
                items,
            } => {
                let items: Vec<Value> =
                    items.into_iter().map(|item| substitute(map, item)).collect();
                if is_list {
                    clone.list(&field)?.assign(items)
                } else {
                    clone.set(&field)?.assign(items)
                }
            }
            Deferred::Entries {
                clone,
                field,
                entries,
            } => {
                let entries: BTreeMap<String, Value> = entries
                    .into_iter()
                    .map(|(key, item)| (key, substitute(map, item)))
                    .collect();
                clone.record(&field)?.assign(entries)
            }
        }
    }
}

// ----------------------------------------------------------------------
// internal state access for the views and the observer

impl Entity {
    pub(crate) fn slot_values(&self, field: &Arc<str>) -> Vec<Value> {
        let state = self.inner.state.lock();
        match state.fields.get(field) {
            Some(FieldSlot::List(values)) | Some(FieldSlot::Set(values)) => values.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn install_values(&self, field: &Arc<str>, values: Vec<Value>, set: bool) {
        let slot = if set {
            FieldSlot::Set(values)
        } else {
            FieldSlot::List(values)
        };
        self.inner.state.lock().fields.insert(field.clone(), slot);
    }

    pub(crate) fn slot_entries(&self, field: &Arc<str>) -> BTreeMap<String, Value> {
        let state = self.inner.state.lock();
        match state.fields.get(field) {
            Some(FieldSlot::Record(entries)) => entries.clone(),
            _ => BTreeMap::new(),
        }
    }

    pub(crate) fn install_entries(&self, field: &Arc<str>, entries: BTreeMap<String, Value>) {
        self.inner
            .state
            .lock()
            .fields
            .insert(field.clone(), FieldSlot::Record(entries));
    }

    pub(crate) fn slot_value(&self, field: &Arc<str>) -> Value {
        let state = self.inner.state.lock();
        match state.fields.get(field) {
            Some(FieldSlot::Value(value)) => value.clone(),
            _ => Value::Null,
        }
    }

    pub(crate) fn install_value(&self, field: &Arc<str>, value: Value) {
        self.inner
            .state
            .lock()
            .fields
            .insert(field.clone(), FieldSlot::Value(value));
    }

    pub(crate) fn install_parent_entry(&self, entry: Option<ParentEntry>) {
        let mut state = self.inner.state.lock();
        state.parent = entry.map(|entry| ParentLink {
            weak: Weak::new(),
            entry,
        });
    }

    pub(crate) fn parent_entry(&self) -> Option<ParentEntry> {
        self.inner
            .state
            .lock()
            .parent
            .as_ref()
            .map(|link| link.entry.clone())
    }
}
