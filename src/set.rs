use crate::entity::Entity;
use crate::error::Result;
use crate::reference;
use crate::tracking::{self, Key, Target};
use crate::txn::{self, PendingOp};
use crate::value::Value;
use std::sync::Arc;

/// An unordered view over a set field. Backed by the document array, with
/// uniqueness enforced here by membership test on insert.
#[derive(Clone)]
pub struct Set {
    owner: Entity,
    field: Arc<str>,
    child: bool,
}

impl Set {
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

    fn mirror(&self) -> Vec<Value> {
        self.owner.slot_values(&self.field)
    }

    // ------------------------------------------------------------------
    // reads

    pub fn len(&self) -> usize {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::Indices);
        self.mirror().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::Indices);
        self.mirror().iter().any(|member| member == value)
    }

    /// A snapshot of the members; reports a whole-container access.
    pub fn to_vec(&self) -> Vec<Value> {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::All);
        self.mirror()
    }

    pub fn iter(&self) -> std::vec::IntoIter<Value> {
        self.to_vec().into_iter()
    }

    pub fn is_subset_of(&self, other: impl IntoIterator<Item = Value>) -> bool {
        let members = self.to_vec();
        let other: Vec<Value> = other.into_iter().collect();
        members
            .iter()
            .all(|member| other.iter().any(|value| value == member))
    }

    pub fn is_superset_of(&self, other: impl IntoIterator<Item = Value>) -> bool {
        let members = self.to_vec();
        other
            .into_iter()
            .all(|value| members.iter().any(|member| member == &value))
    }

    pub fn is_disjoint_from(&self, other: impl IntoIterator<Item = Value>) -> bool {
        let members = self.to_vec();
        other
            .into_iter()
            .all(|value| !members.iter().any(|member| member == &value))
    }

    // ------------------------------------------------------------------
    // writes

    /// Adds a member; a present member is a no-op.
    pub fn add(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        value.check()?;
        txn::with(|| {
            let mirror = self.mirror();
            if mirror.iter().any(|member| member == &value) {
                return Ok(false);
            }
            if self.child {
                if let Value::Entity(entity) = &value {
                    entity.request_adoption(&self.owner, &self.field, None)?;
                }
            }
            if let Some(doc) = self.owner.binding() {
                let encoded = reference::encode_value(&doc, &value)?;
                txn::enqueue(
                    &doc,
                    PendingOp::ArrayInsert {
                        id: self.owner.id(),
                        field: self.field.clone(),
                        index: mirror.len() as u32,
                        values: vec![encoded],
                    },
                );
            }
            let mut next = mirror;
            next.push(value);
            self.owner.install_values(&self.field, next, true);
            tracking::report_modify(&self.proxy(), &Key::Indices);
            Ok(true)
        })
    }

    /// Removes a member; returns whether it was present.
    pub fn remove(&self, value: &Value) -> Result<bool> {
        txn::with(|| {
            let mirror = self.mirror();
            let Some(position) = mirror.iter().position(|member| member == value) else {
                return Ok(false);
            };
            if self.child {
                if let Value::Entity(entity) = value {
                    entity.inform_orphanization()?;
                }
            }
            self.remove_at(position, mirror)?;
            Ok(true)
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.assign(Vec::new())
    }

    /// Replaces the membership, diffing against the current one: one
    /// adoption per arriving member, one orphanization per leaving one.
    pub fn assign(&self, values: Vec<Value>) -> Result<()> {
        let mut next: Vec<Value> = Vec::with_capacity(values.len());
        for value in values {
            value.check()?;
            if !next.iter().any(|member| member == &value) {
                next.push(value);
            }
        }
        txn::with(|| {
            let mirror = self.mirror();
            if mirror == next {
                return Ok(());
            }
            if self.child {
                for member in &mirror {
                    if let Value::Entity(entity) = member {
                        if !next.iter().any(|value| value == member) {
                            entity.inform_orphanization()?;
                        }
                    }
                }
                for value in &next {
                    if let Value::Entity(entity) = value {
                        if !mirror.iter().any(|member| member == value) {
                            entity.request_adoption(&self.owner, &self.field, None)?;
                        }
                    }
                }
            }
            if let Some(doc) = self.owner.binding() {
                let mut encoded = Vec::with_capacity(next.len());
                for value in &next {
                    encoded.push(reference::encode_value(&doc, value)?);
                }
                txn::enqueue(
                    &doc,
                    PendingOp::ArrayReplace {
                        id: self.owner.id(),
                        field: self.field.clone(),
                        values: encoded,
                    },
                );
            }
            self.owner.install_values(&self.field, next, true);
            tracking::report_modify(&self.proxy(), &Key::Indices);
            tracking::report_modify(&self.proxy(), &Key::All);
            Ok(())
        })
    }

    /// Removes `entity` without running the parent protocol; used by
    /// emancipation.
    pub(crate) fn remove_raw(&self, entity: &Entity) -> Result<()> {
        let mirror = self.mirror();
        let Some(position) = mirror
            .iter()
            .position(|member| matches!(member, Value::Entity(e) if e.same(entity)))
        else {
            return Ok(());
        };
        self.remove_at(position, mirror)
    }

    fn remove_at(&self, position: usize, mirror: Vec<Value>) -> Result<()> {
        if let Some(doc) = self.owner.binding() {
            txn::enqueue(
                &doc,
                PendingOp::ArrayRemove {
                    id: self.owner.id(),
                    field: self.field.clone(),
                    index: position as u32,
                    len: 1,
                },
            );
        }
        let mut next = mirror;
        next.remove(position);
        self.owner.install_values(&self.field, next, true);
        tracking::report_modify(&self.proxy(), &Key::Indices);
        Ok(())
    }
}
