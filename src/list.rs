use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::reference;
use crate::tracking::{self, Key, Target};
use crate::txn::{self, PendingOp};
use crate::value::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// An ordered view over a list field. For child lists the view enforces
/// that a child occurs at most once and drives the parent protocol on
/// every membership change.
#[derive(Clone)]
pub struct List {
    owner: Entity,
    field: Arc<str>,
    child: bool,
}

impl List {
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

    pub fn get(&self, index: usize) -> Option<Value> {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::Index(index as u32));
        self.mirror().get(index).cloned()
    }

    /// A snapshot of the whole list; reports a whole-container access.
    pub fn to_vec(&self) -> Vec<Value> {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::All);
        self.mirror()
    }

    pub fn iter(&self) -> std::vec::IntoIter<Value> {
        self.to_vec().into_iter()
    }

    pub fn index_of(&self, value: &Value) -> Option<usize> {
        self.report_field_access();
        tracking::report_access(&self.proxy(), &Key::All);
        self.mirror().iter().position(|item| item == value)
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.index_of(value).is_some()
    }

    // ------------------------------------------------------------------
    // writes

    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let len = self.mirror().len();
        self.splice(len, 0, vec![value.into()]).map(|_| ())
    }

    pub fn push_all(&self, values: Vec<Value>) -> Result<()> {
        let len = self.mirror().len();
        self.splice(len, 0, values).map(|_| ())
    }

    pub fn unshift(&self, values: Vec<Value>) -> Result<()> {
        self.splice(0, 0, values).map(|_| ())
    }

    pub fn pop(&self) -> Result<Option<Value>> {
        let len = self.mirror().len();
        if len == 0 {
            return Ok(None);
        }
        Ok(self.splice(len - 1, 1, Vec::new())?.pop())
    }

    pub fn shift(&self) -> Result<Option<Value>> {
        if self.mirror().is_empty() {
            return Ok(None);
        }
        Ok(self.splice(0, 1, Vec::new())?.pop())
    }

    pub fn insert(&self, index: usize, values: Vec<Value>) -> Result<()> {
        self.splice(index, 0, values).map(|_| ())
    }

    pub fn remove(&self, index: usize) -> Result<Option<Value>> {
        if index >= self.mirror().len() {
            return Ok(None);
        }
        Ok(self.splice(index, 1, Vec::new())?.pop())
    }

    /// Removes `delete_count` elements at `start` and inserts `values`
    /// there; returns the removed elements. `start` and `delete_count`
    /// clamp to the current length.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        values: Vec<Value>,
    ) -> Result<Vec<Value>> {
        for value in &values {
            value.check()?;
        }
        txn::with(|| self.splice_inner(start, delete_count, values))
    }

    fn splice_inner(
        &self,
        start: usize,
        delete_count: usize,
        values: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let mirror = self.mirror();
        let len = mirror.len();
        let start = start.min(len);
        let delete_count = delete_count.min(len - start);
        let deleted_range = start..start + delete_count;

        if self.child {
            check_duplicate_intent(&values)?;
        }

        // occurrences of inserted children elsewhere in the array turn the
        // insertion into a move
        let mut removals: Vec<usize> = deleted_range.clone().collect();
        let mut moved: Vec<Entity> = Vec::new();
        if self.child {
            for value in &values {
                let Value::Entity(entity) = value else { continue };
                for (position, existing) in mirror.iter().enumerate() {
                    if existing == value {
                        moved.push(entity.clone());
                        if !deleted_range.contains(&position) {
                            removals.push(position);
                        }
                        break;
                    }
                }
            }
            removals.sort_unstable();
            removals.dedup();
        }

        let insert_at = start - removals.iter().filter(|&&p| p < start).count();
        let mut kept = Vec::with_capacity(mirror.len() - removals.len());
        for (position, value) in mirror.iter().enumerate() {
            if !removals.contains(&position) {
                kept.push(value.clone());
            }
        }
        let mut next = Vec::with_capacity(kept.len() + values.len());
        next.extend_from_slice(&kept[..insert_at]);
        next.extend(values.iter().cloned());
        next.extend_from_slice(&kept[insert_at..]);

        // parent protocol before the store write so adoption can
        // materialize arriving entities
        if self.child {
            for value in &values {
                if let Value::Entity(entity) = value {
                    if moved.iter().any(|m| m.same(entity)) {
                        entity.inform_adoption(&self.owner, &self.field, None)?;
                    } else {
                        entity.request_adoption(&self.owner, &self.field, None)?;
                    }
                }
            }
            for position in deleted_range.clone() {
                if let Value::Entity(entity) = &mirror[position] {
                    if !next.iter().any(|v| v == &mirror[position]) {
                        entity.inform_orphanization()?;
                    }
                }
            }
        }

        if let Some(doc) = self.owner.binding() {
            for &position in removals.iter().rev() {
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
            if !values.is_empty() {
                let mut encoded = Vec::with_capacity(values.len());
                for value in &values {
                    encoded.push(reference::encode_value(&doc, value)?);
                }
                txn::enqueue(
                    &doc,
                    PendingOp::ArrayInsert {
                        id: self.owner.id(),
                        field: self.field.clone(),
                        index: insert_at as u32,
                        values: encoded,
                    },
                );
            }
        }

        self.owner.install_values(&self.field, next.clone(), false);
        self.report_diff(&mirror, &next);
        Ok(mirror[deleted_range].to_vec())
    }

    /// Indexed assignment. Writing in place replaces the element; writing
    /// at the length appends; writing past the end null-fills the holes.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        value.check()?;
        txn::with(|| {
            let mirror = self.mirror();
            let len = mirror.len();
            if index > len {
                // sparse write
                let mut fill: Vec<Value> = vec![Value::Null; index - len];
                fill.push(value);
                self.splice_inner(len, 0, fill)?;
                return Ok(());
            }
            if index == len {
                self.splice_inner(len, 0, vec![value])?;
                return Ok(());
            }
            if mirror[index] == value {
                return Ok(());
            }
            self.splice_inner(index, 1, vec![value])?;
            Ok(())
        })
    }

    /// Shrinks or null-extends the list to `new_len`. Truncated children
    /// are orphaned.
    pub fn set_len(&self, new_len: usize) -> Result<()> {
        txn::with(|| {
            let len = self.mirror().len();
            match new_len.cmp(&len) {
                Ordering::Equal => Ok(()),
                Ordering::Less => self.splice_inner(new_len, len - new_len, Vec::new()).map(|_| ()),
                Ordering::Greater => self
                    .splice_inner(len, 0, vec![Value::Null; new_len - len])
                    .map(|_| ()),
            }
        })
    }

    pub fn truncate(&self, new_len: usize) -> Result<()> {
        if new_len >= self.mirror().len() {
            return Ok(());
        }
        self.set_len(new_len)
    }

    /// Replaces the whole content.
    pub fn assign(&self, values: Vec<Value>) -> Result<()> {
        let len = self.mirror().len();
        self.splice(0, len, values).map(|_| ())
    }

    pub fn clear(&self) -> Result<()> {
        self.assign(Vec::new())
    }

    pub fn sort_by(&self, cmp: impl FnMut(&Value, &Value) -> Ordering) -> Result<()> {
        let mut next = self.mirror();
        next.sort_by(cmp);
        self.reorder(next)
    }

    pub fn reverse(&self) -> Result<()> {
        let mut next = self.mirror();
        next.reverse();
        self.reorder(next)
    }

    /// Copies `src..src_end` over the range starting at `dest`, like the
    /// array `copyWithin`. Fails on a child list when the copy would
    /// duplicate a child.
    pub fn copy_within(&self, dest: usize, src: usize, src_end: usize) -> Result<()> {
        let mirror = self.mirror();
        let len = mirror.len();
        let dest = dest.min(len);
        let src = src.min(len);
        let src_end = src_end.min(len).max(src);
        let count = (src_end - src).min(len - dest);
        if count == 0 {
            return Ok(());
        }
        let mut next = mirror.clone();
        for offset in 0..count {
            next[dest + offset] = mirror[src + offset].clone();
        }
        self.reorder(next)
    }

    /// Installs a same-or-smaller permutation of the current content,
    /// orphaning children that fell out. Validated before any write.
    fn reorder(&self, next: Vec<Value>) -> Result<()> {
        if self.child {
            check_duplicate_result(&next)?;
        }
        txn::with(|| {
            let mirror = self.mirror();
            if mirror == next {
                return Ok(());
            }
            if self.child {
                for value in &mirror {
                    if let Value::Entity(entity) = value {
                        if !next.iter().any(|v| v == value) {
                            entity.inform_orphanization()?;
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
            let len_changed = next.len() != mirror.len();
            self.owner.install_values(&self.field, next, false);
            tracking::report_modify(&self.proxy(), &Key::All);
            if len_changed {
                tracking::report_modify(&self.proxy(), &Key::Indices);
            }
            Ok(())
        })
    }

    /// Removes the first occurrence of `entity` without running the
    /// parent protocol; used by emancipation.
    pub(crate) fn remove_occurrence_raw(&self, entity: &Entity) -> Result<()> {
        let mirror = self.mirror();
        let Some(position) = mirror
            .iter()
            .position(|value| matches!(value, Value::Entity(e) if e.same(entity)))
        else {
            return Ok(());
        };
        let mut next = mirror.clone();
        next.remove(position);
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
        self.owner.install_values(&self.field, next.clone(), false);
        self.report_diff(&mirror, &next);
        Ok(())
    }

    fn report_diff(&self, old: &[Value], new: &[Value]) {
        report_index_diff(&self.proxy(), old, new);
    }
}

/// Emits one point modification per changed index and a membership
/// modification when the length changed.
pub(crate) fn report_index_diff(proxy: &Target, old: &[Value], new: &[Value]) {
    for index in 0..old.len().max(new.len()) {
        match (old.get(index), new.get(index)) {
            (Some(a), Some(b)) if a == b => {}
            _ => tracking::report_modify(proxy, &Key::Index(index as u32)),
        }
    }
    if old.len() != new.len() {
        tracking::report_modify(proxy, &Key::Indices);
    }
}

fn check_duplicate_intent(values: &[Value]) -> Result<()> {
    for (i, a) in values.iter().enumerate() {
        let Value::Entity(entity) = a else { continue };
        for b in values.iter().skip(i + 1) {
            if a == b {
                return Err(Error::DuplicateChild(entity.id()));
            }
        }
    }
    Ok(())
}

fn check_duplicate_result(values: &[Value]) -> Result<()> {
    check_duplicate_intent(values)
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
    fn push_adopts_and_orders() {
        let parent = node("p");
        let (a, b) = (node("a"), node("b"));
        let children = parent.list("children").unwrap();
        children.push(&a).unwrap();
        children.push(&b).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.get(0).unwrap().as_entity().unwrap().same(&a));
        assert!(a.parent().unwrap().same(&parent));
        assert!(b.parent().unwrap().same(&parent));
    }

    #[test]
    fn duplicate_intent_fails_and_leaves_the_list_unchanged() {
        let parent = node("p");
        let a = node("a");
        let children = parent.list("children").unwrap();
        children.push(&a).unwrap();

        let b = node("b");
        let err = children.splice(0, 0, vec![Value::from(&b), Value::from(&b)]);
        assert!(matches!(err, Err(Error::DuplicateChild(_))));
        assert_eq!(children.len(), 1);
        assert!(b.parent().is_none());
    }

    #[test]
    fn reinserting_an_existing_child_moves_it() {
        let parent = node("p");
        let (a, b, c) = (node("a"), node("b"), node("c"));
        let children = parent.list("children").unwrap();
        children.assign(vec![(&a).into(), (&b).into(), (&c).into()]).unwrap();

        // move a to the end
        children.push(&a).unwrap();
        let order: Vec<_> = children
            .to_vec()
            .into_iter()
            .map(|v| v.as_entity().unwrap().get("name").unwrap())
            .collect();
        assert_eq!(
            order,
            vec![Value::from("b"), Value::from("c"), Value::from("a")]
        );
        assert_eq!(children.len(), 3);
        assert!(a.parent().unwrap().same(&parent));
    }

    #[test]
    fn arrivals_from_another_parent_are_stolen() {
        let (p1, p2) = (node("p1"), node("p2"));
        let child = node("c");
        p1.list("children").unwrap().push(&child).unwrap();
        p2.list("children").unwrap().push(&child).unwrap();

        assert!(p1.list("children").unwrap().is_empty());
        assert_eq!(p2.list("children").unwrap().len(), 1);
        assert!(child.parent().unwrap().same(&p2));
    }

    #[test]
    fn removal_orphans() {
        let parent = node("p");
        let a = node("a");
        let children = parent.list("children").unwrap();
        children.push(&a).unwrap();
        let removed = children.remove(0).unwrap().unwrap();
        assert!(removed.as_entity().unwrap().same(&a));
        assert!(a.parent().is_none());
    }

    #[test]
    fn splice_remove_and_reinsert_keeps_the_parent() {
        let parent = node("p");
        let a = node("a");
        let children = parent.list("children").unwrap();
        children.push(&a).unwrap();
        children.splice(0, 1, vec![(&a).into()]).unwrap();
        assert_eq!(children.len(), 1);
        assert!(a.parent().unwrap().same(&parent));
    }

    #[test]
    fn truncation_orphans_the_tail() {
        let parent = node("p");
        let (a, b, c) = (node("a"), node("b"), node("c"));
        let children = parent.list("children").unwrap();
        children
            .assign(vec![(&a).into(), (&b).into(), (&c).into()])
            .unwrap();
        children.set_len(1).unwrap();
        assert_eq!(children.len(), 1);
        assert!(a.parent().unwrap().same(&parent));
        assert!(b.parent().is_none());
        assert!(c.parent().is_none());
    }

    #[test]
    fn sparse_set_null_fills() {
        let parent = node("p");
        let children = parent.list("items").unwrap();
        children.set(3, 7i64).unwrap();
        assert_eq!(children.len(), 4);
        assert!(children.get(0).unwrap().is_null());
        assert!(children.get(2).unwrap().is_null());
        assert_eq!(children.get(3).unwrap(), Value::from(7i64));
    }

    #[test]
    fn copy_within_duplicating_a_child_fails_whole() {
        let parent = node("p");
        let (a, b) = (node("a"), node("b"));
        let children = parent.list("children").unwrap();
        children.assign(vec![(&a).into(), (&b).into()]).unwrap();
        let err = children.copy_within(1, 0, 1);
        assert!(matches!(err, Err(Error::DuplicateChild(_))));
        assert!(children.get(1).unwrap().as_entity().unwrap().same(&b));
        assert!(b.parent().unwrap().same(&parent));
    }

    #[test]
    fn copy_within_over_primitives() {
        let parent = node("p");
        let items = parent.list("items").unwrap();
        items
            .assign(vec![1i64.into(), 2i64.into(), 3i64.into(), 4i64.into()])
            .unwrap();
        items.copy_within(2, 0, 2).unwrap();
        assert_eq!(
            items.to_vec(),
            vec![1i64.into(), 2i64.into(), 1i64.into(), 2i64.into()]
        );
    }

    #[test]
    fn sort_and_reverse() {
        let parent = node("p");
        let items = parent.list("items").unwrap();
        items
            .assign(vec![3i64.into(), 1i64.into(), 2i64.into()])
            .unwrap();
        items
            .sort_by(|a, b| {
                a.as_number()
                    .partial_cmp(&b.as_number())
                    .unwrap_or(Ordering::Equal)
            })
            .unwrap();
        assert_eq!(
            items.to_vec(),
            vec![1i64.into(), 2i64.into(), 3i64.into()]
        );
        items.reverse().unwrap();
        assert_eq!(
            items.to_vec(),
            vec![3i64.into(), 2i64.into(), 1i64.into()]
        );
    }

    #[test]
    fn non_child_lists_permit_duplicates() {
        let parent = node("p");
        let other = node("x");
        let items = parent.list("items").unwrap();
        items.push(&other).unwrap();
        items.push(&other).unwrap();
        assert_eq!(items.len(), 2);
        // references do not own
        assert!(other.parent().is_none());
    }

    #[test]
    fn point_reads_wake_precisely() {
        let parent = node("p");
        let items = parent.list("items").unwrap();
        items.assign(vec![1i64.into(), 2i64.into()]).unwrap();

        use std::cell::Cell;
        use std::rc::Rc;
        let woken = Rc::new(Cell::new(0));
        let seen = woken.clone();
        let view = items.clone();
        let (_, reader) = tracking::tracked_read(
            move || seen.set(seen.get() + 1),
            || view.get(1),
        );

        items.set(0, 9i64).unwrap();
        assert_eq!(woken.get(), 0);
        assert!(reader.is_armed());

        items.set(1, 9i64).unwrap();
        assert_eq!(woken.get(), 1);
    }

    #[test]
    fn length_readers_wake_on_membership_changes_only() {
        let parent = node("p");
        let items = parent.list("items").unwrap();
        items.assign(vec![1i64.into(), 2i64.into()]).unwrap();

        use std::cell::Cell;
        use std::rc::Rc;
        let woken = Rc::new(Cell::new(0));
        let seen = woken.clone();
        let view = items.clone();
        let (_, _reader) = tracking::tracked_read(
            move || seen.set(seen.get() + 1),
            || view.len(),
        );

        items.set(0, 9i64).unwrap();
        assert_eq!(woken.get(), 0);
        items.push(3i64).unwrap();
        assert_eq!(woken.get(), 1);
    }
}
