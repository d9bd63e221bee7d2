use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The declared kind of a field. `Child*` kinds own their referents and
/// drive the parent protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FieldKind {
    Val,
    ChildVal,
    List,
    ChildList,
    Set,
    ChildSet,
    Record,
    ChildRecord,
}

/// The stored shape of a kind on the document.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Shape {
    Value,
    Array,
    Map,
}

impl Shape {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Array => "array",
            Self::Map => "map",
        }
    }
}

impl FieldKind {
    pub fn is_child(self) -> bool {
        matches!(
            self,
            Self::ChildVal | Self::ChildList | Self::ChildSet | Self::ChildRecord
        )
    }

    pub(crate) fn shape(self) -> Shape {
        match self {
            Self::Val | Self::ChildVal => Shape::Value,
            Self::List | Self::ChildList | Self::Set | Self::ChildSet => Shape::Array,
            Self::Record | Self::ChildRecord => Shape::Map,
        }
    }

    pub(crate) fn is_list(self) -> bool {
        matches!(self, Self::List | Self::ChildList)
    }

    pub(crate) fn is_set(self) -> bool {
        matches!(self, Self::Set | Self::ChildSet)
    }

    pub(crate) fn is_record(self) -> bool {
        matches!(self, Self::Record | Self::ChildRecord)
    }

    pub(crate) fn is_val(self) -> bool {
        matches!(self, Self::Val | Self::ChildVal)
    }
}

/// One schema entry. A `val` field with no default is required at
/// construction; collection kinds always default to an empty container.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    pub kind: FieldKind,
    pub default: Option<Value>,
}

impl FieldDescriptor {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            default: None,
        }
    }

    pub fn with_default(kind: FieldKind, default: Value) -> Self {
        Self {
            kind,
            default: Some(default),
        }
    }
}

/// The immutable schema of a model: field name to descriptor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    fields: BTreeMap<Arc<str>, FieldDescriptor>,
}

impl Schema {
    pub(crate) fn insert(&mut self, name: Arc<str>, descriptor: FieldDescriptor) {
        self.fields.insert(name, descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &FieldDescriptor)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shallow merge with `self` as the base; entries of `derived` win,
    /// including kind overrides.
    pub(crate) fn merged_with(&self, derived: &Schema) -> Schema {
        let mut fields = self.fields.clone();
        for (name, descriptor) in &derived.fields {
            fields.insert(name.clone(), descriptor.clone());
        }
        Schema { fields }
    }
}
