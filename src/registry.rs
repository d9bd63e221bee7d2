use crate::entity::{Entity, Init};
use crate::error::{Error, Result};
use crate::schema::{FieldDescriptor, FieldKind, Schema};
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// The static definition of an entity type: a name and a schema.
#[derive(Debug)]
pub struct ModelType {
    name: Arc<str>,
    schema: Schema,
}

impl ModelType {
    /// Starts declaring a new model.
    pub fn builder(name: impl Into<Arc<str>>) -> ModelTypeBuilder {
        ModelTypeBuilder {
            name: name.into(),
            schema: Schema::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Instantiates an ephemeral entity of this type.
    pub fn create(self: &Arc<Self>, init: Init) -> Result<Entity> {
        Entity::create(self.clone(), init)
    }

    /// Instantiates an ephemeral entity with all defaults.
    pub fn create_empty(self: &Arc<Self>) -> Result<Entity> {
        Entity::create(self.clone(), Init::default())
    }
}

/// Declares fields one by one, then registers the model process-wide.
pub struct ModelTypeBuilder {
    name: Arc<str>,
    schema: Schema,
}

impl ModelTypeBuilder {
    /// Merges a parent model's schema under this one; fields declared on
    /// this builder win, including kind overrides.
    pub fn extends(mut self, parent: &ModelType) -> Self {
        self.schema = parent.schema.merged_with(&self.schema);
        self
    }

    /// Declares a field. `val` fields declared this way are required at
    /// construction; collection kinds default to an empty container.
    pub fn field(mut self, name: impl Into<Arc<str>>, kind: FieldKind) -> Self {
        self.schema.insert(name.into(), FieldDescriptor::new(kind));
        self
    }

    /// Declares an optional `val` field defaulting to null.
    pub fn optional(self, name: impl Into<Arc<str>>, kind: FieldKind) -> Self {
        self.field_with_default(name, kind, Value::Null)
    }

    /// Declares a field with an explicit default. Defaults must be
    /// primitives and only apply to `val` kinds.
    pub fn field_with_default(
        mut self,
        name: impl Into<Arc<str>>,
        kind: FieldKind,
        default: impl Into<Value>,
    ) -> Self {
        self.schema
            .insert(name.into(), FieldDescriptor::with_default(kind, default.into()));
        self
    }

    /// Registers the model. Fails if the name is taken or a default is
    /// out of place.
    pub fn register(self) -> Result<Arc<ModelType>> {
        for (name, descriptor) in self.schema.iter() {
            if let Some(default) = &descriptor.default {
                if !descriptor.kind.is_val() {
                    return Err(Error::schema(format!(
                        "field {name:?} of kind {:?} cannot carry a default",
                        descriptor.kind
                    )));
                }
                if default.as_entity().is_some() {
                    return Err(Error::schema(format!(
                        "field {name:?} default must be a primitive"
                    )));
                }
            }
        }
        let model = Arc::new(ModelType {
            name: self.name,
            schema: self.schema,
        });
        Registry::global().register(model.clone())?;
        Ok(model)
    }
}

/// Process-wide map from type name to model.
pub struct Registry {
    models: RwLock<BTreeMap<Arc<str>, Arc<ModelType>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(|| Registry {
            models: RwLock::new(BTreeMap::new()),
        })
    }

    fn register(&self, model: Arc<ModelType>) -> Result<()> {
        let mut models = self.models.write();
        if models.contains_key(model.name()) {
            return Err(Error::AlreadyRegistered(model.name().to_owned()));
        }
        models.insert(model.name.clone(), model);
        Ok(())
    }

    /// Returns the model registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<ModelType>> {
        self.models.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }
}
