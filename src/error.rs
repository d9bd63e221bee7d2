use crate::id::EntityId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A write that disagrees with the field's declared kind, an unknown
    /// field, or a value outside the engine value space.
    #[error("schema violation: {0}")]
    Schema(String),

    /// The same child would occur more than once in a child container.
    #[error("entity {0} would appear more than once in a child container")]
    DuplicateChild(EntityId),

    /// The root entity cannot be given a parent.
    #[error("the root entity cannot be adopted")]
    RootParent,

    /// The stored shape of a field disagrees with its declared kind.
    #[error("field {field:?} of {id} holds a {found} where a {expected} was expected")]
    ShapeMismatch {
        id: EntityId,
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A type tag with no registered model.
    #[error("no model registered for type {0:?}")]
    UnknownType(String),

    /// A model name registered twice.
    #[error("a model named {0:?} is already registered")]
    AlreadyRegistered(String),

    /// A cross-document reference whose dependency is not registered.
    #[error("no dependency registered under id {0:?}")]
    MissingDependency(String),

    /// An entity of a document that is not a dependency of the referrer.
    #[error("entity {0} belongs to a document that is not a dependency of the referring document")]
    CrossDocReference(EntityId),

    /// An operation that requires the root was called before it loaded.
    #[error("the document root has not been loaded")]
    RootNotLoaded,

    /// Undo and redo are only valid between transactions.
    #[error("undo history is not accessible inside a transaction")]
    UndoInTransaction,

    /// The substrate rejected an incoming update.
    #[error("update rejected: {0}")]
    Update(String),

    /// A dependency fetch failed in the adapter.
    #[error(transparent)]
    Dependency(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }
}
