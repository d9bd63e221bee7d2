//! # Plexus
//!
//! A collaborative object-graph engine: a typed, reactive, hierarchical
//! object model lifted over a CRDT document. Applications describe their
//! schema as registered model types with kinded fields (value, list, set,
//! record, each optionally owning its referents as children), attach a
//! root to a document, and work with a live mutable graph whose changes
//! propagate to every connected replica.
//!
//! ## Entities and materialization
//! An [`Entity`] is born ephemeral: plain in-memory state, no document
//! traffic. The moment it becomes reachable from a materialized entity
//! (assigned into a field, pushed into a list, keyed into a record) it
//! binds to that entity's document, recursively for everything it
//! references. "Anything reachable from the root is synchronized,
//! anything unreachable is local."
//!
//! Each materialized entity owns a subtree under the document's `models`
//! map: a type tag, an optional parent entry, and one kind-shaped value
//! per schema field. Entity references are stored as compact tuples,
//! `[id]` locally and `[id, dependencyId]` across documents.
//!
//! ## Ownership
//! Fields declared as `child-*` own their referents: moving an entity
//! into one child container removes it from its previous one, a child
//! occurs at most once per document, and deleting a container releases
//! its children. The protocol runs before the store write, so a rejected
//! operation (a duplicate child, a parent for the root) leaves both the
//! graph and the document untouched.
//!
//! ## Change tracking
//! [`tracked_read`] runs a closure while collecting the precise set of
//! `(entity, field)` pairs it touched. A later write to any member of
//! that set schedules the reader's callback exactly once, batched within
//! the enclosing transaction. Remote updates and undo steps feed the
//! same pipeline, so a reader cannot tell a local write from a synced
//! one. External view layers hook [`set_hooks`] for the raw
//! access/modification stream.
//!
//! ## Transactions and undo
//! [`Plexus::transact`] is reentrant; the outermost call owns the single
//! substrate transaction and drains notifications on commit. One
//! transaction is one undo step.
//!
//! ## Dependencies
//! A document can reference entities of other documents by declaring
//! versioned dependencies on its root. Dependency documents are fetched
//! through the [`PlexusAdapter`], wrapped in sub-orchestrators and
//! deduplicated per `id@version`, so sibling dependencies sharing a
//! transitive dependency share one instance.
//!
//! The CRDT substrate is [`yrs`]; the engine touches it only through
//! maps, arrays, transactions, deep observation, the undo manager and
//! update exchange.

mod cache;
mod dependency;
mod doc;
mod entity;
mod error;
mod id;
mod list;
mod observer;
#[cfg(test)]
mod props;
mod record;
mod reference;
mod registry;
mod schema;
mod set;
#[cfg(test)]
mod testutil;
mod tracking;
mod txn;
mod value;

pub use crate::doc::{Plexus, PlexusAdapter, DEPENDENCIES_FIELD, DEPENDENCY_VERSION_FIELD};
pub use crate::entity::{Entity, FieldInit, Init, PARENT_FIELD};
pub use crate::error::{Error, Result};
pub use crate::id::{EntityId, ROOT_ID};
pub use crate::list::List;
pub use crate::record::Record;
pub use crate::registry::{ModelType, ModelTypeBuilder, Registry};
pub use crate::schema::{FieldDescriptor, FieldKind, Schema};
pub use crate::set::Set;
pub use crate::tracking::{
    set_hooks, suppress_tracking, tracked_read, Key, Target, TrackedReader,
};
pub use crate::value::Value;
