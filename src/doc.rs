use crate::cache::EntityCache;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::id::{EntityId, ROOT_ID};
use crate::observer;
use crate::reference;
use crate::tracking;
use crate::txn::{self, PendingOp};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use yrs::undo::UndoManager;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Map, MapRef, Out, ReadTxn, StateVector, Subscription, Transact, Update};

pub(crate) const MODELS: &str = "models";
pub(crate) const METADATA: &str = "__metadata__";
pub(crate) const TYPE_KEY: &str = "__type__";
pub(crate) const PARENT_KEY: &str = "__parent__";
pub(crate) const LOCAL_ORIGIN: &str = "plexus";

const DOCUMENT_ID_KEY: &str = "documentId";
const VERSION_KEY: &str = "version";

/// Root fields recognized by the dependency machinery.
pub const DEPENDENCIES_FIELD: &str = "dependencies";
pub const DEPENDENCY_VERSION_FIELD: &str = "dependencyVersion";

/// State shared between the orchestrator, its entities and the staged-op
/// flush: the document, the weak entity cache and the dependency registry.
pub(crate) struct DocShared {
    pub(crate) doc: yrs::Doc,
    pub(crate) cache: EntityCache,
    pub(crate) pending: Mutex<Vec<PendingOp>>,
    deps: RwLock<FnvHashMap<String, Arc<DocShared>>>,
}

impl DocShared {
    pub(crate) fn models<T: ReadTxn>(&self, txn: &T) -> MapRef {
        txn.get_map(MODELS).expect("document has a models map")
    }

    pub(crate) fn dependency(&self, id: &str) -> Option<Arc<DocShared>> {
        self.deps.read().get(id).cloned()
    }

    pub(crate) fn register_dependency(&self, id: String, dep: Arc<DocShared>) {
        self.deps.write().insert(id, dep);
    }

    pub(crate) fn document_id(&self) -> Option<String> {
        observer::metadata_string(&self.doc, DOCUMENT_ID_KEY)
    }
}

/// Supplies the pieces the engine cannot decide for a document: the shape
/// of a fresh root and where dependency documents come from.
#[async_trait(?Send)]
pub trait PlexusAdapter {
    /// Builds the root entity for a document that has none yet. Must be
    /// deterministic so concurrent initializations from several replicas
    /// converge to the same state.
    fn create_default_root(&self) -> Result<Entity>;

    /// Fetches the document for a dependency at a resolved version.
    async fn fetch_dependency(&self, id: &str, version: &str) -> anyhow::Result<yrs::Doc> {
        anyhow::bail!("no dependency source for {id}@{version}")
    }
}

pub(crate) struct PlexusInner {
    pub(crate) shared: Arc<DocShared>,
    pub(crate) adapter: Arc<dyn PlexusAdapter>,
    pub(crate) undo: Mutex<UndoManager<()>>,
    pub(crate) root: Mutex<Option<Entity>>,
    /// `depId@version` to orchestrator, shared per root orchestrator so
    /// transitive dependencies dedupe.
    pub(crate) dedup: Arc<Mutex<FnvHashMap<String, Plexus>>>,
    /// `depId` to sub-orchestrator, keeping subscriptions alive.
    pub(crate) subs: Mutex<FnvHashMap<String, Plexus>>,
    _subscription: Subscription,
}

/// The per-document engine: attaches a typed root to a CRDT document,
/// loads entities by id, runs transactions, bridges undo, and manages
/// versioned dependency documents.
#[derive(Clone)]
pub struct Plexus {
    pub(crate) inner: Arc<PlexusInner>,
}

impl Plexus {
    /// Wraps a CRDT document.
    pub fn new(doc: yrs::Doc, adapter: Arc<dyn PlexusAdapter>) -> Plexus {
        Self::new_with(doc, adapter, Arc::new(Mutex::new(FnvHashMap::default())))
    }

    pub(crate) fn new_with(
        doc: yrs::Doc,
        adapter: Arc<dyn PlexusAdapter>,
        dedup: Arc<Mutex<FnvHashMap<String, Plexus>>>,
    ) -> Plexus {
        let models = doc.get_or_insert_map(MODELS);
        doc.get_or_insert_map(METADATA);

        let mut options = yrs::undo::Options::default();
        options.capture_timeout_millis = 0;
        let mut undo = UndoManager::with_scope_and_options(&doc, &models, options);
        undo.include_origin(LOCAL_ORIGIN);

        let shared = Arc::new(DocShared {
            doc,
            cache: EntityCache::default(),
            pending: Mutex::new(Vec::new()),
            deps: RwLock::new(FnvHashMap::default()),
        });
        let subscription = observer::install(&shared, &models);

        Plexus {
            inner: Arc::new(PlexusInner {
                shared,
                adapter,
                undo: Mutex::new(undo),
                root: Mutex::new(None),
                dedup,
                subs: Mutex::new(FnvHashMap::default()),
                _subscription: subscription,
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<DocShared> {
        self.inner.shared.clone()
    }

    // ------------------------------------------------------------------
    // metadata

    pub fn document_id(&self) -> Option<String> {
        self.inner.shared.document_id()
    }

    pub fn version(&self) -> Option<String> {
        observer::metadata_string(&self.inner.shared.doc, VERSION_KEY)
    }

    fn set_metadata(&self, key: &str, value: &str) {
        let doc = &self.inner.shared.doc;
        let mut txn = doc.transact_mut();
        if let Some(metadata) = txn.get_map(METADATA) {
            metadata.insert(&mut txn, key, Any::String(value.into()));
        }
    }

    pub fn set_document_id(&self, id: &str) {
        self.set_metadata(DOCUMENT_ID_KEY, id);
    }

    pub(crate) fn set_version(&self, version: &str) {
        self.set_metadata(VERSION_KEY, version);
    }

    // ------------------------------------------------------------------
    // transactions

    /// Runs `f` as one transaction. Reentrant: nested calls join the
    /// outermost one, which owns the single substrate transaction and the
    /// notification drain.
    pub fn transact<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        txn::with(f)
    }

    // ------------------------------------------------------------------
    // root

    /// Loads the root entity: rehydrates a stored one or materializes the
    /// adapter's default, then resolves the root's declared dependencies.
    pub async fn load_root(&self) -> Result<Entity> {
        if let Some(root) = self.inner.root.lock().clone() {
            return Ok(root);
        }

        // dependencies first: the stored root may hold references into
        // them, which rehydration must be able to resolve
        for (id, version) in self.stored_dependency_versions() {
            self.ensure_dependency(&id, &version).await?;
        }

        let stored = {
            let txn = self.inner.shared.doc.transact();
            let models = self.inner.shared.models(&txn);
            models.get(&txn, ROOT_ID).is_some()
        };
        let root = if stored {
            let txn = self.inner.shared.doc.transact();
            reference::resolve_local(&self.inner.shared, &txn, &EntityId::root())?
        } else {
            let root = self.inner.adapter.create_default_root()?;
            root.force_id(EntityId::root());
            let shared = self.inner.shared.clone();
            self.transact(|| root.materialize_into(&shared))?;
            tracing::debug!("created default root");
            root
        };
        *self.inner.root.lock() = Some(root.clone());
        Ok(root)
    }

    /// The loaded root.
    pub fn root(&self) -> Result<Entity> {
        self.inner.root.lock().clone().ok_or(Error::RootNotLoaded)
    }

    pub fn is_root_loaded(&self) -> bool {
        self.inner.root.lock().is_some()
    }

    fn ensure_root_loaded(&self) -> Result<()> {
        if self.is_root_loaded() {
            Ok(())
        } else {
            Err(Error::RootNotLoaded)
        }
    }

    fn stored_dependency_versions(&self) -> Vec<(String, String)> {
        let txn = self.inner.shared.doc.transact();
        let models = self.inner.shared.models(&txn);
        let Some(Out::YMap(root)) = models.get(&txn, ROOT_ID) else {
            return Vec::new();
        };
        let Some(Out::YMap(versions)) = root.get(&txn, DEPENDENCY_VERSION_FIELD) else {
            return Vec::new();
        };
        versions
            .iter(&txn)
            .filter_map(|(id, out)| match out {
                Out::Any(Any::String(version)) => Some((id.to_string(), version.to_string())),
                Out::Any(Any::Number(version)) => Some((id.to_string(), version.to_string())),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // load-by-id surface

    /// Resolves an entity by id. Requires the root to be loaded.
    pub fn load_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.ensure_root_loaded()?;
        reference::load(&self.inner.shared, &EntityId::from(id))
    }

    pub fn has_entity(&self, id: &str) -> Result<bool> {
        self.ensure_root_loaded()?;
        let txn = self.inner.shared.doc.transact();
        let models = self.inner.shared.models(&txn);
        Ok(models.get(&txn, id).is_some())
    }

    /// The stored entity ids, optionally filtered by type tag.
    pub fn entity_ids(&self, type_name: Option<&str>) -> Result<Vec<EntityId>> {
        self.ensure_root_loaded()?;
        let txn = self.inner.shared.doc.transact();
        let models = self.inner.shared.models(&txn);
        let mut ids = Vec::new();
        for (id, out) in models.iter(&txn) {
            let Out::YMap(map) = out else { continue };
            if let Some(wanted) = type_name {
                match map.get(&txn, TYPE_KEY) {
                    Some(Out::Any(Any::String(tag))) if tag.as_ref() == wanted => {}
                    _ => continue,
                }
            }
            ids.push(EntityId::from(id));
        }
        ids.sort();
        Ok(ids)
    }

    pub fn entity_type(&self, id: &str) -> Result<Option<String>> {
        self.ensure_root_loaded()?;
        let txn = self.inner.shared.doc.transact();
        let models = self.inner.shared.models(&txn);
        let Some(Out::YMap(map)) = models.get(&txn, id) else {
            return Ok(None);
        };
        match map.get(&txn, TYPE_KEY) {
            Some(Out::Any(Any::String(tag))) => Ok(Some(tag.to_string())),
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // undo

    /// Undoes the last local transaction. Change notifications ride the
    /// same pipeline as any other write.
    pub fn undo(&self) -> Result<bool> {
        if txn::in_transaction() {
            return Err(Error::UndoInTransaction);
        }
        let undone = self.inner.undo.lock().undo_blocking();
        tracking::drain();
        Ok(undone)
    }

    pub fn redo(&self) -> Result<bool> {
        if txn::in_transaction() {
            return Err(Error::UndoInTransaction);
        }
        let redone = self.inner.undo.lock().redo_blocking();
        tracking::drain();
        Ok(redone)
    }

    // ------------------------------------------------------------------
    // update exchange

    pub fn state_vector(&self) -> Vec<u8> {
        self.inner.shared.doc.transact().state_vector().encode_v1()
    }

    /// Encodes the document state missing from `state_vector` (or all of
    /// it when `None`).
    pub fn encode_update(&self, state_vector: Option<&[u8]>) -> Result<Vec<u8>> {
        let sv = match state_vector {
            Some(bytes) => {
                StateVector::decode_v1(bytes).map_err(|err| Error::Update(err.to_string()))?
            }
            None => StateVector::default(),
        };
        let txn = self.inner.shared.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Applies a remote update. Affected mirrors refresh and their
    /// readers are notified through the normal pipeline once the
    /// substrate transaction has committed.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update).map_err(|err| Error::Update(err.to_string()))?;
        let mut txn = self.inner.shared.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|err| Error::Update(err.to_string()))?;
        drop(txn);
        if !txn::in_transaction() {
            tracking::drain();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Plexus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Plexus")
            .field("document_id", &self.document_id())
            .field("root_loaded", &self.is_root_loaded())
            .finish_non_exhaustive()
    }
}
