use crate::doc::{Plexus, PlexusAdapter};
use crate::entity::{Entity, Init};
use crate::error::Result;
use crate::registry::ModelType;
use crate::schema::FieldKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use yrs::updates::decoder::Decode;
use yrs::{Transact, Update};

pub(crate) struct Models {
    pub component: Arc<ModelType>,
    pub holder: Arc<ModelType>,
    pub node: Arc<ModelType>,
    pub surface: Arc<ModelType>,
}

/// The shared test schema, registered once per process.
pub(crate) fn models() -> &'static Models {
    static MODELS: OnceLock<Models> = OnceLock::new();
    MODELS.get_or_init(|| Models {
        component: ModelType::builder("test.Component")
            .field("name", FieldKind::Val)
            .field_with_default("visible", FieldKind::Val, true)
            .optional("tooltip", FieldKind::Val)
            .register()
            .unwrap(),
        holder: ModelType::builder("test.Holder")
            .optional("value", FieldKind::ChildVal)
            .optional("field", FieldKind::Val)
            .register()
            .unwrap(),
        node: ModelType::builder("test.Node")
            .field("name", FieldKind::Val)
            .field("children", FieldKind::ChildList)
            .field("items", FieldKind::List)
            .field("tags", FieldKind::Set)
            .field("parts", FieldKind::ChildSet)
            .field("meta", FieldKind::Record)
            .field("slots", FieldKind::ChildRecord)
            .register()
            .unwrap(),
        surface: ModelType::builder("test.Surface")
            .optional("title", FieldKind::Val)
            .optional("ref", FieldKind::Val)
            .field("components", FieldKind::ChildRecord)
            .field("children", FieldKind::ChildList)
            .field("dependencies", FieldKind::Set)
            .field("dependencyVersion", FieldKind::Record)
            .register()
            .unwrap(),
    })
}

/// Adapter with a deterministic default root and a canned dependency
/// store keyed by `id@version`.
#[derive(Default)]
pub(crate) struct TestAdapter {
    deps: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: AtomicUsize,
}

impl TestAdapter {
    pub fn provide(&self, id: &str, version: &str, update: Vec<u8>) {
        self.deps.lock().insert(format!("{id}@{version}"), update);
    }
}

#[async_trait(?Send)]
impl PlexusAdapter for TestAdapter {
    fn create_default_root(&self) -> Result<Entity> {
        models().surface.create(Init::new())
    }

    async fn fetch_dependency(&self, id: &str, version: &str) -> anyhow::Result<yrs::Doc> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key = format!("{id}@{version}");
        let bytes = self
            .deps
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no canned dependency {key}"))?;
        let doc = yrs::Doc::new();
        let update = Update::decode_v1(&bytes)?;
        doc.transact_mut().apply_update(update)?;
        Ok(doc)
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

pub(crate) fn plexus() -> Plexus {
    plexus_with_adapter(Arc::new(TestAdapter::default()))
}

pub(crate) fn plexus_with_adapter(adapter: Arc<TestAdapter>) -> Plexus {
    init_tracing();
    Plexus::new(yrs::Doc::new(), adapter)
}

/// An engine over a document seeded from an encoded update.
pub(crate) fn plexus_with(update: &[u8]) -> Plexus {
    let engine = plexus();
    engine.apply_update(update).unwrap();
    engine
}
