use crate::doc::{Plexus, DEPENDENCIES_FIELD, DEPENDENCY_VERSION_FIELD};
use crate::error::{Error, Result};
use crate::value::Value;
use futures::future::LocalBoxFuture;
use std::sync::Arc;

// Dependency documents are immutable per resolved version and deduplicated
// process-wide per root orchestrator: two references to the same
// `id@version` share one sub-orchestrator, and with it one document
// instance, entity cache and subscription.

impl Plexus {
    /// The sub-orchestrator registered for a dependency id, if any.
    pub fn dependency(&self, id: &str) -> Option<Plexus> {
        self.inner.subs.lock().get(id).cloned()
    }

    /// The registered dependency ids.
    pub fn dependency_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.subs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves `id@version` against the shared table, fetching the
    /// document through the adapter when it is not present yet. Boxed so
    /// nested dependencies can recurse through root loading.
    pub(crate) fn ensure_dependency<'a>(
        &'a self,
        id: &'a str,
        version: &'a str,
    ) -> LocalBoxFuture<'a, Result<Plexus>> {
        Box::pin(async move {
            let key = format!("{id}@{version}");
            let existing = self.inner.dedup.lock().get(&key).cloned();
            if let Some(existing) = existing {
                self.inner
                    .shared
                    .register_dependency(id.to_string(), existing.shared());
                self.inner
                    .subs
                    .lock()
                    .insert(id.to_string(), existing.clone());
                return Ok(existing);
            }

            tracing::debug!(id, version, "fetching dependency document");
            let doc = self
                .inner
                .adapter
                .fetch_dependency(id, version)
                .await
                .map_err(Error::Dependency)?;
            let sub = Plexus::new_with(doc, self.inner.adapter.clone(), self.inner.dedup.clone());
            sub.set_document_id(id);
            sub.set_version(version);

            self.inner.dedup.lock().insert(key.clone(), sub.clone());
            self.inner
                .shared
                .register_dependency(id.to_string(), sub.shared());
            self.inner.subs.lock().insert(id.to_string(), sub.clone());

            if let Err(err) = sub.load_root().await {
                self.inner.dedup.lock().remove(&key);
                self.inner.subs.lock().remove(id);
                return Err(err);
            }
            Ok(sub)
        })
    }

    /// Fetches a dependency, records `(id, version)` on the root, and adds
    /// the remote root entity to the local `dependencies` set.
    pub async fn add_dependency(&self, id: &str, version: &str) -> Result<Plexus> {
        let root = self.root()?;
        let dep = self.ensure_dependency(id, version).await?;
        let dep_root = dep.root()?;
        self.transact(|| {
            if root.model().schema().contains(DEPENDENCY_VERSION_FIELD) {
                root.record(DEPENDENCY_VERSION_FIELD)?.set(id, version)?;
            }
            if root.model().schema().contains(DEPENDENCIES_FIELD) {
                root.set(DEPENDENCIES_FIELD)?.add(&dep_root)?;
            }
            Ok(())
        })?;
        Ok(dep)
    }

    /// Re-points a dependency at a new version; a call with the already
    /// resolved version is a no-op.
    pub async fn update_dependency(&self, id: &str, version: &str) -> Result<Plexus> {
        let root = self.root()?;
        let current = root.record(DEPENDENCY_VERSION_FIELD)?.get(id);
        if current == Some(Value::from(version)) {
            if let Some(existing) = self.dependency(id) {
                return Ok(existing);
            }
        }
        let previous = self.dependency(id);
        let dep = self.ensure_dependency(id, version).await?;
        let dep_root = dep.root()?;
        self.transact(|| {
            root.record(DEPENDENCY_VERSION_FIELD)?.set(id, version)?;
            let set = root.set(DEPENDENCIES_FIELD)?;
            if let Some(previous) = &previous {
                if !Arc::ptr_eq(&previous.inner, &dep.inner) {
                    let old_shared = previous.shared();
                    for member in set.to_vec() {
                        let swapped_out = member
                            .as_entity()
                            .and_then(|entity| entity.binding())
                            .map(|binding| Arc::ptr_eq(&binding, &old_shared))
                            .unwrap_or(false);
                        if swapped_out {
                            set.remove(&member)?;
                        }
                    }
                }
            }
            set.add(&dep_root)?;
            Ok(())
        })?;
        Ok(dep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{MODELS, TYPE_KEY};
    use crate::entity::Init;
    use crate::testutil::{models, plexus, plexus_with_adapter, TestAdapter};
    use std::sync::atomic::Ordering;
    use yrs::{Any, Map, Out, ReadTxn, Transact};

    async fn dependency_update() -> Vec<u8> {
        // a standalone document whose root is the dependency's "alpha"
        let engine = plexus();
        let root = engine.load_root().await.unwrap();
        engine.transact(|| root.assign("title", "alpha")).unwrap();
        engine.encode_update(None).unwrap()
    }

    #[async_std::test]
    async fn cross_document_references_encode_with_the_dependency_id() {
        let adapter = Arc::new(TestAdapter::default());
        adapter.provide("depA", "1.0.0", dependency_update().await);
        let engine = plexus_with_adapter(adapter);
        let root = engine.load_root().await.unwrap();

        let dep = engine.add_dependency("depA", "1.0.0").await.unwrap();
        let alpha = dep.root().unwrap();
        engine.transact(|| root.assign("ref", &alpha)).unwrap();

        // stored as [X, "depA"]
        let shared = engine.shared();
        let txn = shared.doc.transact();
        let models_map = txn.get_map(MODELS).unwrap();
        let Some(Out::YMap(stored_root)) = models_map.get(&txn, "root") else {
            panic!("no stored root");
        };
        match stored_root.get(&txn, "ref") {
            Some(Out::Any(Any::Array(parts))) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0], Any::String(alpha.id().as_str().into()));
                assert_eq!(parts[1], Any::String("depA".into()));
            }
            other => panic!("unexpected stored reference {other:?}"),
        }
        drop(txn);

        // decoding from the referrer resolves to the same live entity
        let resolved = root.get("ref").unwrap();
        assert!(resolved.as_entity().unwrap().same(&alpha));
        assert_eq!(alpha.get("title").unwrap(), crate::Value::from("alpha"));
    }

    #[async_std::test]
    async fn adding_the_same_version_twice_fetches_once() {
        let adapter = Arc::new(TestAdapter::default());
        adapter.provide("depA", "1.0.0", dependency_update().await);
        let engine = plexus_with_adapter(adapter.clone());
        let root = engine.load_root().await.unwrap();

        let first = engine.add_dependency("depA", "1.0.0").await.unwrap();
        let second = engine.add_dependency("depA", "1.0.0").await.unwrap();
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(root.set("dependencies").unwrap().len(), 1);
    }

    #[async_std::test]
    async fn updating_to_a_new_version_swaps_the_dependency() {
        let adapter = Arc::new(TestAdapter::default());
        adapter.provide("depA", "1.0.0", dependency_update().await);
        adapter.provide("depA", "2.0.0", dependency_update().await);
        let engine = plexus_with_adapter(adapter.clone());
        let root = engine.load_root().await.unwrap();

        let v1 = engine.add_dependency("depA", "1.0.0").await.unwrap();
        let unchanged = engine.update_dependency("depA", "1.0.0").await.unwrap();
        assert!(Arc::ptr_eq(&v1.inner, &unchanged.inner));
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 1);

        let v2 = engine.update_dependency("depA", "2.0.0").await.unwrap();
        assert!(!Arc::ptr_eq(&v1.inner, &v2.inner));
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(
            root.record("dependencyVersion").unwrap().get("depA").unwrap(),
            crate::Value::from("2.0.0")
        );
        assert_eq!(root.set("dependencies").unwrap().len(), 1);
        assert!(engine
            .dependency("depA")
            .map(|dep| Arc::ptr_eq(&dep.inner, &v2.inner))
            .unwrap_or(false));
    }

    #[async_std::test]
    async fn dependencies_resolve_on_reload_from_bytes() {
        let adapter = Arc::new(TestAdapter::default());
        adapter.provide("depA", "1.0.0", dependency_update().await);
        let engine = plexus_with_adapter(adapter.clone());
        let root = engine.load_root().await.unwrap();
        let dep = engine.add_dependency("depA", "1.0.0").await.unwrap();
        engine
            .transact(|| root.assign("ref", &dep.root()?))
            .unwrap();
        let bytes = engine.encode_update(None).unwrap();

        // a second replica of the referring document resolves depA from
        // the stored dependencyVersion record during root load
        let replica = plexus_with_adapter(adapter.clone());
        replica.apply_update(&bytes).unwrap();
        let root2 = replica.load_root().await.unwrap();
        let alpha = root2.get("ref").unwrap();
        let alpha = alpha.as_entity().unwrap();
        assert_eq!(alpha.get("title").unwrap(), crate::Value::from("alpha"));
        // the replica fetched its own copy
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 2);

        let shared = replica.shared();
        let txn = shared.doc.transact();
        let models_map = txn.get_map(MODELS).unwrap();
        let Some(Out::YMap(stored_root)) = models_map.get(&txn, "root") else {
            panic!("no stored root");
        };
        assert!(matches!(
            stored_root.get(&txn, TYPE_KEY),
            Some(Out::Any(Any::String(tag))) if tag.as_ref() == models().surface.name()
        ));
    }
}
