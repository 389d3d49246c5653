use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lookout_core::{Object, ResourceKey, ResourceVersion};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::debug;

/// Name of the built-in index over `metadata.namespace`.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Maps an object to the index values it should be found under.
pub type IndexFn<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

pub fn namespace_index<K: Object>(obj: &K) -> Vec<String> { obj.meta().namespace.iter().cloned().collect() }

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown index {0:?}")]
    UnknownIndex(String),
}

/// Outcome of [`Store::upsert`].
#[derive(Debug)]
pub enum Upsert<K> {
    Inserted,
    /// Replaced the carried previous object.
    Replaced(Arc<K>),
    /// Rejected because the cached object has a newer resource version; carries the cached one.
    Stale(Arc<K>),
}

struct Inner<K> {
    items: FxHashMap<ResourceKey, Arc<K>>,
    indexers: FxHashMap<String, IndexFn<K>>,
    // index name -> index value -> keys
    indices: FxHashMap<String, FxHashMap<String, FxHashSet<ResourceKey>>>,
}

impl<K> Inner<K> {
    fn index_insert(&mut self, key: &ResourceKey, obj: &K) {
        for (name, f) in self.indexers.iter() {
            let idx = self.indices.entry(name.clone()).or_default();
            for v in f(obj) {
                idx.entry(v).or_default().insert(key.clone());
            }
        }
    }

    fn index_remove(&mut self, key: &ResourceKey, obj: &K) {
        for (name, f) in self.indexers.iter() {
            let Some(idx) = self.indices.get_mut(name) else { continue };
            for v in f(obj) {
                if let Some(keys) = idx.get_mut(&v) {
                    keys.remove(key);
                    if keys.is_empty() {
                        idx.remove(&v);
                    }
                }
            }
        }
    }
}

/// Thread-safe cache holding the latest observed object per key.
///
/// Readers share the lock and get owned snapshots (`Arc`s), so nothing they hold changes after
/// the call returns. Every mutation bumps an epoch that can be watched.
pub struct Store<K> {
    inner: Arc<RwLock<Inner<K>>>,
    epoch_tx: Arc<watch::Sender<u64>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner), epoch_tx: Arc::clone(&self.epoch_tx) } }
}

impl<K: Object> Default for Store<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> Store<K> {
    /// Empty store with the namespace index registered.
    pub fn new() -> Self {
        let mut indexers: FxHashMap<String, IndexFn<K>> = FxHashMap::default();
        indexers.insert(NAMESPACE_INDEX.to_string(), Arc::new(namespace_index::<K>));
        let inner = Inner { items: FxHashMap::default(), indexers, indices: FxHashMap::default() };
        let (epoch_tx, _) = watch::channel(0u64);
        Self { inner: Arc::new(RwLock::new(inner)), epoch_tx: Arc::new(epoch_tx) }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    /// Register (or replace) a named index and build it over the current contents.
    pub fn add_indexer(&self, name: impl Into<String>, f: IndexFn<K>) {
        let name = name.into();
        let mut inner = self.write();
        let mut idx: FxHashMap<String, FxHashSet<ResourceKey>> = FxHashMap::default();
        for (key, obj) in inner.items.iter() {
            for v in f(obj) {
                idx.entry(v).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.clone(), idx);
        inner.indexers.insert(name, f);
    }

    /// Insert or replace. Last write wins unless the incoming version is provably older than
    /// the cached one; unordered versions fall back to arrival order.
    pub fn upsert(&self, key: ResourceKey, obj: Arc<K>) -> Upsert<K> {
        let mut inner = self.write();
        let out = match inner.items.get(&key).cloned() {
            Some(old) => {
                if let (Some(new_rv), Some(old_rv)) = (ResourceVersion::of(obj.as_ref()), ResourceVersion::of(old.as_ref())) {
                    if new_rv.is_older_than(&old_rv) {
                        debug!(key = %key, new_rv = %new_rv, cached_rv = %old_rv, "store: ignoring stale write");
                        return Upsert::Stale(old);
                    }
                }
                inner.index_remove(&key, &old);
                Upsert::Replaced(old)
            }
            None => Upsert::Inserted,
        };
        inner.index_insert(&key, &obj);
        inner.items.insert(key, obj);
        self.epoch_tx.send_modify(|e| *e += 1);
        out
    }

    pub fn delete(&self, key: &ResourceKey) -> Option<Arc<K>> {
        let mut inner = self.write();
        let old = inner.items.remove(key)?;
        inner.index_remove(key, &old);
        self.epoch_tx.send_modify(|e| *e += 1);
        Some(old)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<K>> { self.read().items.get(key).cloned() }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.read().items.contains_key(key) }

    pub fn list(&self) -> Vec<Arc<K>> { self.read().items.values().cloned().collect() }

    pub fn list_keys(&self) -> Vec<ResourceKey> { self.read().items.keys().cloned().collect() }

    pub fn entries(&self) -> Vec<(ResourceKey, Arc<K>)> {
        self.read().items.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
    }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.read().items.is_empty() }

    /// Objects whose index function produced `value` for index `name`.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        let inner = self.read();
        if !inner.indexers.contains_key(name) {
            return Err(StoreError::UnknownIndex(name.to_string()));
        }
        let Some(keys) = inner.indices.get(name).and_then(|idx| idx.get(value)) else { return Ok(Vec::new()) };
        Ok(keys.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    /// Distinct values currently present in index `name`.
    pub fn index_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read();
        if !inner.indexers.contains_key(name) {
            return Err(StoreError::UnknownIndex(name.to_string()));
        }
        let mut out: Vec<String> = inner.indices.get(name).map(|idx| idx.keys().cloned().collect()).unwrap_or_default();
        out.sort_unstable();
        Ok(out)
    }

    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}
