use std::sync::Arc;

use lookout_core::{FieldSelector, LabelSelector, Object, ResourceKey};
use tokio::sync::watch;

use crate::{Store, StoreError, NAMESPACE_INDEX};

/// Read-only view over an informer's [`Store`].
///
/// Reflects the store as of the last applied delta, which trails the remote source by however
/// long the event took to arrive and be processed.
pub struct Indexer<K> {
    store: Store<K>,
}

impl<K> Clone for Indexer<K> {
    fn clone(&self) -> Self { Self { store: self.store.clone() } }
}

impl<K: Object> Indexer<K> {
    pub fn new(store: Store<K>) -> Self { Self { store } }

    pub fn list(&self) -> Vec<Arc<K>> { self.store.list() }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<K>> { self.store.get(key) }

    pub fn get_by_name(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.store.get(&ResourceKey::new(namespace, name))
    }

    pub fn keys(&self) -> Vec<ResourceKey> { self.store.list_keys() }

    pub fn len(&self) -> usize { self.store.len() }

    pub fn is_empty(&self) -> bool { self.store.is_empty() }

    pub fn list_filtered(&self, pred: impl Fn(&K) -> bool) -> Vec<Arc<K>> {
        self.store.list().into_iter().filter(|o| pred(o)).collect()
    }

    pub fn list_by_labels(&self, selector: &LabelSelector) -> Vec<Arc<K>> {
        if selector.is_everything() {
            return self.list();
        }
        self.list_filtered(|o| selector.matches_object(o))
    }

    pub fn list_by_fields(&self, selector: &FieldSelector) -> Vec<Arc<K>> {
        self.list_filtered(|o| selector.matches_object(o))
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.store.by_index(NAMESPACE_INDEX, namespace).unwrap_or_default()
    }

    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> { self.store.by_index(index, value) }

    pub fn index_values(&self, index: &str) -> Result<Vec<String>, StoreError> { self.store.index_values(index) }

    /// Bumped on every store mutation.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.store.subscribe_epoch() }
}
