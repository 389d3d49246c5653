//! Lookout core types: resource keys, versions, deltas and the list/watch source contract.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod selector;
pub mod source;

pub use config::InformerConfig;
pub use selector::{FieldSelector, LabelSelector, Requirement, SelectorError};
pub use source::{ListPage, ListWatch, SourceError, WatchEvent, WatchStream};

/// Anything an informer can cache: a kube resource that is cheap enough to clone and can
/// cross task boundaries.
pub trait Object: kube::Resource + Clone + Send + Sync + 'static {}

impl<T> Object for T where T: kube::Resource + Clone + Send + Sync + 'static {}

/// Stable identity of a cached object: `namespace/name`, or just `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split back into `(namespace, name)`.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
}

/// Pure function mapping an object to its key. Injected into the informer so callers can
/// choose a different identity (e.g. uid) without touching the engine.
pub type KeyFn<K> = Arc<dyn Fn(&K) -> Result<ResourceKey, KeyError> + Send + Sync>;

/// Default key function: `metadata.namespace/metadata.name`.
pub fn namespaced_key<K: Object>(obj: &K) -> Result<ResourceKey, KeyError> {
    let meta = obj.meta();
    let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)?;
    Ok(ResourceKey::new(meta.namespace.as_deref(), name))
}

pub fn default_key_fn<K: Object>() -> KeyFn<K> { Arc::new(namespaced_key::<K>) }

/// Opaque checkpoint in the remote change history.
///
/// Kubernetes versions are decimal strings in practice, so two versions that both parse as
/// integers compare numerically. Anything else is only known to be equal or unordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn of<K: Object>(obj: &K) -> Option<Self> {
        obj.resource_version().filter(|v| !v.is_empty()).map(Self)
    }

    /// `None` when the two versions cannot be ordered.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if self.0 == other.0 {
            return Some(Ordering::Equal);
        }
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) if a != b => Some(a.cmp(&b)),
            _ => None,
        }
    }

    /// True only when `self` is known to be older than `other`.
    pub fn is_older_than(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Less)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    Synced,
}

/// One change for one key. For `Deleted` the object is the tombstone: the last state known
/// before removal.
#[derive(Debug)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub object: Arc<K>,
}

impl<K> Delta<K> {
    pub fn new(kind: DeltaKind, object: Arc<K>) -> Self { Self { kind, object } }
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self { Self { kind: self.kind, object: Arc::clone(&self.object) } }
}

/// Pending deltas for a single key, oldest first. Compression keeps these short.
pub type DeltaList<K> = SmallVec<[Delta<K>; 2]>;

pub mod prelude {
    pub use super::{
        default_key_fn, namespaced_key, Delta, DeltaKind, DeltaList, KeyError, KeyFn, Object, ResourceKey,
        ResourceVersion,
    };
    pub use super::{FieldSelector, InformerConfig, LabelSelector, ListPage, ListWatch, SourceError, WatchEvent, WatchStream};
}
