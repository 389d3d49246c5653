//! The remote side of an informer: anything that can list a collection and stream changes.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::ResourceVersion;

/// Result of one full enumeration of the remote collection.
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    pub items: Vec<K>,
    /// Collection version the list was served at; the watch resumes from here.
    pub resource_version: ResourceVersion,
}

#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker with no object change.
    Bookmark(ResourceVersion),
}

/// Change stream. Ending without an error is a normal end-of-stream and triggers a re-watch.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Network hiccups, throttling, server errors. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Unauthorized or forbidden. Fatal to the reflector.
    #[error("auth: {0}")]
    Auth(String),
    /// The watch checkpoint has been compacted away; only a fresh list recovers.
    #[error("checkpoint expired: {0}")]
    CheckpointExpired(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool { matches!(self, SourceError::Auth(_)) }
}

/// List/watch capability injected into the reflector.
#[async_trait]
pub trait ListWatch<K>: Send + Sync + 'static {
    async fn list(&self) -> Result<ListPage<K>, SourceError>;

    async fn watch(&self, since: &ResourceVersion) -> Result<WatchStream<K>, SourceError>;
}
