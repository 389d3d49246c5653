//! Lookout store: the object cache, the delta FIFO feeding it, and the read-only indexer.

#![forbid(unsafe_code)]

mod fifo;
mod indexer;
mod store;

pub use fifo::{DeltaFifo, Popped, QueueError};
pub use indexer::Indexer;
pub use store::{namespace_index, IndexFn, Store, StoreError, Upsert, NAMESPACE_INDEX};
