use std::sync::Arc;
use std::time::Instant;

use lookout_core::{Delta, DeltaKind, Object, ResourceKey};
use lookout_store::{DeltaFifo, Popped, Store, Upsert};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::HandlerRegistry;

/// Single consumer of the delta queue: applies each popped entry to the store and fans the
/// resulting change out to handlers.
pub struct Controller<K> {
    queue: Arc<DeltaFifo<K>>,
    store: Store<K>,
    handlers: Arc<HandlerRegistry<K>>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K: Object> Controller<K> {
    pub fn new(queue: Arc<DeltaFifo<K>>, store: Store<K>, handlers: Arc<HandlerRegistry<K>>, synced: Arc<watch::Sender<bool>>) -> Self {
        Self { queue, store, handlers, synced }
    }

    /// Run until cancelled or the queue closes. An entry being processed when cancellation
    /// arrives is finished first.
    pub async fn run(self, token: CancellationToken) {
        info!("controller: started");
        loop {
            let popped = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                p = self.queue.pop() => p,
            };
            match popped {
                None => break,
                Some(Popped::InitialSyncDone) => {
                    info!(objects = self.store.len(), "controller: initial sync complete");
                    self.synced.send_replace(true);
                }
                Some(Popped::Deltas { key, deltas, initial }) => {
                    let started = Instant::now();
                    counter!("lookout_controller_deltas_total", deltas.len() as u64);
                    for d in deltas {
                        self.apply(&key, d, initial);
                    }
                    self.queue.done(&key);
                    histogram!("lookout_controller_process_ms", started.elapsed().as_secs_f64() * 1000.0);
                }
            }
        }
        info!("controller: stopped");
    }

    fn apply(&self, key: &ResourceKey, delta: Delta<K>, initial: bool) {
        trace!(key = %key, kind = ?delta.kind, "controller: apply");
        match delta.kind {
            DeltaKind::Added | DeltaKind::Updated | DeltaKind::Synced => {
                match self.store.upsert(key.clone(), Arc::clone(&delta.object)) {
                    Upsert::Inserted => self.handlers.notify_add(&delta.object, initial),
                    Upsert::Replaced(old) => self.handlers.notify_update(&old, &delta.object),
                    Upsert::Stale(_) => debug!(key = %key, "controller: dropped stale delta"),
                }
            }
            DeltaKind::Deleted => {
                if self.store.delete(key).is_none() {
                    debug!(key = %key, "controller: delete for uncached key");
                }
                self.handlers.notify_delete(&delta.object);
            }
        }
    }
}
