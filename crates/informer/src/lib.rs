//! Lookout informer: keeps a local [`Store`] in step with a remote [`ListWatch`] source and
//! notifies registered handlers of every change.
//!
//! Two tasks run per informer. The [`Reflector`] lists and watches the source and pushes deltas
//! into a [`DeltaFifo`]; the [`Controller`] pops them, applies them to the store and calls the
//! handlers. Nothing else is shared between the two.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use lookout_core::{default_key_fn, InformerConfig, KeyFn, ListWatch, Object, ResourceVersion};
use lookout_store::{DeltaFifo, IndexFn, Indexer, QueueError, Store};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod controller;
mod handler;
mod reflector;

pub use controller::Controller;
pub use handler::{HandlerFuncs, HandlerHandle, HandlerRegistry, ResourceEventHandler};
pub use reflector::{Reflector, ReflectorState};

pub struct Informer<K> {
    source: Arc<dyn ListWatch<K>>,
    config: InformerConfig,
    key_fn: KeyFn<K>,
    store: Store<K>,
    queue: Arc<DeltaFifo<K>>,
    handlers: Arc<HandlerRegistry<K>>,
    synced: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<ReflectorState>>,
    checkpoint: Arc<ArcSwapOption<ResourceVersion>>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: Object> Informer<K> {
    pub fn new(source: impl ListWatch<K>) -> Self { Self::from_source(Arc::new(source)) }

    pub fn from_source(source: Arc<dyn ListWatch<K>>) -> Self {
        let store = Store::new();
        let queue = Arc::new(DeltaFifo::new(store.clone()));
        let (synced, _) = watch::channel(false);
        let (state, _) = watch::channel(ReflectorState::Initializing);
        Self {
            source,
            config: InformerConfig::default(),
            key_fn: default_key_fn(),
            store,
            queue,
            handlers: Arc::new(HandlerRegistry::new()),
            synced: Arc::new(synced),
            state: Arc::new(state),
            checkpoint: Arc::new(ArcSwapOption::empty()),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: InformerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default `namespace/name` key function.
    pub fn with_key_fn(mut self, key_fn: KeyFn<K>) -> Self {
        self.key_fn = key_fn;
        self
    }

    pub fn add_indexer(&self, name: impl Into<String>, f: IndexFn<K>) { self.store.add_indexer(name, f) }

    /// Register a handler. Handlers added after start only see changes from then on; call
    /// [`Informer::resync`] to have the current cache redelivered.
    pub fn add_event_handler(&self, handler: impl ResourceEventHandler<K> + 'static) -> HandlerHandle {
        self.handlers.register(Arc::new(handler))
    }

    /// Spawn the reflector and controller tasks and return. Later calls are no-ops.
    ///
    /// Cancelling `shutdown` stops both tasks and closes the queue; nothing is accepted after that.
    pub fn start(&self, shutdown: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("informer: already started");
            return;
        }
        let reflector = Reflector::new(
            Arc::clone(&self.source),
            Arc::clone(&self.queue),
            Arc::clone(&self.key_fn),
            self.config.clone(),
            Arc::clone(&self.checkpoint),
            Arc::clone(&self.state),
        );
        let controller = Controller::new(Arc::clone(&self.queue), self.store.clone(), Arc::clone(&self.handlers), Arc::clone(&self.synced));

        let closer = {
            let token = shutdown.clone();
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                token.cancelled().await;
                queue.close();
            })
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(reflector.run(shutdown.clone())));
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
        tasks.push(closer);
        info!(handlers = self.handlers.len(), "informer: started");
    }

    /// Wait until the initial list has been applied. False if `shutdown` fires first, the
    /// reflector fails fatally, or `timeout` elapses.
    pub async fn wait_for_cache_sync(&self, shutdown: &CancellationToken, timeout: Option<Duration>) -> bool {
        if self.has_synced() {
            return true;
        }
        let mut synced = self.synced.subscribe();
        let mut state = self.state.subscribe();
        let wait = async move {
            loop {
                if *synced.borrow_and_update() {
                    return true;
                }
                if let ReflectorState::Failed(reason) = &*state.borrow_and_update() {
                    debug!(reason = %reason, "informer: reflector failed before sync");
                    return false;
                }
                // Both senders outlive `&self`, so neither side can close here.
                tokio::select! {
                    _ = synced.changed() => {}
                    _ = state.changed() => {}
                }
            }
        };
        let bounded = async move {
            match timeout {
                Some(d) => tokio::time::timeout(d, wait).await.unwrap_or(false),
                None => wait.await,
            }
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            ok = bounded => ok,
        }
    }

    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Read-only view of the cache.
    pub fn get_store(&self) -> Indexer<K> { Indexer::new(self.store.clone()) }

    pub fn reflector_state(&self) -> ReflectorState { self.state.borrow().clone() }

    pub fn subscribe_state(&self) -> watch::Receiver<ReflectorState> { self.state.subscribe() }

    /// Newest resource version the reflector has observed.
    pub fn last_sync_resource_version(&self) -> Option<ResourceVersion> { self.checkpoint.load_full().map(|rv| (*rv).clone()) }

    /// Queue a `Synced` delta for every cached key that has nothing pending.
    pub fn resync(&self) -> Result<usize, QueueError> { self.queue.resync() }

    /// Wait for the informer's tasks to exit after shutdown.
    pub async fn wait_stopped(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "informer: task ended abnormally");
            }
        }
    }
}
