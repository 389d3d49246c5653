use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use lookout_core::Object;
use tracing::trace;

/// Callbacks for cache changes. All methods default to no-ops so implementors only override
/// what they need.
///
/// Calls happen on the informer's controller task, one at a time and in per-key order. A slow
/// handler delays every later delta, so hand long work off to another task.
pub trait ResourceEventHandler<K>: Send + Sync {
    /// `initial` is set for objects delivered by the first full list.
    fn on_add(&self, _obj: &K, _initial: bool) {}

    fn on_update(&self, _old: &K, _new: &K) {}

    /// `obj` is the last state known before removal, which may be older than the real final
    /// state if intermediate events were missed.
    fn on_delete(&self, _obj: &K) {}
}

impl<K, H: ResourceEventHandler<K> + ?Sized> ResourceEventHandler<K> for Arc<H> {
    fn on_add(&self, obj: &K, initial: bool) { (**self).on_add(obj, initial) }

    fn on_update(&self, old: &K, new: &K) { (**self).on_update(old, new) }

    fn on_delete(&self, obj: &K) { (**self).on_delete(obj) }
}

type AddFn<K> = Box<dyn Fn(&K, bool) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) + Send + Sync>;
type DeleteFn<K> = Box<dyn Fn(&K) + Send + Sync>;

/// Closure-backed handler; unset callbacks are skipped.
pub struct HandlerFuncs<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<DeleteFn<K>>,
}

impl<K> Default for HandlerFuncs<K> {
    fn default() -> Self { Self { add: None, update: None, delete: None } }
}

impl<K> HandlerFuncs<K> {
    pub fn new() -> Self { Self::default() }

    pub fn with_add(mut self, f: impl Fn(&K, bool) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(mut self, f: impl Fn(&K, &K) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(mut self, f: impl Fn(&K) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K> ResourceEventHandler<K> for HandlerFuncs<K> {
    fn on_add(&self, obj: &K, initial: bool) {
        if let Some(f) = &self.add {
            f(obj, initial)
        }
    }

    fn on_update(&self, old: &K, new: &K) {
        if let Some(f) = &self.update {
            f(old, new)
        }
    }

    fn on_delete(&self, obj: &K) {
        if let Some(f) = &self.delete {
            f(obj)
        }
    }
}

/// Identifies a registration. Registrations live as long as the informer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle(u64);

type Entry<K> = (HandlerHandle, Arc<dyn ResourceEventHandler<K>>);

/// Append-only list of handlers. Notifications go to every handler in registration order.
pub struct HandlerRegistry<K> {
    handlers: RwLock<Vec<Entry<K>>>,
    next_id: AtomicU64,
}

impl<K> Default for HandlerRegistry<K> {
    fn default() -> Self { Self { handlers: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) } }
}

impl<K: Object> HandlerRegistry<K> {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, handler: Arc<dyn ResourceEventHandler<K>>) -> HandlerHandle {
        let handle = HandlerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push((handle, handler));
        trace!(handle = handle.0, "handler registered");
        handle
    }

    pub fn len(&self) -> usize { self.handlers.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    // Handlers run without the lock held so they may register further handlers themselves.
    fn snapshot(&self) -> Vec<Arc<dyn ResourceEventHandler<K>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub fn notify_add(&self, obj: &K, initial: bool) {
        for h in self.snapshot() {
            h.on_add(obj, initial);
        }
    }

    pub fn notify_update(&self, old: &K, new: &K) {
        for h in self.snapshot() {
            h.on_update(old, new);
        }
    }

    pub fn notify_delete(&self, obj: &K) {
        for h in self.snapshot() {
            h.on_delete(obj);
        }
    }
}
