use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lookout_core::{Delta, DeltaKind, DeltaList, Object, ResourceKey};
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::smallvec;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::Store;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("delta queue is closed")]
    Closed,
}

/// What a [`DeltaFifo::pop`] hands back.
#[derive(Debug)]
pub enum Popped<K> {
    Deltas {
        key: ResourceKey,
        deltas: DeltaList<K>,
        /// Entry was queued by the first full list.
        initial: bool,
    },
    /// Every entry from the first full list has been popped. Returned exactly once, and only
    /// after the last of those entries (immediately for an empty list).
    InitialSyncDone,
}

struct Pending<K> {
    deltas: DeltaList<K>,
    initial: bool,
}

struct State<K> {
    items: FxHashMap<ResourceKey, Pending<K>>,
    order: VecDeque<ResourceKey>,
    populated: bool,
    initial_remaining: usize,
    sync_announced: bool,
    closed: bool,
    // Popped but not yet marked done; carries the newest delta handed to the consumer.
    in_flight: Option<(ResourceKey, Delta<K>)>,
}

impl<K> State<K> {
    fn is_in_flight(&self, key: &ResourceKey) -> bool { self.in_flight.as_ref().is_some_and(|(k, _)| k == key) }

    fn pending_delete(&self, key: &ResourceKey) -> bool {
        self.items.get(key).and_then(|p| p.deltas.last()).is_some_and(|d| d.kind == DeltaKind::Deleted)
    }

    fn forget(&mut self, key: &ResourceKey) {
        if let Some(p) = self.items.remove(key) {
            self.order.retain(|k| k != key);
            if p.initial {
                self.initial_remaining -= 1;
            }
        }
    }
}

/// Per-key compressing FIFO between the reflector (producer) and the controller (consumer).
///
/// A key keeps the queue position of its first pending delta; later deltas for the same key are
/// merged into that entry instead of being queued behind everything else.
pub struct DeltaFifo<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    known: Store<K>,
}

impl<K: Object> DeltaFifo<K> {
    /// `known` is the store the consumer applies to; it decides whether an add/delete pair can
    /// be dropped and which keys a resync or relist covers.
    pub fn new(known: Store<K>) -> Self {
        let state = State {
            items: FxHashMap::default(),
            order: VecDeque::new(),
            populated: false,
            initial_remaining: 0,
            sync_announced: false,
            closed: false,
            in_flight: None,
        };
        Self { state: Mutex::new(state), notify: Notify::new(), known }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn push(&self, key: ResourceKey, kind: DeltaKind, object: Arc<K>) -> Result<(), QueueError> {
        let mut st = self.lock();
        if st.closed {
            return Err(QueueError::Closed);
        }
        self.push_locked(&mut st, key, Delta::new(kind, object));
        gauge!("lookout_queue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
        Ok(())
    }

    fn push_locked(&self, st: &mut State<K>, key: ResourceKey, delta: Delta<K>) {
        let in_flight = st.is_in_flight(&key);
        let Some(pending) = st.items.get_mut(&key) else {
            trace!(key = %key, kind = ?delta.kind, "fifo: new entry");
            st.items.insert(key.clone(), Pending { deltas: smallvec![delta], initial: false });
            st.order.push_back(key);
            return;
        };
        match delta.kind {
            DeltaKind::Deleted => {
                let never_applied = pending.deltas.first().is_some_and(|d| d.kind == DeltaKind::Added)
                    && !self.known.contains(&key)
                    && !in_flight;
                if never_applied {
                    debug!(key = %key, "fifo: add+delete collapsed");
                    st.forget(&key);
                } else {
                    pending.deltas = smallvec![delta];
                }
            }
            DeltaKind::Updated | DeltaKind::Added => {
                let last = pending.deltas.last_mut();
                match last {
                    Some(prev) if prev.kind == delta.kind => *prev = delta,
                    _ => pending.deltas.push(delta),
                }
            }
            // Pending deltas already carry state at least as fresh as the cache.
            DeltaKind::Synced => {}
        }
    }

    /// Queue the result of a full list. Keys that are cached or pending but missing from
    /// `items` get a `Deleted` tombstone with their last known state. The first call marks
    /// everything pending as the initial population that gates cache sync.
    pub fn replace(&self, items: Vec<(ResourceKey, Arc<K>)>) -> Result<usize, QueueError> {
        let mut st = self.lock();
        if st.closed {
            return Err(QueueError::Closed);
        }
        let listed = items.len();
        let mut seen: FxHashSet<ResourceKey> = FxHashSet::default();
        for (key, obj) in items {
            seen.insert(key.clone());
            self.push_locked(&mut st, key, Delta::new(DeltaKind::Added, obj));
        }

        let mut tombstones = 0usize;
        for (key, obj) in self.known.entries() {
            if !seen.contains(&key) && !st.pending_delete(&key) {
                self.push_locked(&mut st, key, Delta::new(DeltaKind::Deleted, obj));
                tombstones += 1;
            }
        }
        let pending_only: Vec<(ResourceKey, Arc<K>)> = st
            .items
            .iter()
            .filter(|(k, _)| !seen.contains(*k) && !self.known.contains(k))
            .filter_map(|(k, p)| p.deltas.last().filter(|d| d.kind != DeltaKind::Deleted).map(|d| (k.clone(), Arc::clone(&d.object))))
            .collect();
        for (key, obj) in pending_only {
            self.push_locked(&mut st, key, Delta::new(DeltaKind::Deleted, obj));
            tombstones += 1;
        }
        // The consumer may be about to apply a key that is neither cached nor pending yet.
        let unapplied = st
            .in_flight
            .as_ref()
            .filter(|(k, d)| d.kind != DeltaKind::Deleted && !seen.contains(k) && !st.items.contains_key(k) && !self.known.contains(k))
            .map(|(k, d)| (k.clone(), Arc::clone(&d.object)));
        if let Some((key, obj)) = unapplied {
            self.push_locked(&mut st, key, Delta::new(DeltaKind::Deleted, obj));
            tombstones += 1;
        }

        if !st.populated {
            st.populated = true;
            for p in st.items.values_mut() {
                p.initial = true;
            }
            st.initial_remaining = st.items.len();
        }
        debug!(listed, tombstones, pending = st.order.len(), "fifo: replace");
        gauge!("lookout_queue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
        Ok(listed)
    }

    /// Queue a `Synced` delta for every cached key that has nothing pending.
    pub fn resync(&self) -> Result<usize, QueueError> {
        let mut st = self.lock();
        if st.closed {
            return Err(QueueError::Closed);
        }
        let mut queued = 0usize;
        for (key, obj) in self.known.entries() {
            if st.items.contains_key(&key) {
                continue;
            }
            self.push_locked(&mut st, key, Delta::new(DeltaKind::Synced, obj));
            queued += 1;
        }
        drop(st);
        if queued > 0 {
            self.notify.notify_one();
        }
        Ok(queued)
    }

    /// Wait for the oldest pending key and take its whole delta list. `None` once closed;
    /// entries still pending at that point are never returned.
    ///
    /// Until the consumer calls [`DeltaFifo::done`], the popped key still counts as known to
    /// `replace` and to add/delete collapsing.
    pub async fn pop(&self) -> Option<Popped<K>> {
        loop {
            {
                let mut st = self.lock();
                if st.closed {
                    return None;
                }
                if st.populated && st.initial_remaining == 0 && !st.sync_announced {
                    st.sync_announced = true;
                    return Some(Popped::InitialSyncDone);
                }
                while let Some(key) = st.order.pop_front() {
                    if let Some(p) = st.items.remove(&key) {
                        if p.initial {
                            st.initial_remaining -= 1;
                        }
                        gauge!("lookout_queue_depth", st.order.len() as f64);
                        st.in_flight = p.deltas.last().map(|d| (key.clone(), d.clone()));
                        return Some(Popped::Deltas { key, deltas: p.deltas, initial: p.initial });
                    }
                }
            }
            // A permit stored by notify_one covers a push that raced with this check.
            self.notify.notified().await;
        }
    }

    /// Mark the entry last returned by `pop` for `key` as applied to the store.
    pub fn done(&self, key: &ResourceKey) {
        let mut st = self.lock();
        if st.is_in_flight(key) {
            st.in_flight = None;
        }
    }

    /// Reject further pushes and release a blocked `pop`.
    pub fn close(&self) {
        let mut st = self.lock();
        if !st.closed {
            st.closed = true;
            debug!(pending = st.order.len(), "fifo: closed");
        }
        drop(st);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool { self.lock().closed }

    /// Number of keys with pending deltas.
    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.lock().order.is_empty() }

    /// First full list has been queued and all of it popped.
    pub fn has_synced(&self) -> bool {
        let st = self.lock();
        st.populated && st.initial_remaining == 0
    }

    /// Pending deltas for `key`, oldest first.
    pub fn pending(&self, key: &ResourceKey) -> Option<DeltaList<K>> { self.lock().items.get(key).map(|p| p.deltas.clone()) }
}
