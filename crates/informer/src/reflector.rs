use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use lookout_core::{DeltaKind, InformerConfig, KeyFn, ListWatch, Object, ResourceKey, ResourceVersion, SourceError, WatchEvent, WatchStream};
use lookout_store::{DeltaFifo, QueueError};
use metrics::counter;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the list/watch loop, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectorState {
    Initializing,
    Listing,
    Watching,
    /// Between a failed call or ended stream and the next attempt.
    Disconnected,
    Stopped,
    /// Terminal; the source rejected our credentials.
    Failed(String),
}

impl ReflectorState {
    pub fn is_terminal(&self) -> bool { matches!(self, ReflectorState::Stopped | ReflectorState::Failed(_)) }
}

/// Exponential delay between attempts, reset once a watch delivers events.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self { Self { initial, max, current: None } }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let d = match self.current {
            None => self.initial,
            Some(c) => (c * 2).min(self.max),
        };
        self.current = Some(d);
        d
    }

    pub(crate) fn reset(&mut self) { self.current = None; }
}

enum WatchEnd {
    /// Stream finished cleanly after delivering this many events.
    Ended(usize),
    /// Stream or watch call failed after delivering this many events.
    Errored(SourceError, usize),
    Cancelled,
    QueueClosed,
}

enum Retry {
    Relist,
    Rewatch,
    Stop,
}

/// Feeds a [`DeltaFifo`] from a [`ListWatch`] source: one full list, then a watch resumed from
/// the newest observed version, relisting whenever the watch checkpoint expires.
pub struct Reflector<K> {
    source: Arc<dyn ListWatch<K>>,
    queue: Arc<DeltaFifo<K>>,
    key_fn: KeyFn<K>,
    config: InformerConfig,
    checkpoint: Arc<ArcSwapOption<ResourceVersion>>,
    state: Arc<watch::Sender<ReflectorState>>,
}

impl<K: Object> Reflector<K> {
    pub fn new(
        source: Arc<dyn ListWatch<K>>,
        queue: Arc<DeltaFifo<K>>,
        key_fn: KeyFn<K>,
        config: InformerConfig,
        checkpoint: Arc<ArcSwapOption<ResourceVersion>>,
        state: Arc<watch::Sender<ReflectorState>>,
    ) -> Self {
        Self { source, queue, key_fn, config, checkpoint, state }
    }

    fn set_state(&self, s: ReflectorState) {
        self.state.send_if_modified(|cur| {
            if *cur == s {
                return false;
            }
            debug!(from = ?cur, to = ?s, "reflector: state");
            *cur = s;
            true
        });
    }

    // Checkpoints never move backwards; unordered versions are taken as newer.
    fn advance(&self, rv: ResourceVersion) {
        let cur = self.checkpoint.load_full();
        if cur.as_deref().is_some_and(|c| rv.is_older_than(c)) {
            return;
        }
        self.checkpoint.store(Some(Arc::new(rv)));
    }

    /// Run until `token` is cancelled, the queue is closed or the source fails fatally.
    pub async fn run(self, token: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_initial(), self.config.backoff_max());
        let mut resync = self.config.resync_period().map(|p| {
            let mut iv = tokio::time::interval_at(Instant::now() + p, p);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });
        info!(resync = ?self.config.resync_period(), "reflector: started");

        'list: loop {
            self.set_state(ReflectorState::Listing);
            let listed = tokio::select! {
                biased;
                _ = token.cancelled() => break 'list,
                r = self.source.list() => r,
            };
            match listed {
                // Backoff resets only once a watch delivers events.
                Ok(page) => {
                    if let Err(QueueError::Closed) = self.apply_list(page) {
                        break 'list;
                    }
                }
                Err(e) => match self.on_error(e, &mut backoff, &token).await {
                    Retry::Stop => return,
                    Retry::Relist | Retry::Rewatch => continue 'list,
                },
            }

            loop {
                let Some(since) = self.checkpoint.load_full() else { continue 'list };
                let opened = tokio::select! {
                    biased;
                    _ = token.cancelled() => break 'list,
                    r = self.source.watch(&since) => r,
                };
                let end = match opened {
                    Ok(stream) => {
                        self.set_state(ReflectorState::Watching);
                        debug!(since = %since, "reflector: watch opened");
                        self.drain(stream, &mut resync, &token).await
                    }
                    Err(e) => WatchEnd::Errored(e, 0),
                };
                match end {
                    WatchEnd::Cancelled | WatchEnd::QueueClosed => break 'list,
                    WatchEnd::Ended(events) => {
                        counter!("lookout_reflector_watch_restarts_total", 1);
                        if events > 0 {
                            backoff.reset();
                            debug!(events, "reflector: watch ended, resuming");
                            continue;
                        }
                        self.set_state(ReflectorState::Disconnected);
                        let delay = backoff.next_delay();
                        debug!(delay_ms = delay.as_millis() as u64, "reflector: empty watch, backing off");
                        if !sleep_or_cancel(delay, &token).await {
                            break 'list;
                        }
                    }
                    WatchEnd::Errored(e, events) => {
                        if events > 0 {
                            backoff.reset();
                        }
                        match self.on_error(e, &mut backoff, &token).await {
                            Retry::Stop => return,
                            Retry::Relist => continue 'list,
                            Retry::Rewatch => continue,
                        }
                    }
                }
            }
        }
        self.set_state(ReflectorState::Stopped);
        info!("reflector: stopped");
    }

    fn apply_list(&self, page: lookout_core::ListPage<K>) -> Result<(), QueueError> {
        let mut keyed: Vec<(ResourceKey, Arc<K>)> = Vec::with_capacity(page.items.len());
        for obj in page.items {
            match (self.key_fn)(&obj) {
                Ok(key) => keyed.push((key, Arc::new(obj))),
                Err(e) => warn!(error = %e, "reflector: skipping listed object"),
            }
        }
        let n = self.queue.replace(keyed)?;
        counter!("lookout_reflector_relists_total", 1);
        info!(items = n, rv = %page.resource_version, "reflector: list applied");
        self.checkpoint.store(Some(Arc::new(page.resource_version)));
        Ok(())
    }

    async fn on_error(&self, e: SourceError, backoff: &mut Backoff, token: &CancellationToken) -> Retry {
        match e {
            SourceError::Auth(msg) => {
                error!(error = %msg, "reflector: source rejected credentials");
                self.set_state(ReflectorState::Failed(msg));
                Retry::Stop
            }
            SourceError::CheckpointExpired(msg) => {
                self.set_state(ReflectorState::Disconnected);
                let delay = backoff.next_delay();
                info!(reason = %msg, delay_ms = delay.as_millis() as u64, "reflector: checkpoint expired, relisting");
                if sleep_or_cancel(delay, token).await {
                    Retry::Relist
                } else {
                    self.set_state(ReflectorState::Stopped);
                    Retry::Stop
                }
            }
            SourceError::Transient(msg) => {
                self.set_state(ReflectorState::Disconnected);
                let delay = backoff.next_delay();
                warn!(error = %msg, delay_ms = delay.as_millis() as u64, "reflector: transient error");
                if sleep_or_cancel(delay, token).await {
                    if self.checkpoint.load().is_some() { Retry::Rewatch } else { Retry::Relist }
                } else {
                    self.set_state(ReflectorState::Stopped);
                    Retry::Stop
                }
            }
        }
    }

    async fn drain(&self, mut stream: WatchStream<K>, resync: &mut Option<Interval>, token: &CancellationToken) -> WatchEnd {
        let mut events = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return WatchEnd::Cancelled,
                _ = tick(resync) => match self.queue.resync() {
                    Ok(n) => debug!(queued = n, "reflector: resync"),
                    Err(QueueError::Closed) => return WatchEnd::QueueClosed,
                },
                next = stream.next() => match next {
                    None => return WatchEnd::Ended(events),
                    Some(Err(e)) => return WatchEnd::Errored(e, events),
                    Some(Ok(ev)) => {
                        events += 1;
                        if let Err(QueueError::Closed) = self.handle(ev) {
                            return WatchEnd::QueueClosed;
                        }
                    }
                },
            }
        }
    }

    fn handle(&self, ev: WatchEvent<K>) -> Result<(), QueueError> {
        let (kind, obj) = match ev {
            WatchEvent::Added(o) => (DeltaKind::Added, o),
            WatchEvent::Modified(o) => (DeltaKind::Updated, o),
            WatchEvent::Deleted(o) => (DeltaKind::Deleted, o),
            WatchEvent::Bookmark(rv) => {
                debug!(rv = %rv, "reflector: bookmark");
                self.advance(rv);
                return Ok(());
            }
        };
        counter!("lookout_reflector_events_total", 1);
        let rv = ResourceVersion::of(&obj);
        match (self.key_fn)(&obj) {
            Ok(key) => self.queue.push(key, kind, Arc::new(obj))?,
            Err(e) => warn!(error = %e, kind = ?kind, "reflector: skipping watch event"),
        }
        if let Some(rv) = rv {
            self.advance(rv);
        }
        Ok(())
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// False when cancelled first.
async fn sleep_or_cancel(d: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn terminal_states() {
        assert!(ReflectorState::Stopped.is_terminal());
        assert!(ReflectorState::Failed("x".into()).is_terminal());
        assert!(!ReflectorState::Disconnected.is_terminal());
    }
}
