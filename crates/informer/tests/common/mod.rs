#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use lookout_core::{ListPage, ListWatch, ResourceVersion, SourceError, WatchEvent, WatchStream};
use lookout_informer::ResourceEventHandler;
use tokio::sync::Notify;

pub fn init_tracing() { let _ = tracing_subscriber::fmt().with_env_filter("debug").with_test_writer().try_init(); }

pub fn cm(name: &str, rv: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            resource_version: Some(rv.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn page(items: Vec<ConfigMap>, rv: &str) -> Result<ListPage<ConfigMap>, SourceError> {
    Ok(ListPage { items, resource_version: ResourceVersion::new(rv) })
}

/// One scripted `watch` call.
pub struct WatchScript {
    /// `watch` does not return until this is notified.
    pub gate: Option<Arc<Notify>>,
    pub open: Result<Vec<Result<WatchEvent<ConfigMap>, SourceError>>, SourceError>,
    /// Keep the stream open after the scripted events instead of ending it.
    pub hang: bool,
}

impl WatchScript {
    pub fn events(events: Vec<WatchEvent<ConfigMap>>) -> Self {
        Self { gate: None, open: Ok(events.into_iter().map(Ok).collect()), hang: true }
    }

    pub fn fail(err: SourceError) -> Self { Self { gate: None, open: Err(err), hang: false } }

    pub fn gated(mut self, gate: &Arc<Notify>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub fn then_end(mut self) -> Self {
        self.hang = false;
        self
    }
}

/// In-memory `ListWatch` replaying scripted results in order. Once a script runs out the
/// corresponding call never completes.
#[derive(Default)]
pub struct ScriptedSource {
    lists: Mutex<VecDeque<Result<ListPage<ConfigMap>, SourceError>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    since: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(lists: Vec<Result<ListPage<ConfigMap>, SourceError>>, watches: Vec<WatchScript>) -> Arc<Self> {
        Arc::new(Self {
            lists: Mutex::new(lists.into()),
            watches: Mutex::new(watches.into()),
            since: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
        })
    }

    pub fn list_calls(&self) -> usize { self.list_calls.load(Ordering::SeqCst) }

    /// Versions each `watch` call resumed from.
    pub fn watched_since(&self) -> Vec<String> { self.since.lock().unwrap().clone() }
}

#[async_trait]
impl ListWatch<ConfigMap> for ScriptedSource {
    async fn list(&self) -> Result<ListPage<ConfigMap>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, since: &ResourceVersion) -> Result<WatchStream<ConfigMap>, SourceError> {
        self.since.lock().unwrap().push(since.to_string());
        let next = self.watches.lock().unwrap().pop_front();
        let Some(script) = next else { return Ok(futures::stream::pending().boxed()) };
        if let Some(gate) = script.gate {
            gate.notified().await;
        }
        let events = script.open?;
        let stream = futures::stream::iter(events);
        if script.hang {
            Ok(stream.chain(futures::stream::pending()).boxed())
        } else {
            Ok(stream.boxed())
        }
    }
}

/// Source whose watch checkpoint is always already expired.
#[derive(Default)]
pub struct ExpiringSource {
    list_calls: AtomicUsize,
}

impl ExpiringSource {
    pub fn list_calls(&self) -> usize { self.list_calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl ListWatch<ConfigMap> for ExpiringSource {
    async fn list(&self) -> Result<ListPage<ConfigMap>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        page(Vec::new(), "1")
    }

    async fn watch(&self, _since: &ResourceVersion) -> Result<WatchStream<ConfigMap>, SourceError> {
        Err(SourceError::CheckpointExpired("resource version too old".into()))
    }
}

/// Handler that logs every call as a compact line.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
}

fn id(o: &ConfigMap) -> String {
    format!("{}@{}", o.metadata.name.as_deref().unwrap_or(""), o.metadata.resource_version.as_deref().unwrap_or(""))
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> { self.calls.lock().unwrap().clone() }

    pub fn len(&self) -> usize { self.calls.lock().unwrap().len() }
}

impl ResourceEventHandler<ConfigMap> for Recorder {
    fn on_add(&self, obj: &ConfigMap, initial: bool) {
        let tag = if initial { " initial" } else { "" };
        self.calls.lock().unwrap().push(format!("add {}{}", id(obj), tag));
    }

    fn on_update(&self, old: &ConfigMap, new: &ConfigMap) {
        self.calls.lock().unwrap().push(format!("update {} -> {}", id(old), id(new)));
    }

    fn on_delete(&self, obj: &ConfigMap) { self.calls.lock().unwrap().push(format!("delete {}", id(obj))); }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(cond: impl Fn() -> bool) -> bool { eventually_within(Duration::from_secs(2), cond).await }

pub async fn eventually_within(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
