//! Lookout kubehub: a [`ListWatch`] source backed by the Kubernetes API, plus GVK resolution
//! for dynamic objects.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    error::ErrorResponse,
    Client,
};
use lookout_core::{FieldSelector, InformerConfig, LabelSelector, ListPage, ListWatch, Object, ResourceVersion, SourceError, WatchEvent, WatchStream};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

// Server caps watch timeouts just under five minutes.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// List/watch over one `Api<K>`, optionally narrowed by server-side selectors.
pub struct KubeSource<K> {
    api: Api<K>,
    labels: Option<String>,
    fields: Option<String>,
    page_size: u32,
    watch_timeout_secs: u32,
}

impl<K> KubeSource<K>
where
    K: Object + DeserializeOwned + Debug,
{
    pub fn new(api: Api<K>) -> Self {
        let cfg = InformerConfig::default();
        Self { api, labels: None, fields: None, page_size: cfg.list_page_size, watch_timeout_secs: cfg.watch_timeout_secs }
    }

    pub fn with_config(mut self, cfg: &InformerConfig) -> Self {
        self.page_size = cfg.list_page_size;
        self.watch_timeout_secs = cfg.watch_timeout_secs;
        self
    }

    pub fn with_labels(mut self, selector: &LabelSelector) -> Self {
        self.labels = (!selector.is_everything()).then(|| selector.to_string());
        self
    }

    pub fn with_fields(mut self, selector: &FieldSelector) -> Self {
        self.fields = (!selector.is_everything()).then(|| selector.to_string());
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = &self.labels {
            lp = lp.labels(l);
        }
        if let Some(f) = &self.fields {
            lp = lp.fields(f);
        }
        if self.page_size > 0 {
            lp = lp.limit(self.page_size);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(self.watch_timeout_secs.clamp(1, MAX_WATCH_TIMEOUT_SECS));
        if let Some(l) = &self.labels {
            wp = wp.labels(l);
        }
        if let Some(f) = &self.fields {
            wp = wp.fields(f);
        }
        wp
    }
}

#[async_trait]
impl<K> ListWatch<K> for KubeSource<K>
where
    K: Object + DeserializeOwned + Debug,
{
    async fn list(&self) -> Result<ListPage<K>, SourceError> {
        let mut items = Vec::new();
        let mut cont: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let mut lp = self.list_params();
            if let Some(c) = &cont {
                lp = lp.continue_token(c);
            }
            let page = self.api.list(&lp).await.map_err(classify)?;
            pages += 1;
            items.extend(page.items);
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(c) => cont = Some(c),
                None => {
                    let rv = page.metadata.resource_version.unwrap_or_default();
                    debug!(items = items.len(), pages, rv = %rv, "kube: list done");
                    return Ok(ListPage { items, resource_version: ResourceVersion::new(rv) });
                }
            }
        }
    }

    async fn watch(&self, since: &ResourceVersion) -> Result<WatchStream<K>, SourceError> {
        let stream = self.api.watch(&self.watch_params(), since.as_str()).await.map_err(classify)?;
        Ok(stream.map_err(classify).and_then(|ev| futures::future::ready(convert(ev))).boxed())
    }
}

fn convert<K>(ev: KubeEvent<K>) -> Result<WatchEvent<K>, SourceError> {
    match ev {
        KubeEvent::Added(o) => Ok(WatchEvent::Added(o)),
        KubeEvent::Modified(o) => Ok(WatchEvent::Modified(o)),
        KubeEvent::Deleted(o) => Ok(WatchEvent::Deleted(o)),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(ResourceVersion::new(b.metadata.resource_version))),
        KubeEvent::Error(resp) => Err(classify_response(resp)),
    }
}

/// 410 Gone means the requested version was compacted away; 401/403 will not fix themselves.
pub fn classify_response(resp: ErrorResponse) -> SourceError {
    let msg = format!("{} ({}): {}", resp.reason, resp.code, resp.message);
    match resp.code {
        410 => SourceError::CheckpointExpired(msg),
        401 | 403 => SourceError::Auth(msg),
        _ => SourceError::Transient(msg),
    }
}

pub fn classify(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => classify_response(resp),
        other => SourceError::Transient(other.to_string()),
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Source for any served kind, resolved through discovery. `namespace` narrows namespaced
/// kinds and is ignored for cluster-scoped ones.
pub async fn dynamic_source(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<KubeSource<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kube: source ready");
    Ok(KubeSource::new(api))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(code: u16) -> ErrorResponse {
        ErrorResponse { status: "Failure".into(), message: "nope".into(), reason: "Test".into(), code }
    }

    #[test]
    fn status_codes_map_to_source_errors() {
        assert!(matches!(classify_response(resp(410)), SourceError::CheckpointExpired(_)));
        assert!(matches!(classify_response(resp(401)), SourceError::Auth(_)));
        assert!(matches!(classify_response(resp(403)), SourceError::Auth(_)));
        assert!(matches!(classify_response(resp(500)), SourceError::Transient(_)));
        assert!(matches!(classify_response(resp(429)), SourceError::Transient(_)));
        assert!(matches!(classify(kube::Error::Api(resp(410))), SourceError::CheckpointExpired(_)));
    }

    #[test]
    fn watch_error_event_is_classified() {
        let ev: KubeEvent<DynamicObject> = KubeEvent::Error(resp(410));
        assert!(matches!(convert(ev), Err(SourceError::CheckpointExpired(_))));
    }

    #[test]
    fn gvk_keys() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert!(parse_gvk_key("ConfigMap").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }
}
