#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use lookout_core::ResourceKey;

pub fn cm(ns: &str, name: &str, rv: &str) -> Arc<ConfigMap> {
    Arc::new(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            resource_version: Some(rv.into()),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub fn labeled(ns: &str, name: &str, rv: &str, labels: &[(&str, &str)]) -> Arc<ConfigMap> {
    let mut obj = (*cm(ns, name, rv)).clone();
    obj.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>());
    Arc::new(obj)
}

pub fn key(ns: &str, name: &str) -> ResourceKey { ResourceKey::new(Some(ns), name) }

pub fn rv(obj: &ConfigMap) -> &str { obj.metadata.resource_version.as_deref().unwrap_or_default() }
