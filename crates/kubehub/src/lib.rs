//! Tern kubehub: shared client, discovery catalog and the cluster-side history store.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use once_cell::sync::OnceCell;
use tern_core::{keys, ResourceId};
use tern_persist::{HistoryStore, StoreError, StoreResult, StoredHistory};
use tracing::{debug, info};

/// Data key under which the history document is stored.
pub const HISTORY_KEY: &str = "release-history";

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Process-wide client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client")?;
    let _ = CLIENT.set(client.clone());
    Ok(client)
}

/// Served resources, resolved once per execution.
#[derive(Debug, Clone, Default)]
pub struct ApiCatalog {
    entries: Vec<(ApiResource, bool)>,
}

impl ApiCatalog {
    /// Discover served resources (incl. CRDs) using kube Discovery.
    pub async fn discover(client: Client) -> Result<Self> {
        let t0 = std::time::Instant::now();
        let discovery = Discovery::new(client).run().await.context("running discovery")?;
        let mut entries = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                entries.push((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
        info!(count = entries.len(), took_ms = %t0.elapsed().as_millis(), "discovery complete");
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<(ApiResource, bool)>) -> Self { Self { entries } }

    /// Resolve by `apiVersion` + kind, or by kind alone preferring the core
    /// group, then `apps`, then whatever was served first.
    pub fn resolve(&self, api_version: Option<&str>, kind: &str) -> Result<(ApiResource, bool)> {
        if let Some(av) = api_version {
            return self
                .entries
                .iter()
                .find(|(ar, _)| ar.api_version == av && ar.kind == kind)
                .cloned()
                .ok_or_else(|| anyhow!("kind not served: {}/{}", av, kind));
        }
        let mut candidates: Vec<&(ApiResource, bool)> = self.entries.iter().filter(|(ar, _)| ar.kind == kind).collect();
        candidates.sort_by_key(|(ar, _)| match ar.group.as_str() {
            "" => 0,
            "apps" => 1,
            _ => 2,
        });
        candidates.first().map(|e| (*e).clone()).ok_or_else(|| anyhow!("kind not served: {}", kind))
    }

    pub fn api(&self, client: Client, api_version: Option<&str>, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(api_version, kind)?;
        if namespaced {
            match namespace {
                Some(ns) => Ok(Api::namespaced_with(client, ns, &ar)),
                None => Err(anyhow!("namespace required for namespaced kind {}", kind)),
            }
        } else {
            Ok(Api::all_with(client, &ar))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryObject {
    ConfigMap,
    Secret,
}

/// History stored in a ConfigMap or Secret named after the release, in the release namespace.
/// The object's `resourceVersion` is the write token.
pub struct ClusterHistoryStore {
    client: Client,
    object: HistoryObject,
}

impl ClusterHistoryStore {
    pub fn new(client: Client, object: HistoryObject) -> Self { Self { client, object } }

    fn meta(name: &str, namespace: &str, resource_version: Option<&str>) -> ObjectMeta {
        let mut labels = BTreeMap::new();
        labels.insert(keys::RELEASE_NAME_LABEL.to_string(), name.to_string());
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            resource_version: resource_version.map(|s| s.to_string()),
            ..Default::default()
        }
    }
}

fn map_write_err(e: kube::Error, namespace: &str, name: &str, expected: Option<&str>) -> StoreError {
    match e {
        // 409 covers both AlreadyExists on create and a stale resourceVersion on replace
        kube::Error::Api(ae) if ae.code == 409 => {
            metrics::counter!("history_conflict_total", 1u64);
            StoreError::Conflict { namespace: namespace.to_string(), name: name.to_string(), expected: expected.map(|s| s.to_string()) }
        }
        other => StoreError::Backend(anyhow!("writing history {}/{}: {}", namespace, name, other)),
    }
}

#[async_trait::async_trait]
impl HistoryStore for ClusterHistoryStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<StoredHistory>> {
        let found = match self.object {
            HistoryObject::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                api.get_opt(name).await.context("reading history ConfigMap")?.map(|cm| {
                    let blob = cm.data.and_then(|mut d| d.remove(HISTORY_KEY)).unwrap_or_default();
                    (blob, cm.metadata.resource_version)
                })
            }
            HistoryObject::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                api.get_opt(name).await.context("reading history Secret")?.map(|s| {
                    let blob = s
                        .data
                        .and_then(|mut d| d.remove(HISTORY_KEY))
                        .map(|b| String::from_utf8_lossy(&b.0).to_string())
                        .unwrap_or_default();
                    (blob, s.metadata.resource_version)
                })
            }
        };
        debug!(ns = %namespace, release = %name, found = found.is_some(), "history read");
        Ok(found.map(|(blob, rv)| StoredHistory { blob, version: rv.unwrap_or_default() }))
    }

    async fn put(&self, namespace: &str, name: &str, blob: &str, expected: Option<&str>) -> StoreResult<String> {
        let pp = PostParams::default();
        let meta = Self::meta(name, namespace, expected);
        let written_rv = match self.object {
            HistoryObject::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let mut data = BTreeMap::new();
                data.insert(HISTORY_KEY.to_string(), blob.to_string());
                let cm = ConfigMap { metadata: meta, data: Some(data), ..Default::default() };
                let res = match expected {
                    None => api.create(&pp, &cm).await,
                    Some(_) => api.replace(name, &pp, &cm).await,
                };
                res.map_err(|e| map_write_err(e, namespace, name, expected))?.metadata.resource_version
            }
            HistoryObject::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let mut data = BTreeMap::new();
                data.insert(HISTORY_KEY.to_string(), ByteString(blob.as_bytes().to_vec()));
                let secret = Secret { metadata: meta, data: Some(data), ..Default::default() };
                let res = match expected {
                    None => api.create(&pp, &secret).await,
                    Some(_) => api.replace(name, &pp, &secret).await,
                };
                res.map_err(|e| map_write_err(e, namespace, name, expected))?.metadata.resource_version
            }
        };
        metrics::counter!("history_put_total", 1u64);
        written_rv.ok_or_else(|| StoreError::Backend(anyhow!("history {}/{} written without resourceVersion", namespace, name)))
    }

    fn backing_object(&self, namespace: &str, name: &str) -> Option<ResourceId> {
        let kind = match self.object {
            HistoryObject::ConfigMap => "ConfigMap",
            HistoryObject::Secret => "Secret",
        };
        Some(ResourceId::new(kind, name, Some(namespace)))
    }
}
