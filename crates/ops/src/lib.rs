//! Tern Ops: the cluster command executor used by every deployment pipeline.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::{ControllerRevision, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tern_core::{Resource, ResourceId};
use tern_kubehub::ApiCatalog;
use tracing::{debug, info, warn};

pub mod mock;
pub mod rollout;

pub use rollout::RolloutState;

const DEPLOYMENT_REVISION: &str = "deployment.kubernetes.io/revision";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
}

/// Pod as reported back to callers after a deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub ip: Option<String>,
    pub phase: Option<String>,
    pub containers: Vec<ContainerInfo>,
    pub labels: BTreeMap<String, String>,
    /// Absent from the pre-apply snapshot.
    #[serde(default)]
    pub new_pod: bool,
}

/// Outcome of a batch delete. Missing objects count as deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub deleted: Vec<ResourceId>,
    pub failed: Vec<(ResourceId, String)>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool { self.failed.is_empty() }
}

/// Imperative cluster operations. Implementations must not panic on cluster errors.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    /// Apply every resource in order; fails if any single apply fails.
    async fn apply(&self, resources: &[Resource], namespace: &str) -> Result<()>;

    /// Delete in the given order, continuing past failures.
    async fn delete(&self, ids: &[ResourceId]) -> DeleteReport;

    /// Wait for a built-in workload rollout. Timeout and rollout failure are `Ok(false)`.
    async fn rollout_status(&self, id: &ResourceId, timeout: Duration) -> Result<bool>;

    /// Live object, `None` when absent.
    async fn get(&self, id: &ResourceId) -> Result<Option<Json>>;

    async fn latest_revision(&self, id: &ResourceId) -> Result<Option<String>>;

    /// Roll a built-in workload back to a recorded revision.
    async fn undo(&self, id: &ResourceId, revision: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<PodInfo>>;
}

pub fn label_selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Default implementation using kube-rs client APIs.
pub struct KubeOps {
    client: Client,
    catalog: ApiCatalog,
    field_manager: String,
    poll_interval: Duration,
}

impl KubeOps {
    pub fn new(client: Client, catalog: ApiCatalog, field_manager: &str, poll_interval: Duration) -> Self {
        Self { client, catalog, field_manager: field_manager.to_string(), poll_interval }
    }

    /// Connect with the shared client and run discovery once.
    pub async fn connect(field_manager: &str, poll_interval: Duration) -> Result<Self> {
        let client = tern_kubehub::get_kube_client().await?;
        let catalog = ApiCatalog::discover(client.clone()).await?;
        Ok(Self::new(client, catalog, field_manager, poll_interval))
    }

    fn api_for(&self, id: &ResourceId) -> Result<Api<DynamicObject>> {
        self.catalog.api(self.client.clone(), None, &id.kind, id.namespace.as_deref())
    }

    fn namespace_of(id: &ResourceId) -> Result<&str> {
        id.namespace.as_deref().ok_or_else(|| anyhow!("{} has no namespace", id))
    }

    async fn live_json(&self, id: &ResourceId) -> Result<Option<Json>> {
        let api = self.api_for(id)?;
        match api.get_opt(&id.name).await.with_context(|| format!("reading {}", id))? {
            Some(obj) => Ok(Some(serde_json::to_value(&obj)?)),
            None => Ok(None),
        }
    }

    async fn live_uid(&self, id: &ResourceId) -> Result<String> {
        let live = self.live_json(id).await?.ok_or_else(|| anyhow!("{} not found", id))?;
        live.pointer("/metadata/uid").and_then(|u| u.as_str()).map(|s| s.to_string()).ok_or_else(|| anyhow!("{} missing metadata.uid", id))
    }

    async fn owned_controller_revisions(&self, id: &ResourceId) -> Result<Vec<ControllerRevision>> {
        let ns = Self::namespace_of(id)?;
        let uid = self.live_uid(id).await?;
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), ns);
        let list = api.list(&ListParams::default()).await.context("listing controller revisions")?;
        Ok(list.items.into_iter().filter(|cr| owned_by(&cr.metadata, &uid)).collect())
    }

    /// Replace `spec.template` on the live object with `template`.
    async fn replace_template(&self, id: &ResourceId, template: Json) -> Result<()> {
        let api = self.api_for(id)?;
        let live = api.get(&id.name).await.with_context(|| format!("reading {}", id))?;
        let mut doc = serde_json::to_value(&live)?;
        if let Some(spec) = doc.get_mut("spec").and_then(|s| s.as_object_mut()) {
            spec.insert("template".into(), template);
        } else {
            return Err(anyhow!("{} has no spec", id));
        }
        let obj: DynamicObject = serde_json::from_value(doc).context("rebuilding object")?;
        api.replace(&id.name, &PostParams::default(), &obj).await.with_context(|| format!("replacing template of {}", id))?;
        Ok(())
    }
}

fn owned_by(meta: &kube::api::ObjectMeta, uid: &str) -> bool {
    meta.owner_references.as_ref().map(|ors| ors.iter().any(|o| o.uid == uid)).unwrap_or(false)
}

#[async_trait::async_trait]
impl ClusterOps for KubeOps {
    async fn apply(&self, resources: &[Resource], namespace: &str) -> Result<()> {
        let mut failures = Vec::new();
        for r in resources {
            let ns = r.id.namespace.as_deref().or(Some(namespace));
            let api = match self.catalog.api(self.client.clone(), Some(r.api_version.as_str()), r.kind(), ns) {
                Ok(a) => a,
                Err(e) => { failures.push(format!("{}: {}", r.id, e)); continue; }
            };
            match tern_apply::apply_object(&api, r, &self.field_manager).await {
                Ok(res) => info!(resource = %r.id, created = res.created, adds = res.summary.adds, updates = res.summary.updates, removes = res.summary.removes, "applied"),
                Err(e) => failures.push(format!("{}: {:#}", r.id, e)),
            }
        }
        if failures.is_empty() { Ok(()) } else { Err(anyhow!("apply failed for {} resource(s): {}", failures.len(), failures.join("; "))) }
    }

    async fn delete(&self, ids: &[ResourceId]) -> DeleteReport {
        let mut report = DeleteReport::default();
        let dp = DeleteParams::background();
        for id in ids {
            let api = match self.api_for(id) {
                Ok(a) => a,
                Err(e) => { report.failed.push((id.clone(), e.to_string())); continue; }
            };
            match api.delete(&id.name, &dp).await {
                Ok(_) => report.deleted.push(id.clone()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(resource = %id, "already absent");
                    report.deleted.push(id.clone());
                }
                Err(e) => {
                    warn!(resource = %id, error = %e, "delete failed");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }
        counter!("delete_total", report.deleted.len() as u64);
        report
    }

    async fn rollout_status(&self, id: &ResourceId, timeout: Duration) -> Result<bool> {
        let t0 = Instant::now();
        let deadline = t0 + timeout;
        loop {
            let state = match self.live_json(id).await? {
                Some(obj) => rollout::evaluate(&id.kind, &obj),
                None => RolloutState::Progressing("object not found yet".into()),
            };
            match state {
                RolloutState::Ready => {
                    histogram!("rollout_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    info!(resource = %id, took_ms = %t0.elapsed().as_millis(), "rollout complete");
                    return Ok(true);
                }
                RolloutState::Failed(msg) => {
                    warn!(resource = %id, reason = %msg, "rollout failed");
                    return Ok(false);
                }
                RolloutState::Progressing(msg) => debug!(resource = %id, status = %msg, "rollout progressing"),
            }
            if Instant::now() >= deadline {
                warn!(resource = %id, timeout_s = timeout.as_secs(), "rollout status timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<Json>> {
        self.live_json(id).await
    }

    async fn latest_revision(&self, id: &ResourceId) -> Result<Option<String>> {
        match id.kind.as_str() {
            "Deployment" => Ok(self
                .live_json(id)
                .await?
                .and_then(|o| o.pointer("/metadata/annotations").and_then(|a| a.get(DEPLOYMENT_REVISION)).and_then(|v| v.as_str()).map(|s| s.to_string()))),
            "DeploymentConfig" => Ok(self.live_json(id).await?.and_then(|o| o.pointer("/status/latestVersion").and_then(|v| v.as_i64())).map(|v| v.to_string())),
            "StatefulSet" | "DaemonSet" => {
                let revs = self.owned_controller_revisions(id).await?;
                Ok(revs.iter().map(|cr| cr.revision).max().map(|r| r.to_string()))
            }
            other => Err(anyhow!("{} has no native revision history", other)),
        }
    }

    async fn undo(&self, id: &ResourceId, revision: &str) -> Result<()> {
        let ns = Self::namespace_of(id)?;
        info!(resource = %id, revision = %revision, "rolling back");
        match id.kind.as_str() {
            "Deployment" => {
                let uid = self.live_uid(id).await?;
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), ns);
                let rss = api.list(&ListParams::default()).await.context("listing replica sets")?;
                let rs = rss
                    .items
                    .into_iter()
                    .filter(|rs| owned_by(&rs.metadata, &uid))
                    .find(|rs| rs.metadata.annotations.as_ref().and_then(|a| a.get(DEPLOYMENT_REVISION)).map(|r| r == revision).unwrap_or(false))
                    .ok_or_else(|| anyhow!("revision {} of {} not found", revision, id))?;
                let mut template = serde_json::to_value(rs.spec.and_then(|s| s.template).ok_or_else(|| anyhow!("replica set for revision {} has no template", revision))?)?;
                if let Some(labels) = template.pointer_mut("/metadata/labels").and_then(|l| l.as_object_mut()) {
                    labels.remove("pod-template-hash");
                }
                self.replace_template(id, template).await
            }
            "StatefulSet" | "DaemonSet" => {
                let want: i64 = revision.parse().with_context(|| format!("revision {} is not numeric", revision))?;
                let cr = self
                    .owned_controller_revisions(id)
                    .await?
                    .into_iter()
                    .find(|cr| cr.revision == want)
                    .ok_or_else(|| anyhow!("revision {} of {} not found", revision, id))?;
                let data = cr.data.map(|d| d.0).ok_or_else(|| anyhow!("controller revision {} has no data", revision))?;
                let api = self.api_for(id)?;
                api.patch(&id.name, &PatchParams::default(), &Patch::Strategic(&data)).await.with_context(|| format!("patching {}", id))?;
                Ok(())
            }
            "DeploymentConfig" => {
                // Each DeploymentConfig revision is a ReplicationController named <dc>-<n>
                let rc_id = ResourceId::new("ReplicationController", format!("{}-{}", id.name, revision), Some(ns));
                let rc = self.live_json(&rc_id).await?.ok_or_else(|| anyhow!("revision {} of {} not found", revision, id))?;
                let template = rc.pointer("/spec/template").cloned().ok_or_else(|| anyhow!("{} has no template", rc_id))?;
                self.replace_template(id, template).await
            }
            other => Err(anyhow!("undo is not supported for {}", other)),
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&label_selector_string(selector));
        let pods = api.list(&lp).await.context("listing pods")?;
        Ok(pods.items.into_iter().map(|p| pod_info(p, namespace)).collect())
    }
}

fn pod_info(p: Pod, namespace: &str) -> PodInfo {
    let containers = p
        .spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| ContainerInfo { name: c.name.clone(), image: c.image.clone().unwrap_or_default() }).collect())
        .unwrap_or_default();
    PodInfo {
        name: p.metadata.name.clone().unwrap_or_default(),
        namespace: p.metadata.namespace.clone().unwrap_or_else(|| namespace.to_string()),
        uid: p.metadata.uid.clone(),
        ip: p.status.as_ref().and_then(|s| s.pod_ip.clone()),
        phase: p.status.as_ref().and_then(|s| s.phase.clone()),
        containers,
        labels: p.metadata.labels.clone().unwrap_or_default(),
        new_pod: false,
    }
}
