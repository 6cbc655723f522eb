//! In-memory cluster for pipeline tests and dry runs.
//!
//! Built-in workloads get a revision counter bumped on every apply (and on undo,
//! as the real controllers do). Each workload owns one synthetic pod per revision.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value as Json;
use tern_core::{kinds, Resource, ResourceId};

use crate::{ClusterOps, ContainerInfo, DeleteReport, PodInfo};

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceId, Json>,
    revisions: HashMap<ResourceId, u64>,
    templates: HashMap<(ResourceId, u64), Json>,
    pods: Vec<PodInfo>,
    fail_apply: HashSet<String>,
    fail_delete: HashSet<String>,
    fail_undo: HashSet<String>,
    not_ready: HashSet<String>,
    applied: Vec<ResourceId>,
    deleted: Vec<ResourceId>,
    undone: Vec<(ResourceId, String)>,
}

#[derive(Default)]
pub struct MockOps {
    state: Mutex<State>,
}

impl MockOps {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| anyhow!("mock cluster poisoned"))
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        f(&mut guard)
    }

    /// Seed or overwrite a live object.
    pub fn put_object(&self, id: ResourceId, obj: Json) {
        self.with(|s| { s.objects.insert(id, obj); });
    }

    pub fn object(&self, id: &ResourceId) -> Option<Json> {
        self.with(|s| s.objects.get(id).cloned())
    }

    pub fn exists(&self, id: &ResourceId) -> bool {
        self.with(|s| s.objects.contains_key(id))
    }

    pub fn object_ids(&self) -> Vec<ResourceId> {
        self.with(|s| s.objects.keys().cloned().collect())
    }

    pub fn revision(&self, id: &ResourceId) -> Option<u64> {
        self.with(|s| s.revisions.get(id).copied())
    }

    /// Applies of resources with this name fail.
    pub fn fail_apply_of(&self, name: &str) { self.with(|s| { s.fail_apply.insert(name.to_string()); }); }
    pub fn fail_delete_of(&self, name: &str) { self.with(|s| { s.fail_delete.insert(name.to_string()); }); }
    pub fn fail_undo_of(&self, name: &str) { self.with(|s| { s.fail_undo.insert(name.to_string()); }); }
    /// Rollout status for this workload name reports not ready.
    pub fn never_ready(&self, name: &str) { self.with(|s| { s.not_ready.insert(name.to_string()); }); }

    pub fn clear_failures(&self) {
        self.with(|s| {
            s.fail_apply.clear();
            s.fail_delete.clear();
            s.fail_undo.clear();
            s.not_ready.clear();
        });
    }

    pub fn applied(&self) -> Vec<ResourceId> { self.with(|s| s.applied.clone()) }
    pub fn deleted(&self) -> Vec<ResourceId> { self.with(|s| s.deleted.clone()) }
    pub fn undone(&self) -> Vec<(ResourceId, String)> { self.with(|s| s.undone.clone()) }

    pub fn reset_logs(&self) {
        self.with(|s| {
            s.applied.clear();
            s.deleted.clear();
            s.undone.clear();
        });
    }

    fn spawn_pod(s: &mut State, id: &ResourceId, template: &Json, rev: u64) {
        let labels: BTreeMap<String, String> = template
            .pointer("/metadata/labels")
            .and_then(|l| l.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
            .unwrap_or_default();
        let containers = template
            .pointer("/spec/containers")
            .and_then(|c| c.as_array())
            .map(|cs| {
                cs.iter()
                    .map(|c| ContainerInfo {
                        name: c.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        image: c.get("image").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let owner = id.to_string();
        s.pods.retain(|p| p.labels.get("mock/owner") != Some(&owner));
        let mut labels = labels;
        labels.insert("mock/owner".to_string(), owner);
        s.pods.push(PodInfo {
            name: format!("{}-r{}", id.name, rev),
            namespace: id.namespace.clone().unwrap_or_default(),
            uid: None,
            ip: None,
            phase: Some("Running".into()),
            containers,
            labels,
            new_pod: false,
        });
    }
}

#[async_trait::async_trait]
impl ClusterOps for MockOps {
    async fn apply(&self, resources: &[Resource], namespace: &str) -> Result<()> {
        let mut s = self.lock()?;
        let mut failures = Vec::new();
        for r in resources {
            if s.fail_apply.contains(r.name()) {
                failures.push(r.id.to_string());
                continue;
            }
            let mut id = r.id.clone();
            if id.namespace.is_none() && !kinds::is_cluster_scoped(&id.kind) {
                id.namespace = Some(namespace.to_string());
            }
            s.objects.insert(id.clone(), r.spec.clone());
            s.applied.push(id.clone());
            if kinds::MANAGED_WORKLOAD_KINDS.contains(&id.kind.as_str()) {
                let rev = s.revisions.get(&id).copied().unwrap_or(0) + 1;
                s.revisions.insert(id.clone(), rev);
                let template = r.spec.pointer("/spec/template").cloned().unwrap_or(Json::Null);
                s.templates.insert((id.clone(), rev), template.clone());
                Self::spawn_pod(&mut s, &id, &template, rev);
            }
        }
        if failures.is_empty() { Ok(()) } else { Err(anyhow!("apply failed for {}", failures.join(", "))) }
    }

    async fn delete(&self, ids: &[ResourceId]) -> DeleteReport {
        let mut report = DeleteReport::default();
        self.with(|s| {
            for id in ids {
                if s.fail_delete.contains(&id.name) {
                    report.failed.push((id.clone(), "injected delete failure".into()));
                    continue;
                }
                s.objects.remove(id);
                let owner = id.to_string();
                s.pods.retain(|p| p.labels.get("mock/owner") != Some(&owner));
                s.deleted.push(id.clone());
                report.deleted.push(id.clone());
            }
        });
        report
    }

    async fn rollout_status(&self, id: &ResourceId, _timeout: Duration) -> Result<bool> {
        let s = self.lock()?;
        Ok(s.objects.contains_key(id) && !s.not_ready.contains(&id.name))
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<Json>> {
        Ok(self.lock()?.objects.get(id).cloned())
    }

    async fn latest_revision(&self, id: &ResourceId) -> Result<Option<String>> {
        Ok(self.lock()?.revisions.get(id).map(|r| r.to_string()))
    }

    async fn undo(&self, id: &ResourceId, revision: &str) -> Result<()> {
        let mut s = self.lock()?;
        if s.fail_undo.contains(&id.name) {
            return Err(anyhow!("injected undo failure for {}", id));
        }
        let rev: u64 = revision.parse().map_err(|_| anyhow!("revision {} is not numeric", revision))?;
        let template = s.templates.get(&(id.clone(), rev)).cloned().ok_or_else(|| anyhow!("revision {} of {} not found", revision, id))?;
        let obj = s.objects.get_mut(id).ok_or_else(|| anyhow!("{} not found", id))?;
        if let Some(spec) = obj.get_mut("spec").and_then(|v| v.as_object_mut()) {
            spec.insert("template".into(), template.clone());
        }
        let next = s.revisions.get(id).copied().unwrap_or(0) + 1;
        s.revisions.insert(id.clone(), next);
        s.templates.insert((id.clone(), next), template.clone());
        Self::spawn_pod(&mut s, id, &template, next);
        s.undone.push((id.clone(), revision.to_string()));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<PodInfo>> {
        let s = self.lock()?;
        Ok(s.pods
            .iter()
            .filter(|p| p.namespace == namespace && selector.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str, image: &str) -> Resource {
        let doc = serde_json::json!({
            "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": name},
            "spec": {"template": {"metadata": {"labels": {"app": name}}, "spec": {"containers": [{"name": "main", "image": image}]}}}
        });
        Resource::from_json(doc, Some("ns")).unwrap()
    }

    #[tokio::test]
    async fn apply_bumps_revision_and_undo_restores_template() {
        let ops = MockOps::new();
        let d1 = deployment("web", "nginx:1");
        ops.apply(&[d1.clone()], "ns").await.unwrap();
        ops.apply(&[deployment("web", "nginx:2")], "ns").await.unwrap();
        assert_eq!(ops.latest_revision(&d1.id).await.unwrap().as_deref(), Some("2"));

        ops.undo(&d1.id, "1").await.unwrap();
        assert_eq!(ops.revision(&d1.id), Some(3));
        let live = ops.get(&d1.id).await.unwrap().unwrap();
        assert_eq!(live["spec"]["template"]["spec"]["containers"][0]["image"], "nginx:1");

        let mut sel = BTreeMap::new();
        sel.insert("app".to_string(), "web".to_string());
        let pods = ops.list_pods("ns", &sel).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name, "web-r3");
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let ops = MockOps::new();
        let d = deployment("web", "nginx:1");
        ops.fail_apply_of("web");
        assert!(ops.apply(&[d.clone()], "ns").await.is_err());
        ops.clear_failures();
        ops.apply(&[d.clone()], "ns").await.unwrap();
        ops.never_ready("web");
        assert!(!ops.rollout_status(&d.id, Duration::from_secs(1)).await.unwrap());
        ops.fail_delete_of("web");
        let report = ops.delete(&[d.id.clone()]).await;
        assert_eq!(report.failed.len(), 1);
        assert!(ops.exists(&d.id));
    }
}
