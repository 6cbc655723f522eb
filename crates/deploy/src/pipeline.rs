//! Stages shared by the rolling and blue-green pipelines.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use tern_core::{keys, kinds, ManagedWorkload, Release, Resource, ResourceId};
use tern_ops::{ClusterOps, PodInfo};
use tracing::{debug, info, warn};

use crate::context::PipelineContext;
use crate::error::{DeployError, DeployResult};
use crate::history::HistoryHandle;
use crate::Engine;

/// Retire old and failed releases and delete their versioned objects that no
/// remaining release still references. Returns warnings.
pub(crate) async fn retire_releases(engine: &Engine, handle: &mut HistoryHandle) -> Vec<String> {
    let retired = handle.history.cleanup(engine.config.max_releases);
    if retired.is_empty() {
        return Vec::new();
    }
    let live: FxHashSet<ResourceId> = handle.history.all_resource_ids().into_iter().collect();
    let mut doomed: Vec<ResourceId> = Vec::new();
    for rel in &retired {
        for id in &rel.versioned {
            if !live.contains(id) && !doomed.contains(id) {
                doomed.push(id.clone());
            }
        }
    }
    info!(retired = ?retired.iter().map(|r| r.number).collect::<Vec<_>>(), objects = doomed.len(), "retiring old releases");
    if doomed.is_empty() {
        return Vec::new();
    }
    kinds::sort_for_delete(&mut doomed);
    let report = engine.ops.delete(&doomed).await;
    report
        .failed
        .iter()
        .map(|(id, e)| {
            warn!(resource = %id, error = %e, "could not delete retired versioned object");
            format!("failed to delete retired {}: {}", id, e)
        })
        .collect()
}

/// After `number` succeeds, delete the suffix-versioned workloads of every other
/// release so only the new generation stays behind the service selectors.
/// Their specs stay in history for rollback. Returns warnings.
pub(crate) async fn retire_superseded(engine: &Engine, handle: &HistoryHandle, number: u32, current: &[ResourceId]) -> Vec<String> {
    let mut stale: Vec<ResourceId> = Vec::new();
    for rel in handle.history.releases.iter().filter(|r| r.number != number) {
        for id in rel.versioned_workloads() {
            if !current.contains(id) && !stale.contains(id) {
                stale.push(id.clone());
            }
        }
    }
    if stale.is_empty() {
        return Vec::new();
    }
    kinds::sort_for_delete(&mut stale);
    let report = engine.ops.delete(&stale).await;
    info!(number, deleted = report.deleted.len(), failed = report.failed.len(), "retired superseded workloads");
    report
        .failed
        .iter()
        .map(|(id, e)| {
            warn!(resource = %id, error = %e, "could not retire superseded workload");
            format!("failed to retire superseded {}: {}", id, e)
        })
        .collect()
}

pub(crate) fn release_selector(release_name: &str) -> BTreeMap<String, String> {
    let mut sel = BTreeMap::new();
    sel.insert(keys::RELEASE_NAME_LABEL.to_string(), release_name.to_string());
    sel
}

/// Names of pods carrying the release label before apply.
pub(crate) async fn pod_snapshot(ops: &dyn ClusterOps, ctx: &PipelineContext) -> FxHashSet<String> {
    match ops.list_pods(&ctx.namespace, &release_selector(&ctx.release_name)).await {
        Ok(pods) => pods.into_iter().map(|p| p.name).collect(),
        Err(e) => {
            warn!(release = %ctx.release_name, error = %format!("{:#}", e), "pre-apply pod listing failed");
            FxHashSet::default()
        }
    }
}

/// Pods after a deploy, flagged new when absent from `before`.
pub(crate) async fn tagged_pods(ops: &dyn ClusterOps, ctx: &PipelineContext, before: &FxHashSet<String>, warnings: &mut Vec<String>) -> Vec<PodInfo> {
    match ops.list_pods(&ctx.namespace, &release_selector(&ctx.release_name)).await {
        Ok(mut pods) => {
            for p in pods.iter_mut() {
                p.new_pod = !before.contains(&p.name);
            }
            let fresh = pods.iter().filter(|p| p.new_pod).count();
            info!(release = %ctx.release_name, pods = pods.len(), new = fresh, "pods after deploy");
            pods
        }
        Err(e) => {
            warnings.push(format!("could not list pods: {:#}", e));
            Vec::new()
        }
    }
}

/// Store ids, versioned ids and (optionally) full specs on a release.
pub(crate) fn record_manifest(rel: &mut Release, resources: &[Resource], keep_specs: bool) {
    rel.resources = resources.iter().map(|r| r.id.clone()).collect();
    rel.versioned = resources.iter().filter(|r| r.versioned).map(|r| r.id.clone()).collect();
    rel.specs = if keep_specs { Some(resources.to_vec()) } else { None };
}

/// Allocate (or reuse) the release entry for this run and persist it.
pub(crate) async fn open_release(handle: &mut HistoryHandle, number: u32, resources: &[Resource], keep_specs: bool) -> DeployResult<()> {
    match handle.history.get_mut(number) {
        Some(rel) => {
            debug!(number, "continuing release");
            record_manifest(rel, resources, keep_specs);
        }
        None if keep_specs => {
            handle.history.create_release_with_specs(resources);
        }
        None => {
            let rel = handle.history.create_release(resources.iter().map(|r| r.id.clone()).collect());
            rel.versioned = resources.iter().filter(|r| r.versioned).map(|r| r.id.clone()).collect();
        }
    }
    handle.checkpoint().await
}

/// Apply, record workload revisions, then wait for steady state.
pub(crate) async fn apply_and_verify(engine: &Engine, ctx: &PipelineContext, handle: &mut HistoryHandle, number: u32, resources: &[Resource]) -> DeployResult<()> {
    engine.ops.apply(resources, &ctx.namespace).await.map_err(|e| DeployError::Apply(format!("{:#}", e)))?;
    info!(release = %ctx.release_name, number, count = resources.len(), "applied");

    let managed: Vec<&Resource> = resources.iter().filter(|r| kinds::is_managed_workload(r)).collect();
    let custom: Vec<Resource> = resources.iter().filter(|r| kinds::is_custom_workload(r)).cloned().collect();
    if managed.is_empty() && custom.is_empty() {
        debug!(number, "no workloads to track");
        return Ok(());
    }
    let mut workloads = Vec::with_capacity(managed.len());
    for r in &managed {
        let revision = match engine.ops.latest_revision(&r.id).await {
            Ok(rev) => rev,
            Err(e) => {
                warn!(resource = %r.id, error = %format!("{:#}", e), "could not read revision");
                None
            }
        };
        debug!(resource = %r.id, revision = ?revision, "recorded revision");
        let spec = r.versioned.then(|| (*r).clone());
        workloads.push(ManagedWorkload { id: r.id.clone(), revision, spec });
    }
    let managed: Vec<ResourceId> = managed.iter().map(|r| r.id.clone()).collect();
    if let Some(rel) = handle.history.get_mut(number) {
        rel.managed_workloads = workloads;
        rel.custom_workloads = custom.clone();
    }
    handle.checkpoint().await?;

    if ctx.flags.skip_steady_state {
        info!(number, "steady-state check skipped");
        return Ok(());
    }
    if engine.poller().wait_for_all(&managed, &custom, ctx.timeout).await {
        Ok(())
    } else {
        Err(DeployError::SteadyState)
    }
}
