//! Restore the last successful release in place of the current one.
//!
//! Built-in workloads go back through the native undo primitive, or are
//! re-created from their stored spec when a later release retired them. Custom
//! workloads are deleted and re-applied from the target's stored specs. The
//! rolled-back release's own versioned workloads are deleted afterwards.
//! Rollback never allocates a release number.

use metrics::counter;
use tern_core::{kinds, Release, ReleaseStatus, Resource, ResourceId};
use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::error::{DeployError, DeployResult};
use crate::history::HistoryHandle;
use crate::{DeployOutput, Engine};

#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackRequest {
    /// Release being rolled back; `0` means the latest one.
    pub release_number: u32,
}

fn noop(reason: String) -> DeployResult<DeployOutput> {
    info!(reason = %reason, "rollback is a no-op");
    counter!("rollback_noop_total", 1u64);
    Ok(DeployOutput::noop(reason))
}

pub(crate) async fn run(engine: &Engine, ctx: &PipelineContext, req: RollbackRequest) -> DeployResult<DeployOutput> {
    let mut handle = HistoryHandle::load(engine.store.clone(), &ctx.namespace, &ctx.release_name).await?;
    let current = match (req.release_number, handle.history.latest()) {
        (_, None) => return noop(format!("no release history for {}", ctx.release_name)),
        (0, Some(latest)) if latest.status == ReleaseStatus::Succeeded => {
            return noop(format!("latest release {} succeeded, nothing to roll back", latest.number))
        }
        (0, Some(latest)) => latest.clone(),
        (n, Some(_)) => match handle.history.get(n) {
            Some(rel) => rel.clone(),
            None => return noop(format!("release {} not found in history", n)),
        },
    };
    let Some(target) = handle.history.previous_rollback_eligible(current.number).cloned() else {
        return noop(format!("no successful release before {}", current.number));
    };
    if !target.has_workloads() {
        return noop(format!("release {} has no workloads to restore", target.number));
    }
    info!(release = %ctx.release_name, from = current.number, to = target.number, "rolling back");

    if let Some(rel) = handle.history.get_mut(current.number) {
        if rel.status == ReleaseStatus::InProgress {
            rel.status = ReleaseStatus::Failed;
        }
    }

    let mut out = DeployOutput { release_number: Some(current.number), rolled_back_to: Some(target.number), ..DeployOutput::default() };
    match restore(engine, ctx, &current, &target, &mut out.warnings).await {
        Ok(revisions) => {
            if let Some(rel) = handle.history.get_mut(target.number) {
                for w in rel.managed_workloads.iter_mut() {
                    if let Some((_, rev)) = revisions.iter().find(|(id, _)| id == &w.id) {
                        w.revision = rev.clone();
                    }
                }
            }
            handle.checkpoint().await?;
            info!(release = %ctx.release_name, to = target.number, "rollback complete");
            Ok(out)
        }
        Err(e) => {
            if let Err(pe) = handle.checkpoint().await {
                warn!(release = %ctx.release_name, error = %pe, "could not persist history after failed rollback");
            }
            Err(e)
        }
    }
}

/// Returns the revisions read back from the cluster for the target's workloads.
async fn restore(engine: &Engine, ctx: &PipelineContext, current: &Release, target: &Release, warnings: &mut Vec<String>) -> DeployResult<Vec<(ResourceId, Option<String>)>> {
    for w in &target.managed_workloads {
        let live = engine.ops.get(&w.id).await.map_err(|e| DeployError::Rollback(format!("{}: {:#}", w.id, e)))?;
        if let (None, Some(spec)) = (&live, &w.spec) {
            engine.ops.apply(std::slice::from_ref(spec), &ctx.namespace).await.map_err(|e| DeployError::Rollback(format!("re-creating {}: {:#}", w.id, e)))?;
            info!(resource = %w.id, "re-created retired workload");
            continue;
        }
        let revision = w.revision.as_deref().ok_or_else(|| DeployError::Rollback(format!("no recorded revision for {}", w.id)))?;
        engine.ops.undo(&w.id, revision).await.map_err(|e| DeployError::Rollback(format!("{}: {:#}", w.id, e)))?;
        info!(resource = %w.id, revision = %revision, "undone");
    }

    if !current.custom_workloads.is_empty() || !target.custom_workloads.is_empty() {
        let ids: Vec<ResourceId> = current.custom_workloads.iter().map(|r| r.id.clone()).collect();
        let report = engine.ops.delete(&ids).await;
        if let Some((id, e)) = report.failed.first() {
            return Err(DeployError::Rollback(format!("deleting {}: {}", id, e)));
        }
        engine.ops.apply(&target.custom_workloads, &ctx.namespace).await.map_err(|e| DeployError::Rollback(format!("re-applying custom workloads: {:#}", e)))?;
        info!(count = target.custom_workloads.len(), "custom workloads restored");
    }

    if ctx.flags.prune {
        recreate_pruned(engine, ctx, current, target, warnings).await;
    }

    if !ctx.flags.skip_steady_state {
        let managed: Vec<ResourceId> = target.managed_workloads.iter().map(|w| w.id.clone()).collect();
        if !engine.poller().wait_for_all(&managed, &target.custom_workloads, ctx.timeout).await {
            return Err(DeployError::SteadyState);
        }
    }

    let retired = retire_rolled_back_workloads(engine, current, target).await?;
    if ctx.flags.prune {
        delete_new_resources(engine, current, target, &retired, warnings).await;
    }

    let mut revisions = Vec::with_capacity(target.managed_workloads.len());
    for w in &target.managed_workloads {
        match engine.ops.latest_revision(&w.id).await {
            Ok(rev) => revisions.push((w.id.clone(), rev)),
            Err(e) => warn!(resource = %w.id, error = %format!("{:#}", e), "could not re-read revision"),
        }
    }
    Ok(revisions)
}

/// Bring back what the current release pruned, from the target's snapshot.
async fn recreate_pruned(engine: &Engine, ctx: &PipelineContext, current: &Release, target: &Release, warnings: &mut Vec<String>) {
    if current.pruned.is_empty() {
        return;
    }
    let mut specs: Vec<Resource> = Vec::new();
    for id in &current.pruned {
        match target.spec_of(id) {
            Some(r) => specs.push(r.clone()),
            None => warnings.push(format!("cannot recreate pruned {}: no spec in release {}", id, target.number)),
        }
    }
    if specs.is_empty() {
        info!("no pruned resources to recreate");
        return;
    }
    kinds::sort_for_apply(&mut specs);
    match engine.ops.apply(&specs, &ctx.namespace).await {
        Ok(()) => info!(count = specs.len(), "recreated pruned resources"),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "recreating pruned resources failed");
            warnings.push(format!("failed to recreate pruned resources: {:#}", e));
        }
    }
}

/// Delete the rolled-back release's own suffix-versioned workloads so they stop
/// matching the service selectors. Runs regardless of pruning; a failure aborts.
async fn retire_rolled_back_workloads(engine: &Engine, current: &Release, target: &Release) -> DeployResult<Vec<ResourceId>> {
    let mut stale: Vec<ResourceId> = current.versioned_workloads().filter(|id| !target.resources.contains(id)).cloned().collect();
    if stale.is_empty() {
        return Ok(stale);
    }
    kinds::sort_for_delete(&mut stale);
    let report = engine.ops.delete(&stale).await;
    if let Some((id, e)) = report.failed.first() {
        return Err(DeployError::Rollback(format!("retiring {}: {}", id, e)));
    }
    info!(count = report.deleted.len(), from = current.number, "retired rolled-back workloads");
    Ok(stale)
}

/// Delete resources the current release introduced that the target never had.
async fn delete_new_resources(engine: &Engine, current: &Release, target: &Release, already: &[ResourceId], warnings: &mut Vec<String>) {
    let mut fresh: Vec<ResourceId> = current.resources.iter().filter(|id| !target.resources.contains(id) && !already.contains(id)).cloned().collect();
    if fresh.is_empty() {
        return;
    }
    kinds::sort_for_delete(&mut fresh);
    let report = engine.ops.delete(&fresh).await;
    info!(deleted = report.deleted.len(), failed = report.failed.len(), "removed resources introduced by the rolled-back release");
    for (id, e) in report.failed {
        warnings.push(format!("failed to delete {}: {}", id, e));
    }
}
