use tern_core::{kinds, versioning, Resource, ReleaseStatus};
use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::error::{DeployResult, ValidationError};
use crate::history::HistoryHandle;
use crate::{pipeline, prune, steady, DeployOutput, Engine};

#[derive(Debug, Clone)]
pub struct RollingRequest {
    pub resources: Vec<Resource>,
    /// Reuse the latest release number when that release is still in progress
    /// (multi-phase deploys) instead of allocating a new one.
    pub continue_latest: bool,
}

impl RollingRequest {
    pub fn new(resources: Vec<Resource>) -> Self { Self { resources, continue_latest: false } }
}

pub(crate) async fn run(engine: &Engine, ctx: &PipelineContext, req: RollingRequest) -> DeployResult<DeployOutput> {
    let mut resources = req.resources;
    if resources.is_empty() {
        return Err(ValidationError::EmptyManifests.into());
    }
    if !ctx.flags.skip_steady_state {
        let custom: Vec<Resource> = resources.iter().filter(|r| kinds::is_custom_workload(r)).cloned().collect();
        steady::validate_steady_state_declared(&custom)?;
    }

    let mut handle = HistoryHandle::load(engine.store.clone(), &ctx.namespace, &ctx.release_name).await?;
    let mut out = DeployOutput::default();
    out.warnings.extend(pipeline::retire_releases(engine, &mut handle).await);

    let number = match handle.history.latest() {
        Some(latest) if req.continue_latest && latest.status == ReleaseStatus::InProgress => latest.number,
        _ => handle.history.next_number(),
    };
    info!(release = %ctx.release_name, number, resources = resources.len(), "rolling deploy");

    if ctx.flags.versioning {
        versioning::mark_versioned(&mut resources);
        for (old, new) in versioning::add_revision_suffix(&mut resources, number) {
            info!(from = %old, to = %new, "versioned");
        }
    }
    versioning::label_pod_spec(&mut resources, &ctx.release_name, None);
    kinds::sort_for_apply(&mut resources);

    let before = pipeline::pod_snapshot(engine.ops.as_ref(), ctx).await;
    pipeline::open_release(&mut handle, number, &resources, ctx.flags.prune).await?;

    let res = pipeline::apply_and_verify(engine, ctx, &mut handle, number, &resources).await;
    handle.settle(Some(number), res).await?;

    handle.mark_succeeded(number).await?;
    info!(release = %ctx.release_name, number, "release succeeded");

    let current: Vec<_> = resources.iter().map(|r| r.id.clone()).collect();
    out.warnings.extend(pipeline::retire_superseded(engine, &handle, number, &current).await);

    if ctx.flags.prune {
        let previous = handle.history.previous_rollback_eligible(number).cloned();
        let outcome = prune::prune(engine.ops.as_ref(), previous.as_ref(), &current, false).await;
        out.warnings.extend(outcome.warnings);
        if !outcome.deleted.is_empty() {
            if let Some(rel) = handle.history.get_mut(number) {
                rel.pruned = outcome.deleted.clone();
            }
            if let Err(e) = handle.checkpoint().await {
                warn!(number, error = %e, "could not record pruned resources");
                out.warnings.push(format!("pruned ids not recorded: {}", e));
            }
        }
        out.pruned = outcome.deleted;
    }

    out.pods = pipeline::tagged_pods(engine.ops.as_ref(), ctx, &before, &mut out.warnings).await;
    out.release_number = Some(number);
    Ok(out)
}
