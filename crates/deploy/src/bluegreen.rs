//! Blue-green: one workload per color behind a primary and a stage Service.
//!
//! The color serving production is read from the live primary Service's
//! selector on every run. The new workload and the stage Service get the
//! opposite color; after steady state the two Services swap selectors.

use serde_json::Value as Json;
use tern_core::{keys, kinds, versioning, Color, Resource};
use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::error::{DeployError, DeployResult, Resolution, ServiceRole, ValidationError, WorkloadCount};
use crate::history::HistoryHandle;
use crate::{pipeline, prune, steady, DeployOutput, Engine};

#[derive(Debug, Clone)]
pub struct BlueGreenRequest {
    pub resources: Vec<Resource>,
    /// Leave the primary Service on the old color after the new one is steady.
    pub skip_cutover: bool,
}

impl BlueGreenRequest {
    pub fn new(resources: Vec<Resource>) -> Self { Self { resources, skip_cutover: false } }
}

/// Index of the primary Service: the one annotated primary, else the single
/// non-stage Service (narrowed to managed ones when any are marked).
pub fn resolve_primary(resources: &[Resource]) -> Result<usize, ValidationError> {
    let services: Vec<usize> = (0..resources.len()).filter(|&i| resources[i].kind() == "Service").collect();
    let marked: Vec<usize> = services.iter().copied().filter(|&i| resources[i].annotation_is_true(keys::PRIMARY_SERVICE)).collect();
    match marked.len() {
        1 => return Ok(marked[0]),
        0 => {}
        _ => return Err(ValidationError::Service { role: ServiceRole::Primary, reason: Resolution::MultipleFound }),
    }
    let unmarked: Vec<usize> = services.into_iter().filter(|&i| !resources[i].annotation_is_true(keys::STAGE_SERVICE)).collect();
    let managed: Vec<usize> = unmarked.iter().copied().filter(|&i| resources[i].annotation_is_true(keys::MANAGED)).collect();
    let pool = if managed.is_empty() { unmarked } else { managed };
    match pool.as_slice() {
        [only] => Ok(*only),
        [] => Err(ValidationError::Service { role: ServiceRole::Primary, reason: Resolution::NoneFound }),
        _ => Err(ValidationError::Service { role: ServiceRole::Primary, reason: Resolution::Ambiguous }),
    }
}

/// Index of the annotated stage Service, `None` when it must be synthesized.
pub fn resolve_stage(resources: &[Resource], primary: usize) -> Result<Option<usize>, ValidationError> {
    let marked: Vec<usize> = (0..resources.len())
        .filter(|&i| i != primary && resources[i].kind() == "Service" && resources[i].annotation_is_true(keys::STAGE_SERVICE))
        .collect();
    match marked.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(*only)),
        _ => Err(ValidationError::Service { role: ServiceRole::Stage, reason: Resolution::MultipleFound }),
    }
}

/// Clone the primary as `<primary>-stage`, dropping fields the API server allocates.
pub fn synthesize_stage(primary: &Resource) -> Resource {
    let mut stage = primary.clone();
    let name = format!("{}-stage", primary.name());
    stage.set_name(&name);
    if let Some(ann) = stage.spec.pointer_mut("/metadata/annotations").and_then(|a| a.as_object_mut()) {
        ann.remove(keys::PRIMARY_SERVICE);
    }
    if let Some(spec) = stage.spec.get_mut("spec").and_then(|s| s.as_object_mut()) {
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
        if let Some(ports) = spec.get_mut("ports").and_then(|p| p.as_array_mut()) {
            for p in ports.iter_mut().filter_map(|p| p.as_object_mut()) {
                p.remove("nodePort");
            }
        }
    }
    stage
}

/// Index of the single workload taking part in the color swap.
pub fn resolve_workload(resources: &[Resource]) -> Result<usize, ValidationError> {
    let eligible: Vec<usize> = (0..resources.len()).filter(|&i| kinds::is_managed_workload(&resources[i])).collect();
    let idx = match eligible.as_slice() {
        [] => return Err(ValidationError::Workload(WorkloadCount::None)),
        [only] => *only,
        _ => return Err(ValidationError::Workload(WorkloadCount::Multiple)),
    };
    if !kinds::BLUE_GREEN_KINDS.contains(&resources[idx].kind()) {
        return Err(ValidationError::UnsupportedWorkload(resources[idx].id.clone()));
    }
    Ok(idx)
}

/// Color selected by a live Service, or an error when it has none.
pub fn live_color(live: &Json, service: &str) -> Result<Color, ValidationError> {
    live.pointer("/spec/selector")
        .and_then(|s| s.get(keys::COLOR_LABEL))
        .and_then(|c| c.as_str())
        .and_then(Color::parse)
        .ok_or_else(|| ValidationError::UnlabeledLiveService(service.to_string()))
}

pub(crate) async fn run(engine: &Engine, ctx: &PipelineContext, req: BlueGreenRequest) -> DeployResult<DeployOutput> {
    let mut resources = req.resources;
    if resources.is_empty() {
        return Err(ValidationError::EmptyManifests.into());
    }
    let primary_idx = resolve_primary(&resources)?;
    let stage_idx = resolve_stage(&resources, primary_idx)?;
    let workload_idx = resolve_workload(&resources)?;
    if !ctx.flags.skip_steady_state {
        let custom: Vec<Resource> = resources.iter().filter(|r| kinds::is_custom_workload(r)).cloned().collect();
        steady::validate_steady_state_declared(&custom)?;
    }
    if stage_idx.is_none() {
        let stage = synthesize_stage(&resources[primary_idx]);
        info!(service = %stage.id, "synthesized stage service");
        resources.push(stage);
    }
    let stage_idx = stage_idx.unwrap_or(resources.len() - 1);

    let primary_id = resources[primary_idx].id.clone();
    let primary_color = match engine.ops.get(&primary_id).await.map_err(DeployError::cluster)? {
        Some(live) => Some(live_color(&live, primary_id.name.as_str())?),
        None => None,
    };
    let stage_color = primary_color.map(|c| c.opposite()).unwrap_or(Color::Blue);
    info!(
        release = %ctx.release_name,
        primary = %primary_id,
        stage = %resources[stage_idx].id,
        workload = %resources[workload_idx].id,
        primary_color = primary_color.map(|c| c.as_str()).unwrap_or("default"),
        stage_color = %stage_color,
        "blue-green colors"
    );

    let mut handle = HistoryHandle::load(engine.store.clone(), &ctx.namespace, &ctx.release_name).await?;
    let mut out = DeployOutput { primary_color, stage_color: Some(stage_color), ..DeployOutput::default() };
    out.warnings.extend(pipeline::retire_releases(engine, &mut handle).await);
    let number = handle.history.next_number();

    if ctx.flags.versioning {
        versioning::mark_versioned(&mut resources);
        resources[workload_idx].versioned = false;
        for (old, new) in versioning::add_revision_suffix(&mut resources, number) {
            info!(from = %old, to = %new, "versioned");
        }
    }
    let color_labels = versioning::release_labels(&ctx.release_name, Some(stage_color));
    let plain_labels = versioning::release_labels(&ctx.release_name, None);
    for (i, r) in resources.iter_mut().enumerate() {
        if i == workload_idx {
            r.append_name_suffix(&format!("-{}", stage_color));
            r.add_pod_template_labels(&color_labels);
            r.add_selector_labels(&color_labels);
        } else {
            r.add_pod_template_labels(&plain_labels);
        }
    }
    resources[primary_idx].add_color_selector(primary_color.unwrap_or(stage_color));
    resources[stage_idx].add_color_selector(stage_color);

    let mut cutover = vec![resources[primary_idx].clone(), resources[stage_idx].clone()];
    cutover[0].add_color_selector(stage_color);
    cutover[1].add_color_selector(primary_color.unwrap_or(stage_color));

    kinds::sort_for_apply(&mut resources);
    let before = pipeline::pod_snapshot(engine.ops.as_ref(), ctx).await;
    pipeline::open_release(&mut handle, number, &resources, ctx.flags.prune).await?;

    let mut res = pipeline::apply_and_verify(engine, ctx, &mut handle, number, &resources).await;
    if res.is_ok() {
        if req.skip_cutover {
            info!(number, "cutover skipped");
        } else {
            res = engine.ops.apply(&cutover, &ctx.namespace).await.map_err(|e| DeployError::Apply(format!("cutover: {:#}", e)));
            if res.is_ok() {
                info!(primary = %cutover[0].id, color = %stage_color, "primary service switched");
            }
        }
    }
    handle.settle(Some(number), res).await?;
    handle.mark_succeeded(number).await?;

    if ctx.flags.prune {
        let current: Vec<_> = resources.iter().map(|r| r.id.clone()).collect();
        let previous = handle.history.previous_rollback_eligible(number).cloned();
        let outcome = prune::prune(engine.ops.as_ref(), previous.as_ref(), &current, true).await;
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
