use tern_core::{kinds, Resource, ResourceId};
use tracing::info;

use crate::context::PipelineContext;
use crate::error::{DeployError, DeployResult, ValidationError};
use crate::{steady, DeployOutput, Engine};

/// Apply a resource subset outside any release. History is not touched.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub resources: Vec<Resource>,
}

pub(crate) async fn run(engine: &Engine, ctx: &PipelineContext, req: ApplyRequest) -> DeployResult<DeployOutput> {
    let mut resources = req.resources;
    if resources.is_empty() {
        return Err(ValidationError::EmptyManifests.into());
    }
    let custom: Vec<Resource> = resources.iter().filter(|r| kinds::is_custom_workload(r)).cloned().collect();
    if !ctx.flags.skip_steady_state {
        steady::validate_steady_state_declared(&custom)?;
    }
    kinds::sort_for_apply(&mut resources);
    engine.ops.apply(&resources, &ctx.namespace).await.map_err(|e| DeployError::Apply(format!("{:#}", e)))?;
    info!(count = resources.len(), ns = %ctx.namespace, "applied");

    if !ctx.flags.skip_steady_state {
        let managed: Vec<ResourceId> = resources.iter().filter(|r| kinds::is_managed_workload(r)).map(|r| r.id.clone()).collect();
        if (!managed.is_empty() || !custom.is_empty()) && !engine.poller().wait_for_all(&managed, &custom, ctx.timeout).await {
            return Err(DeployError::SteadyState);
        }
    }
    Ok(DeployOutput::default())
}
