use tern_core::{kinds, Resource, ResourceId};
use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::error::{DeployError, DeployResult, ValidationError};
use crate::history::HistoryHandle;
use crate::{DeployOutput, Engine};

/// Sentinel selecting every resource ever tracked under the release name.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    Ids(Vec<ResourceId>),
    All,
    Manifests(Vec<Resource>),
}

impl DeleteTarget {
    /// Pick exactly one source, in priority order: explicit refs, the wildcard,
    /// then manifests. No refs and no manifests means nothing to delete.
    pub fn resolve(refs: &[String], manifests: Option<Vec<Resource>>, default_ns: &str) -> Result<Self, ValidationError> {
        let refs: Vec<&str> = refs.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        if refs == [WILDCARD] {
            return Ok(DeleteTarget::All);
        }
        if !refs.is_empty() {
            let ids = refs
                .iter()
                .map(|r| {
                    if *r == WILDCARD {
                        return Err(ValidationError::InvalidResourceRef(r.to_string()));
                    }
                    ResourceId::parse(r, Some(default_ns)).map_err(|_| ValidationError::InvalidResourceRef(r.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(DeleteTarget::Ids(ids));
        }
        match manifests {
            Some(m) if !m.is_empty() => Ok(DeleteTarget::Manifests(m)),
            _ => Ok(DeleteTarget::Ids(Vec::new())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub target: DeleteTarget,
    /// Let the wildcard include Namespace objects.
    pub delete_namespace: bool,
}

impl DeleteRequest {
    pub fn new(target: DeleteTarget) -> Self { Self { target, delete_namespace: false } }
}

pub(crate) async fn run(engine: &Engine, ctx: &PipelineContext, req: DeleteRequest) -> DeployResult<DeployOutput> {
    let wildcard = matches!(req.target, DeleteTarget::All);
    let mut ids = match req.target {
        DeleteTarget::Ids(ids) => ids,
        DeleteTarget::Manifests(resources) => resources.into_iter().map(|r| r.id).collect(),
        DeleteTarget::All => {
            let handle = HistoryHandle::load(engine.store.clone(), &ctx.namespace, &ctx.release_name).await?;
            let all = handle.history.all_resource_ids();
            info!(release = %ctx.release_name, tracked = all.len(), releases = handle.history.len(), "deleting everything tracked");
            all.into_iter().filter(|id| req.delete_namespace || id.kind != "Namespace").collect()
        }
    };
    kinds::sort_for_delete(&mut ids);
    if wildcard {
        if let Some(backing) = engine.store.backing_object(&ctx.namespace, &ctx.release_name) {
            ids.push(backing);
        }
    }
    if ids.is_empty() {
        return Ok(DeployOutput::noop("nothing to delete"));
    }
    for id in &ids {
        info!(resource = %id, "deleting");
    }
    let report = engine.ops.delete(&ids).await;
    if report.is_clean() {
        return Ok(DeployOutput { deleted: report.deleted, ..DeployOutput::default() });
    }
    for (id, e) in &report.failed {
        warn!(resource = %id, error = %e, "delete failed");
    }
    let failed: Vec<String> = report.failed.iter().map(|(id, e)| format!("{}: {}", id, e)).collect();
    Err(DeployError::Delete(failed.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_refs_win_over_manifests() {
        let cm = Resource::from_json(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}), Some("ns")).unwrap();
        let t = DeleteTarget::resolve(&["Deployment/web".into()], Some(vec![cm.clone()]), "ns").unwrap();
        assert_eq!(t, DeleteTarget::Ids(vec![ResourceId::new("Deployment", "web", Some("ns"))]));
        assert_eq!(DeleteTarget::resolve(&["*".into()], Some(vec![cm.clone()]), "ns").unwrap(), DeleteTarget::All);
        assert_eq!(DeleteTarget::resolve(&[], Some(vec![cm.clone()]), "ns").unwrap(), DeleteTarget::Manifests(vec![cm]));
        assert_eq!(DeleteTarget::resolve(&[], None, "ns").unwrap(), DeleteTarget::Ids(vec![]));
    }

    #[test]
    fn malformed_refs_are_rejected() {
        assert_eq!(DeleteTarget::resolve(&["web".into()], None, "ns"), Err(ValidationError::InvalidResourceRef("web".into())));
        assert_eq!(DeleteTarget::resolve(&["*".into(), "Deployment/web".into()], None, "ns"), Err(ValidationError::InvalidResourceRef("*".into())));
    }
}
