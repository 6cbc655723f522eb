//! Removal of resources that a new release no longer ships.

use metrics::counter;
use rustc_hash::FxHashSet;
use tern_core::{kinds, Release, ResourceId};
use tern_ops::ClusterOps;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub deleted: Vec<ResourceId>,
    pub warnings: Vec<String>,
}

/// Ids in `previous` but not in `current_ids`, in delete order.
///
/// Never selects a resource flagged skip-pruning or one that was suffix-versioned.
/// With `keep_workloads`, managed workload kinds are also kept (blue-green keeps
/// the idle color around for the next cutover). `None` when `previous` carries
/// no spec snapshot.
pub fn prune_candidates(previous: &Release, current_ids: &[ResourceId], keep_workloads: bool) -> Option<Vec<ResourceId>> {
    let specs = previous.specs.as_ref()?;
    let current: FxHashSet<&ResourceId> = current_ids.iter().collect();
    let mut out: Vec<ResourceId> = specs
        .iter()
        .filter(|r| !current.contains(&r.id))
        .filter(|r| !r.skip_pruning && !r.versioned)
        .filter(|r| !(keep_workloads && kinds::MANAGED_WORKLOAD_KINDS.contains(&r.kind())))
        .map(|r| r.id.clone())
        .collect();
    kinds::sort_for_delete(&mut out);
    Some(out)
}

/// Delete the prune set. Failures become warnings; the deploy has already succeeded.
pub async fn prune(ops: &dyn ClusterOps, previous: Option<&Release>, current_ids: &[ResourceId], keep_workloads: bool) -> PruneOutcome {
    let mut outcome = PruneOutcome::default();
    let Some(previous) = previous else {
        info!("no previous successful release, nothing to prune");
        return outcome;
    };
    let Some(candidates) = prune_candidates(previous, current_ids, keep_workloads) else {
        let msg = format!("pruning unavailable: release {} was deployed without pruning enabled", previous.number);
        warn!(previous = previous.number, "{}", msg);
        outcome.warnings.push(msg);
        return outcome;
    };
    if candidates.is_empty() {
        info!(previous = previous.number, "nothing to prune");
        return outcome;
    }
    let report = ops.delete(&candidates).await;
    for (id, err) in &report.failed {
        warn!(resource = %id, error = %err, "prune delete failed");
        outcome.warnings.push(format!("failed to prune {}: {}", id, err));
    }
    counter!("prune_deleted_total", report.deleted.len() as u64);
    info!(previous = previous.number, deleted = report.deleted.len(), failed = report.failed.len(), "pruned");
    outcome.deleted = report.deleted;
    outcome
}
