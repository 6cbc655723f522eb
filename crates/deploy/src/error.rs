use std::fmt;

use tern_core::ResourceId;
use tern_persist::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Primary,
    Stage,
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceRole::Primary => "primary",
            ServiceRole::Stage => "stage",
        })
    }
}

/// Why a blue-green service could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    NoneFound,
    /// More than one service carries the role annotation.
    MultipleFound,
    /// Several services and none marked with the role.
    Ambiguous,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::NoneFound => "no service found in manifests",
            Resolution::MultipleFound => "multiple services carry the role annotation",
            Resolution::Ambiguous => "multiple services found and none is annotated",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadCount {
    None,
    Multiple,
}

impl fmt::Display for WorkloadCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkloadCount::None => "no eligible workload found in manifests",
            WorkloadCount::Multiple => "more than one eligible workload found; mark extras with the direct-apply annotation",
        })
    }
}

/// Input problems detected before any cluster mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{role} service: {reason}")]
    Service { role: ServiceRole, reason: Resolution },
    #[error("workload: {0}")]
    Workload(WorkloadCount),
    #[error("workload {0} is not supported for blue-green")]
    UnsupportedWorkload(ResourceId),
    #[error("custom workload {0} is missing the steady-state condition annotation")]
    MissingSteadyStateCondition(ResourceId),
    #[error("invalid steady-state condition on {id}: {reason}")]
    InvalidCondition { id: ResourceId, reason: String },
    #[error("live service {0} has no color selector and conflicts with blue-green")]
    UnlabeledLiveService(String),
    #[error("traffic split: {0}")]
    TrafficSplit(String),
    #[error("invalid resource reference `{0}` (expect Kind/name or namespace/Kind/name)")]
    InvalidResourceRef(String),
    #[error("no manifests to deploy")]
    EmptyManifests,
    #[error("invalid input: {0}")]
    Input(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("workloads did not reach steady state")]
    SteadyState,
    #[error("rollback failed: {0}")]
    Rollback(String),
    #[error("delete failed: {0}")]
    Delete(String),
    #[error("history: {0}")]
    History(#[from] StoreError),
    #[error("cluster: {0}")]
    Cluster(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn cluster(e: anyhow::Error) -> Self { DeployError::Cluster(format!("{:#}", e)) }

    pub fn is_validation(&self) -> bool { matches!(self, DeployError::Validation(_)) }
}

pub type DeployResult<T> = Result<T, DeployError>;
