//! Kind taxonomy and apply/delete ordering.

use crate::{keys, Resource, ResourceId};

/// Apply order by kind. Kinds not listed go last; deletion walks it backwards.
const CREATE_ORDER: &[&str] = &[
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ServiceAccount",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "DeploymentConfig",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "Ingress",
    "APIService",
];

const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "PodSecurityPolicy",
    "StorageClass",
    "PersistentVolume",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "APIService",
];

/// Kinds with native rollout status and revision history.
pub const MANAGED_WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "DeploymentConfig"];

/// Kinds eligible as the single blue-green workload.
pub const BLUE_GREEN_KINDS: &[&str] = &["Deployment", "StatefulSet", "DeploymentConfig"];

pub fn create_rank(kind: &str) -> usize {
    CREATE_ORDER.iter().position(|k| *k == kind).unwrap_or(CREATE_ORDER.len())
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

pub fn is_builtin(kind: &str) -> bool {
    CREATE_ORDER.contains(&kind) || matches!(kind, "Endpoints" | "Event" | "ControllerRevision")
}

pub fn has_pod_template(kind: &str) -> bool {
    matches!(kind, "Deployment" | "StatefulSet" | "DaemonSet" | "DeploymentConfig" | "ReplicaSet" | "ReplicationController" | "Job")
}

pub fn is_managed_workload(r: &Resource) -> bool {
    MANAGED_WORKLOAD_KINDS.contains(&r.kind()) && !r.annotation_is_true(keys::DIRECT_APPLY)
}

/// A non built-in resource that opted into steady-state tracking.
pub fn is_custom_workload(r: &Resource) -> bool {
    !is_builtin(r.kind()) && (r.annotation_is_true(keys::MANAGED_WORKLOAD) || r.annotation(keys::STEADY_STATE_CONDITION).is_some())
}

/// Stable sort into apply order.
pub fn sort_for_apply(resources: &mut [Resource]) {
    resources.sort_by_key(|r| create_rank(r.kind()));
}

/// Stable sort into delete order: reverse of apply order by kind.
pub fn sort_for_delete(ids: &mut [ResourceId]) {
    ids.sort_by_key(|id| std::cmp::Reverse(create_rank(&id.kind)));
}
