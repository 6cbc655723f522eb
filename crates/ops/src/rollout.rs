//! Rollout progress of built-in workloads, read from their status blocks.

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutState {
    Ready,
    Progressing(String),
    Failed(String),
}

fn int(v: &Json, ptr: &str) -> Option<i64> { v.pointer(ptr).and_then(|x| x.as_i64()) }

fn observed_current(obj: &Json) -> bool {
    let generation = int(obj, "/metadata/generation").unwrap_or(0);
    let observed = int(obj, "/status/observedGeneration").unwrap_or(0);
    generation <= observed
}

/// Evaluate one observation of a workload. Kinds without rollout semantics are `Ready`.
pub fn evaluate(kind: &str, obj: &Json) -> RolloutState {
    match kind {
        "Deployment" => deployment(obj),
        "StatefulSet" => stateful_set(obj),
        "DaemonSet" => daemon_set(obj),
        "DeploymentConfig" => deployment_config(obj),
        _ => RolloutState::Ready,
    }
}

fn deployment(obj: &Json) -> RolloutState {
    if !observed_current(obj) {
        return RolloutState::Progressing("waiting for deployment spec update to be observed".into());
    }
    let deadline_hit = obj
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .map(|cs| {
            cs.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Progressing")
                    && c.get("reason").and_then(|r| r.as_str()) == Some("ProgressDeadlineExceeded")
            })
        })
        .unwrap_or(false);
    if deadline_hit {
        return RolloutState::Failed("deployment exceeded its progress deadline".into());
    }
    let desired = int(obj, "/spec/replicas").unwrap_or(1);
    let updated = int(obj, "/status/updatedReplicas").unwrap_or(0);
    let replicas = int(obj, "/status/replicas").unwrap_or(0);
    let available = int(obj, "/status/availableReplicas").unwrap_or(0);
    if updated < desired {
        return RolloutState::Progressing(format!("{} of {} updated replicas are available", updated, desired));
    }
    if replicas > updated {
        return RolloutState::Progressing(format!("{} old replicas are pending termination", replicas - updated));
    }
    if available < updated {
        return RolloutState::Progressing(format!("{} of {} updated replicas are available", available, updated));
    }
    RolloutState::Ready
}

fn stateful_set(obj: &Json) -> RolloutState {
    if obj.pointer("/spec/updateStrategy/type").and_then(|t| t.as_str()) == Some("OnDelete") {
        return RolloutState::Ready;
    }
    if !observed_current(obj) {
        return RolloutState::Progressing("waiting for statefulset spec update to be observed".into());
    }
    let desired = int(obj, "/spec/replicas").unwrap_or(1);
    let ready = int(obj, "/status/readyReplicas").unwrap_or(0);
    if ready < desired {
        return RolloutState::Progressing(format!("{} of {} pods are ready", ready, desired));
    }
    if let Some(partition) = int(obj, "/spec/updateStrategy/rollingUpdate/partition") {
        let updated = int(obj, "/status/updatedReplicas").unwrap_or(0);
        if updated < desired - partition {
            return RolloutState::Progressing(format!("{} of {} partitioned pods updated", updated, desired - partition));
        }
        return RolloutState::Ready;
    }
    let current = obj.pointer("/status/currentRevision").and_then(|v| v.as_str());
    let update = obj.pointer("/status/updateRevision").and_then(|v| v.as_str());
    if current != update {
        return RolloutState::Progressing("waiting for statefulset rolling update to complete".into());
    }
    RolloutState::Ready
}

fn daemon_set(obj: &Json) -> RolloutState {
    if obj.pointer("/spec/updateStrategy/type").and_then(|t| t.as_str()) == Some("OnDelete") {
        return RolloutState::Ready;
    }
    if !observed_current(obj) {
        return RolloutState::Progressing("waiting for daemon set spec update to be observed".into());
    }
    let desired = int(obj, "/status/desiredNumberScheduled").unwrap_or(0);
    let updated = int(obj, "/status/updatedNumberScheduled").unwrap_or(0);
    let available = int(obj, "/status/numberAvailable").unwrap_or(0);
    if updated < desired {
        return RolloutState::Progressing(format!("{} out of {} new pods have been updated", updated, desired));
    }
    if available < desired {
        return RolloutState::Progressing(format!("{} of {} updated pods are available", available, desired));
    }
    RolloutState::Ready
}

fn deployment_config(obj: &Json) -> RolloutState {
    let failed = obj
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .map(|cs| cs.iter().any(|c| c.get("reason").and_then(|r| r.as_str()) == Some("ProgressDeadlineExceeded")))
        .unwrap_or(false);
    if failed {
        return RolloutState::Failed("deployment config exceeded its progress deadline".into());
    }
    let desired = int(obj, "/spec/replicas").unwrap_or(1);
    let updated = int(obj, "/status/updatedReplicas").unwrap_or(0);
    let ready = int(obj, "/status/readyReplicas").unwrap_or(0);
    if updated < desired || ready < desired {
        return RolloutState::Progressing(format!("{} of {} replicas ready", ready, desired));
    }
    RolloutState::Ready
}
