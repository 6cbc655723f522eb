//! Steady-state checks for built-in and custom workloads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use tern_core::{keys, Resource, ResourceId};
use tern_ops::ClusterOps;
use tracing::{debug, info, warn};

use crate::condition::Condition;
use crate::context::MAX_TIMEOUT;
use crate::error::ValidationError;

/// Fail fast when a custom workload cannot be tracked. Runs before apply.
pub fn validate_steady_state_declared(custom: &[Resource]) -> Result<(), ValidationError> {
    for r in custom {
        let expr = r.annotation(keys::STEADY_STATE_CONDITION).ok_or_else(|| ValidationError::MissingSteadyStateCondition(r.id.clone()))?;
        Condition::parse(expr).map_err(|reason| ValidationError::InvalidCondition { id: r.id.clone(), reason })?;
    }
    Ok(())
}

fn deadline_after(t0: Instant, timeout: Duration) -> Instant {
    t0.checked_add(timeout.min(MAX_TIMEOUT)).unwrap_or(t0)
}

pub struct SteadyStatePoller {
    ops: Arc<dyn ClusterOps>,
    poll_interval: Duration,
}

impl SteadyStatePoller {
    pub fn new(ops: Arc<dyn ClusterOps>, poll_interval: Duration) -> Self { Self { ops, poll_interval } }

    /// Native rollout status for each workload under one shared deadline.
    /// Every workload is checked even after a failure.
    pub async fn wait_for_managed(&self, ids: &[ResourceId], timeout: Duration) -> bool {
        let t0 = Instant::now();
        let deadline = deadline_after(t0, timeout);
        let mut failed = Vec::new();
        for id in ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ops.rollout_status(id, remaining).await {
                Ok(true) => debug!(resource = %id, "steady"),
                Ok(false) => {
                    warn!(resource = %id, "not steady before deadline");
                    failed.push(id.to_string());
                }
                Err(e) => {
                    warn!(resource = %id, error = %format!("{:#}", e), "status check failed");
                    failed.push(id.to_string());
                }
            }
        }
        histogram!("steady_state_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if failed.is_empty() {
            info!(count = ids.len(), took_ms = %t0.elapsed().as_millis(), "managed workloads steady");
            true
        } else {
            warn!(failed = %failed.join(", "), "managed workloads not steady");
            false
        }
    }

    /// Poll each custom workload's declared condition until it holds or the deadline passes.
    pub async fn wait_for_custom(&self, resources: &[Resource], timeout: Duration) -> bool {
        let t0 = Instant::now();
        let deadline = deadline_after(t0, timeout);
        let mut pending: Vec<(ResourceId, Condition)> = Vec::new();
        let mut ok = true;
        for r in resources {
            match r.annotation(keys::STEADY_STATE_CONDITION).map(Condition::parse) {
                Some(Ok(c)) => pending.push((r.id.clone(), c)),
                Some(Err(e)) => {
                    warn!(resource = %r.id, error = %e, "unusable steady-state condition");
                    ok = false;
                }
                None => {
                    warn!(resource = %r.id, "no steady-state condition declared");
                    ok = false;
                }
            }
        }
        loop {
            let mut still = Vec::new();
            for (id, cond) in pending {
                match self.ops.get(&id).await {
                    Ok(Some(obj)) if cond.eval(&obj) => debug!(resource = %id, "condition met"),
                    Ok(Some(_)) => still.push((id, cond)),
                    Ok(None) => {
                        debug!(resource = %id, "not found yet");
                        still.push((id, cond));
                    }
                    Err(e) => {
                        warn!(resource = %id, error = %format!("{:#}", e), "reading custom workload failed");
                        still.push((id, cond));
                    }
                }
            }
            pending = still;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
        histogram!("steady_state_ms", t0.elapsed().as_secs_f64() * 1000.0);
        for (id, _) in &pending {
            warn!(resource = %id, timeout_s = timeout.as_secs(), "custom workload did not reach steady state");
        }
        ok && pending.is_empty()
    }

    /// Both checks; each runs to completion so every failure is logged.
    pub async fn wait_for_all(&self, managed: &[ResourceId], custom: &[Resource], timeout: Duration) -> bool {
        let t0 = Instant::now();
        let managed_ok = managed.is_empty() || self.wait_for_managed(managed, timeout).await;
        let remaining = timeout.saturating_sub(t0.elapsed());
        let custom_ok = custom.is_empty() || self.wait_for_custom(custom, remaining).await;
        managed_ok && custom_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tern_ops::mock::MockOps;

    fn custom(name: &str, condition: Option<&str>) -> Resource {
        let mut doc = json!({"apiVersion": "example.io/v1", "kind": "Rollout", "metadata": {"name": name, "annotations": {(keys::MANAGED_WORKLOAD): "true"}}});
        if let Some(c) = condition {
            doc["metadata"]["annotations"][keys::STEADY_STATE_CONDITION] = json!(c);
        }
        Resource::from_json(doc, Some("ns")).unwrap()
    }

    #[test]
    fn validation_names_the_offending_resource() {
        let ok = custom("a", Some(".status.phase == 'Healthy'"));
        let missing = custom("b", None);
        let broken = custom("c", Some(".status.phase ==="));
        assert!(validate_steady_state_declared(&[ok.clone()]).is_ok());
        assert_eq!(validate_steady_state_declared(&[ok.clone(), missing.clone()]), Err(ValidationError::MissingSteadyStateCondition(missing.id.clone())));
        assert!(matches!(validate_steady_state_declared(&[broken]), Err(ValidationError::InvalidCondition { .. })));
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_overflow_the_deadline() {
        let ops = Arc::new(MockOps::new());
        let a = ResourceId::new("Deployment", "a", Some("ns"));
        ops.put_object(a.clone(), json!({}));
        let r = custom("r", Some(".status.phase == 'Healthy'"));
        ops.put_object(r.id.clone(), json!({"status": {"phase": "Healthy"}}));
        let poller = SteadyStatePoller::new(ops, Duration::from_millis(1));
        assert!(poller.wait_for_managed(&[a], Duration::MAX).await);
        assert!(poller.wait_for_custom(&[r], Duration::MAX).await);
    }

    #[tokio::test]
    async fn managed_check_collects_every_failure() {
        let ops = Arc::new(MockOps::new());
        let a = ResourceId::new("Deployment", "a", Some("ns"));
        let b = ResourceId::new("Deployment", "b", Some("ns"));
        ops.put_object(a.clone(), json!({}));
        ops.put_object(b.clone(), json!({}));
        ops.never_ready("a");
        let poller = SteadyStatePoller::new(ops.clone(), Duration::from_millis(1));
        assert!(!poller.wait_for_managed(&[a.clone(), b.clone()], Duration::from_millis(10)).await);
        assert!(poller.wait_for_managed(&[b], Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn custom_condition_is_polled_until_deadline() {
        let ops = Arc::new(MockOps::new());
        let r = custom("ro", Some(".status.phase == 'Healthy'"));
        ops.put_object(r.id.clone(), json!({"status": {"phase": "Progressing"}}));
        let poller = SteadyStatePoller::new(ops.clone(), Duration::from_millis(1));
        assert!(!poller.wait_for_custom(&[r.clone()], Duration::from_millis(20)).await);

        ops.put_object(r.id.clone(), json!({"status": {"phase": "Healthy"}}));
        assert!(poller.wait_for_custom(&[r], Duration::from_millis(20)).await);
    }
}
