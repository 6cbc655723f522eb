#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tern_core::{keys, ReleaseHistory, ReleaseStatus, ResourceId};
use tern_deploy::{DeployError, DeployFlags, Engine, EngineConfig, PipelineContext, RollbackRequest, RollingRequest, Strategy};
use tern_ops::mock::MockOps;
use tern_ops::ClusterOps;
use tern_persist::MemoryStore;

const V1: &str = r#"
apiVersion: v1
kind: ServiceAccount
metadata: { name: legacy }
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: pinned
  annotations: { "tern.io/skip-pruning": "true" }
---
apiVersion: apps/v1
kind: Deployment
metadata: { name: app }
spec:
  selector: { matchLabels: { app: app } }
  template:
    metadata: { labels: { app: app } }
    spec: { containers: [ { name: main, image: "app:1" } ] }
"#;

const V2: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata: { name: app }
spec:
  selector: { matchLabels: { app: app } }
  template:
    metadata: { labels: { app: app } }
    spec: { containers: [ { name: main, image: "app:2" } ] }
"#;

fn setup() -> (Arc<MockOps>, Arc<MemoryStore>, Engine) {
    let ops = Arc::new(MockOps::new());
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig { poll_interval: Duration::from_millis(1), ..EngineConfig::default() };
    let engine = Engine::new(ops.clone(), store.clone(), config);
    (ops, store, engine)
}

fn ctx(flags: DeployFlags) -> PipelineContext {
    PipelineContext::new("app", "ns", 1).with_flags(flags).with_timeout(Duration::from_millis(50))
}

fn rolling(yaml: &str) -> Strategy {
    Strategy::Rolling(RollingRequest::new(tern_apply::parse_manifests(yaml, Some("ns")).unwrap()))
}

fn rollback(n: u32) -> Strategy { Strategy::Rollback(RollbackRequest { release_number: n }) }

fn history(store: &MemoryStore) -> ReleaseHistory {
    ReleaseHistory::deserialize(&store.peek("ns", "app").unwrap_or_default()).unwrap()
}

fn id(kind: &str, name: &str) -> ResourceId { ResourceId::new(kind, name, Some("ns")) }

/// Pod names matched by the manifests' service selector.
async fn serving(ops: &MockOps) -> Vec<String> {
    let mut sel = BTreeMap::new();
    sel.insert("app".to_string(), "app".to_string());
    ops.list_pods("ns", &sel).await.unwrap().into_iter().map(|p| p.name).collect()
}

#[tokio::test]
async fn rollback_zero_restores_last_success_without_new_number() {
    let (ops, store, engine) = setup();
    engine.execute(&ctx(DeployFlags::default()), rolling(V1)).await.unwrap();
    ops.never_ready("app-2");
    assert!(engine.execute(&ctx(DeployFlags::default()), rolling(V2)).await.is_err());
    ops.clear_failures();
    ops.reset_logs();

    let out = engine.execute(&ctx(DeployFlags::default()), rollback(0)).await.unwrap();
    assert_eq!(out.rolled_back_to, Some(1));
    assert_eq!(out.noop, None);
    assert_eq!(ops.undone(), vec![(id("Deployment", "app-1"), "1".to_string())]);

    let h = history(&store);
    assert_eq!(h.len(), 2);
    assert_eq!(h.next_number(), 3);
    assert_eq!(h.get(2).map(|r| r.status), Some(ReleaseStatus::Failed));
    assert_eq!(h.get(1).map(|r| r.status), Some(ReleaseStatus::Succeeded));
    // the undo produced a new native revision, read back from the cluster
    assert_eq!(h.get(1).and_then(|r| r.revision_of(&id("Deployment", "app-1"))), Some("2"));

    // the failed generation no longer sits behind the selector
    assert!(!ops.exists(&id("Deployment", "app-2")));
    assert!(ops.deleted().contains(&id("Deployment", "app-2")));
    assert_eq!(serving(&ops).await, vec!["app-1-r2".to_string()]);
}

#[tokio::test]
async fn rollback_after_two_successes_retires_the_failed_third() {
    let (ops, _store, engine) = setup();
    engine.execute(&ctx(DeployFlags::default()), rolling(V1)).await.unwrap();
    engine.execute(&ctx(DeployFlags::default()), rolling(V2)).await.unwrap();
    assert!(!ops.exists(&id("Deployment", "app-1")));
    ops.never_ready("app-3");
    assert!(engine.execute(&ctx(DeployFlags::default()), rolling(V2)).await.is_err());
    ops.clear_failures();

    let out = engine.execute(&ctx(DeployFlags::default()), rollback(0)).await.unwrap();
    assert_eq!(out.rolled_back_to, Some(2));
    assert!(!ops.exists(&id("Deployment", "app-3")));
    assert_eq!(serving(&ops).await, vec!["app-2-r2".to_string()]);
}

#[tokio::test]
async fn rollback_recreates_a_retired_target_workload() {
    let (ops, store, engine) = setup();
    engine.execute(&ctx(DeployFlags::default()), rolling(V1)).await.unwrap();
    engine.execute(&ctx(DeployFlags::default()), rolling(V2)).await.unwrap();
    ops.reset_logs();

    let out = engine.execute(&ctx(DeployFlags::default()), rollback(2)).await.unwrap();
    assert_eq!(out.rolled_back_to, Some(1));
    assert!(ops.undone().is_empty());
    let live = ops.object(&id("Deployment", "app-1")).unwrap();
    assert_eq!(live["spec"]["template"]["spec"]["containers"][0]["image"], "app:1");
    assert!(!ops.exists(&id("Deployment", "app-2")));
    assert_eq!(serving(&ops).await.len(), 1);
    assert!(history(&store).get(1).and_then(|r| r.revision_of(&id("Deployment", "app-1"))).is_some());
}

#[tokio::test]
async fn failing_to_retire_the_rolled_back_workload_aborts() {
    let (ops, _store, engine) = setup();
    engine.execute(&ctx(DeployFlags::default()), rolling(V1)).await.unwrap();
    ops.never_ready("app-2");
    assert!(engine.execute(&ctx(DeployFlags::default()), rolling(V2)).await.is_err());
    ops.clear_failures();
    ops.fail_delete_of("app-2");

    let err = engine.execute(&ctx(DeployFlags::default()), rollback(0)).await.unwrap_err();
    assert!(matches!(err, DeployError::Rollback(_)), "err={}", err);
}

fn rollout(replicas: u32) -> String {
    format!(
        "apiVersion: example.io/v1\nkind: Rollout\nmetadata:\n  name: ro\n  annotations: {{ \"{}\": \".spec.replicas == {}\" }}\nspec: {{ replicas: {} }}\n",
        keys::STEADY_STATE_CONDITION,
        replicas,
        replicas
    )
}

#[tokio::test]
async fn custom_workload_is_replaced_by_the_target_spec() {
    let (ops, store, engine) = setup();
    engine.execute(&ctx(DeployFlags::default()), rolling(&rollout(2))).await.unwrap();
    engine.execute(&ctx(DeployFlags::default()), rolling(&rollout(3))).await.unwrap();
    assert_eq!(ops.object(&id("Rollout", "ro")).unwrap()["spec"]["replicas"], 3);
    ops.reset_logs();

    let out = engine.execute(&ctx(DeployFlags::default()), rollback(2)).await.unwrap();
    assert_eq!(out.rolled_back_to, Some(1));
    assert!(ops.deleted().contains(&id("Rollout", "ro")));
    let stored = history(&store).get(1).and_then(|r| r.custom_workloads.first().cloned()).unwrap();
    assert_eq!(ops.object(&id("Rollout", "ro")), Some(stored.spec));
}

#[tokio::test]
async fn custom_workload_delete_failure_is_fail_fast() {
    let (ops, store, engine) = setup();
    engine.execute(&ctx(DeployFlags::default()), rolling(&rollout(2))).await.unwrap();
    engine.execute(&ctx(DeployFlags::default()), rolling(&rollout(3))).await.unwrap();
    ops.fail_delete_of("ro");
    ops.reset_logs();

    let err = engine.execute(&ctx(DeployFlags::default()), rollback(2)).await.unwrap_err();
    assert!(matches!(err, DeployError::Rollback(_)), "err={}", err);
    assert!(ops.applied().is_empty());
    assert_eq!(ops.object(&id("Rollout", "ro")).unwrap()["spec"]["replicas"], 3);
    assert_eq!(history(&store).get(2).map(|r| r.status), Some(ReleaseStatus::Succeeded));
}

#[tokio::test]
async fn noop_cases_are_successes() {
    let (ops, _store, engine) = setup();
    let out = engine.execute(&ctx(DeployFlags::default()), rollback(0)).await.unwrap();
    assert!(out.noop.is_some());

    engine.execute(&ctx(DeployFlags::default()), rolling(V1)).await.unwrap();
    let out = engine.execute(&ctx(DeployFlags::default()), rollback(0)).await.unwrap();
    assert!(out.noop.is_some(), "latest succeeded, nothing to do");

    let out = engine.execute(&ctx(DeployFlags::default()), rollback(1)).await.unwrap();
    assert!(out.noop.is_some(), "no release before the first");

    let out = engine.execute(&ctx(DeployFlags::default()), rollback(7)).await.unwrap();
    assert!(out.noop.is_some());
    assert!(ops.undone().is_empty());
}

#[tokio::test]
async fn undo_failure_is_fail_fast() {
    let (ops, store, engine) = setup();
    engine.execute(&ctx(DeployFlags::default()), rolling(V1)).await.unwrap();
    ops.never_ready("app-2");
    assert!(engine.execute(&ctx(DeployFlags::default()), rolling(V2)).await.is_err());
    ops.clear_failures();
    ops.fail_undo_of("app-1");

    let err = engine.execute(&ctx(DeployFlags::default()), rollback(2)).await.unwrap_err();
    assert!(matches!(err, DeployError::Rollback(_)), "err={}", err);
    assert_eq!(history(&store).get(2).map(|r| r.status), Some(ReleaseStatus::Failed));
}

#[tokio::test]
async fn prune_then_rollback_recreates_pruned_and_drops_new() {
    let (ops, store, engine) = setup();
    let flags = DeployFlags { prune: true, ..DeployFlags::default() };
    engine.execute(&ctx(flags), rolling(V1)).await.unwrap();

    let out = engine.execute(&ctx(flags), rolling(V2)).await.unwrap();
    assert_eq!(out.pruned, vec![id("ServiceAccount", "legacy")]);
    assert!(!ops.exists(&id("ServiceAccount", "legacy")));
    assert!(ops.exists(&id("ServiceAccount", "pinned")));
    // the old generation is retired on success, not by the pruning diff
    assert!(!ops.exists(&id("Deployment", "app-1")));
    assert!(!out.pruned.contains(&id("Deployment", "app-1")));
    assert_eq!(history(&store).get(2).map(|r| r.pruned.clone()), Some(vec![id("ServiceAccount", "legacy")]));

    let out = engine.execute(&ctx(flags), rollback(2)).await.unwrap();
    assert_eq!(out.rolled_back_to, Some(1));
    assert!(ops.exists(&id("ServiceAccount", "legacy")));
    assert!(ops.exists(&id("Deployment", "app-1")));
    assert!(!ops.exists(&id("Deployment", "app-2")));
    // release 2 had already succeeded, so its status stays
    assert_eq!(history(&store).get(2).map(|r| r.status), Some(ReleaseStatus::Succeeded));
}
