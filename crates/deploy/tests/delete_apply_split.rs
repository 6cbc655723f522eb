#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tern_core::{ReleaseHistory, ResourceId};
use tern_deploy::{
    ApplyRequest, DeleteRequest, DeleteTarget, DeployError, DeployFlags, Destination, Engine, EngineConfig, PipelineContext, RollingRequest, Strategy,
    TrafficSplitRequest, ValidationError,
};
use tern_ops::mock::MockOps;
use tern_persist::MemoryStore;

const APP: &str = r#"
apiVersion: v1
kind: Namespace
metadata: { name: ns }
---
apiVersion: v1
kind: ConfigMap
metadata: { name: cfg }
---
apiVersion: apps/v1
kind: Deployment
metadata: { name: app }
spec:
  template:
    metadata: { labels: { app: app } }
    spec: { containers: [ { name: main, image: "app:1" } ] }
"#;

fn setup() -> (Arc<MockOps>, Arc<MemoryStore>, Engine) {
    let ops = Arc::new(MockOps::new());
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig { poll_interval: Duration::from_millis(1), ..EngineConfig::default() };
    let engine = Engine::new(ops.clone(), store.clone(), config);
    (ops, store, engine)
}

fn ctx() -> PipelineContext {
    PipelineContext::new("app", "ns", 1).with_timeout(Duration::from_millis(50))
}

fn manifests(yaml: &str) -> Vec<tern_core::Resource> { tern_apply::parse_manifests(yaml, Some("ns")).unwrap() }

fn id(kind: &str, name: &str) -> ResourceId { ResourceId::new(kind, name, Some("ns")) }

#[tokio::test]
async fn wildcard_deletes_exactly_the_tracked_union() {
    let (ops, store, engine) = setup();
    engine.execute(&ctx(), Strategy::Rolling(RollingRequest::new(manifests(APP)))).await.unwrap();
    engine.execute(&ctx(), Strategy::Rolling(RollingRequest::new(manifests(APP)))).await.unwrap();
    ops.put_object(id("ConfigMap", "unrelated"), serde_json::json!({}));
    ops.reset_logs();

    let mut req = DeleteRequest::new(DeleteTarget::resolve(&["*".to_string()], None, "ns").unwrap());
    req.delete_namespace = true;
    let out = engine.execute(&ctx(), Strategy::Delete(req)).await.unwrap();

    let h = ReleaseHistory::deserialize(&store.peek("ns", "app").unwrap_or_default()).unwrap();
    let union: HashSet<ResourceId> = h.all_resource_ids().into_iter().collect();
    let deleted: HashSet<ResourceId> = out.deleted.iter().cloned().collect();
    assert_eq!(deleted, union);
    assert_eq!(out.deleted.len(), union.len());
    assert!(ops.exists(&id("ConfigMap", "unrelated")));
    // children before owners
    assert_eq!(out.deleted.last().map(|i| i.kind.as_str()), Some("Namespace"));
}

#[tokio::test]
async fn wildcard_spares_namespaces_by_default() {
    let (ops, _store, engine) = setup();
    engine.execute(&ctx(), Strategy::Rolling(RollingRequest::new(manifests(APP)))).await.unwrap();
    let req = DeleteRequest::new(DeleteTarget::All);
    let out = engine.execute(&ctx(), Strategy::Delete(req)).await.unwrap();
    assert!(out.deleted.iter().all(|i| i.kind != "Namespace"));
    assert!(ops.exists(&ResourceId::new("Namespace", "ns", None)));
    assert!(!ops.exists(&id("Deployment", "app-1")));
}

#[tokio::test]
async fn explicit_and_empty_targets() {
    let (ops, _store, engine) = setup();
    ops.put_object(id("ConfigMap", "a"), serde_json::json!({}));
    let out = engine.execute(&ctx(), Strategy::Delete(DeleteRequest::new(DeleteTarget::Ids(vec![])))).await.unwrap();
    assert!(out.noop.is_some());

    let target = DeleteTarget::resolve(&["ConfigMap/a".to_string()], None, "ns").unwrap();
    let out = engine.execute(&ctx(), Strategy::Delete(DeleteRequest::new(target))).await.unwrap();
    assert_eq!(out.deleted, vec![id("ConfigMap", "a")]);

    ops.put_object(id("ConfigMap", "b"), serde_json::json!({}));
    ops.fail_delete_of("b");
    let err = engine.execute(&ctx(), Strategy::Delete(DeleteRequest::new(DeleteTarget::Ids(vec![id("ConfigMap", "b")])))).await.unwrap_err();
    assert!(matches!(err, DeployError::Delete(_)), "err={}", err);
}

#[tokio::test]
async fn apply_strategy_never_touches_history() {
    let (ops, store, engine) = setup();
    let out = engine.execute(&ctx(), Strategy::Apply(ApplyRequest { resources: manifests(APP) })).await.unwrap();
    assert_eq!(out.release_number, None);
    assert!(ops.exists(&id("Deployment", "app")));
    assert!(store.peek("ns", "app").is_none());

    ops.never_ready("app");
    let err = engine.execute(&ctx(), Strategy::Apply(ApplyRequest { resources: manifests(APP) })).await.unwrap_err();
    assert!(matches!(err, DeployError::SteadyState));
    let ctx = ctx().with_flags(DeployFlags { skip_steady_state: true, ..DeployFlags::default() });
    assert!(engine.execute(&ctx, Strategy::Apply(ApplyRequest { resources: manifests(APP) })).await.is_ok());
}

#[tokio::test]
async fn traffic_split_rewrites_the_live_route() {
    let (ops, _store, engine) = setup();
    let vs_id = id("VirtualService", "web");
    ops.put_object(
        vs_id.clone(),
        serde_json::json!({
            "apiVersion": "networking.istio.io/v1beta1", "kind": "VirtualService",
            "metadata": {"name": "web", "namespace": "ns", "resourceVersion": "42"},
            "spec": {"hosts": ["web"], "http": [{"route": [{"destination": {"host": "web", "subset": "stable"}}]}]}
        }),
    );
    let req = TrafficSplitRequest {
        virtual_service: "web".into(),
        destinations: vec![
            Destination { host: None, subset: Some("stable".into()), port: None, weight: 80 },
            Destination { host: None, subset: Some("canary".into()), port: None, weight: 20 },
        ],
    };
    engine.execute(&ctx(), Strategy::TrafficSplit(req)).await.unwrap();
    let live = ops.object(&vs_id).unwrap();
    assert_eq!(live["spec"]["http"][0]["route"][1]["destination"]["subset"], "canary");
    assert_eq!(live["spec"]["http"][0]["route"][1]["weight"], 20);
    assert!(live["metadata"].get("resourceVersion").is_none());

    let missing = TrafficSplitRequest { virtual_service: "nope".into(), destinations: vec![] };
    let err = engine.execute(&ctx(), Strategy::TrafficSplit(missing)).await.unwrap_err();
    assert!(matches!(err, DeployError::Validation(ValidationError::TrafficSplit(_))), "err={}", err);
}
