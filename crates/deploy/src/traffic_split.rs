//! Weighted routing on an Istio VirtualService.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tern_core::{Resource, ResourceId};
use tracing::info;

use crate::context::PipelineContext;
use crate::error::{DeployError, DeployResult, ValidationError};
use crate::{DeployOutput, Engine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Defaults to the host of the route's first existing destination.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub subset: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct TrafficSplitRequest {
    pub virtual_service: String,
    pub destinations: Vec<Destination>,
}

fn invalid(msg: impl Into<String>) -> DeployError {
    ValidationError::TrafficSplit(msg.into()).into()
}

/// Replace the single HTTP route of `vs` with `destinations`.
pub fn rewrite_routes(mut vs: Json, destinations: &[Destination]) -> DeployResult<Json> {
    if destinations.is_empty() {
        return Err(invalid("no destinations given"));
    }
    let total: u32 = destinations.iter().map(|d| d.weight).sum();
    if total != 100 {
        return Err(invalid(format!("weights sum to {}, expected 100", total)));
    }
    let spec = vs.get_mut("spec").and_then(|s| s.as_object_mut()).ok_or_else(|| invalid("virtual service has no spec"))?;
    for proto in ["tcp", "tls"] {
        if spec.get(proto).and_then(|r| r.as_array()).map(|r| !r.is_empty()).unwrap_or(false) {
            return Err(invalid(format!("{} routes are not supported", proto)));
        }
    }
    let http = spec.get_mut("http").and_then(|h| h.as_array_mut()).ok_or_else(|| invalid("no http route"))?;
    if http.len() != 1 {
        return Err(invalid(format!("expected exactly one http route, found {}", http.len())));
    }
    let route = &mut http[0];
    let first = route.pointer("/route/0/destination").cloned().unwrap_or(Json::Null);
    let default_host = first.get("host").and_then(|h| h.as_str()).map(|s| s.to_string());
    let default_port = first.pointer("/port/number").and_then(|p| p.as_u64()).map(|p| p as u32);

    let mut entries = Vec::with_capacity(destinations.len());
    for d in destinations {
        let host = d.host.clone().or_else(|| default_host.clone()).ok_or_else(|| invalid("destination has no host and the route has none to inherit"))?;
        let mut dest = json!({ "host": host });
        if let Some(subset) = &d.subset {
            dest["subset"] = json!(subset);
        }
        if let Some(port) = d.port.or(default_port) {
            dest["port"] = json!({ "number": port });
        }
        entries.push(json!({ "destination": dest, "weight": d.weight }));
    }
    match route.as_object_mut() {
        Some(obj) => {
            obj.insert("route".into(), Json::Array(entries));
        }
        None => return Err(invalid("http route is not an object")),
    }
    Ok(vs)
}

pub(crate) async fn run(engine: &Engine, ctx: &PipelineContext, req: TrafficSplitRequest) -> DeployResult<DeployOutput> {
    let id = ResourceId::new("VirtualService", req.virtual_service.as_str(), Some(ctx.namespace.as_str()));
    let live = engine.ops.get(&id).await.map_err(DeployError::cluster)?.ok_or_else(|| invalid(format!("virtual service {} not found", id)))?;
    let updated = tern_apply::strip_noisy(rewrite_routes(live, &req.destinations)?);
    let resource = Resource::from_json(updated, Some(&ctx.namespace)).map_err(|e| DeployError::Internal(format!("{:#}", e)))?;
    engine.ops.apply(std::slice::from_ref(&resource), &ctx.namespace).await.map_err(|e| DeployError::Apply(format!("{:#}", e)))?;
    for d in &req.destinations {
        info!(virtual_service = %id, host = ?d.host, subset = ?d.subset, weight = d.weight, "route weight set");
    }
    Ok(DeployOutput::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vs() -> Json {
        json!({
            "apiVersion": "networking.istio.io/v1beta1", "kind": "VirtualService",
            "metadata": {"name": "web", "namespace": "ns"},
            "spec": {"hosts": ["web"], "http": [{"route": [{"destination": {"host": "web.ns.svc", "port": {"number": 8080}}}]}]}
        })
    }

    fn dest(subset: &str, weight: u32) -> Destination {
        Destination { host: None, subset: Some(subset.into()), port: None, weight }
    }

    #[test]
    fn inherits_host_and_port() {
        let out = rewrite_routes(vs(), &[dest("stable", 90), dest("canary", 10)]).unwrap();
        let route = &out["spec"]["http"][0]["route"];
        assert_eq!(route.as_array().unwrap().len(), 2);
        assert_eq!(route[1]["destination"]["host"], "web.ns.svc");
        assert_eq!(route[1]["destination"]["subset"], "canary");
        assert_eq!(route[1]["destination"]["port"]["number"], 8080);
        assert_eq!(route[1]["weight"], 10);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(rewrite_routes(vs(), &[dest("a", 50)]).is_err());
        assert!(rewrite_routes(vs(), &[]).is_err());
        let mut two = vs();
        two["spec"]["http"] = json!([{"route": []}, {"route": []}]);
        assert!(rewrite_routes(two, &[dest("a", 100)]).is_err());
        let mut tcp = vs();
        tcp["spec"]["tcp"] = json!([{"route": []}]);
        let err = rewrite_routes(tcp, &[dest("a", 100)]).unwrap_err();
        assert!(err.is_validation());
    }
}
