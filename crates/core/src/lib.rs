//! Tern core types: resource identity, manifest mutation, release history.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod kinds;
pub mod release;
pub mod versioning;

pub use release::{ManagedWorkload, Release, ReleaseHistory, ReleaseStatus};

/// Annotation and label keys understood by the engine.
pub mod keys {
    /// Service eligible for blue-green primary/stage resolution.
    pub const MANAGED: &str = "tern.io/managed";
    pub const PRIMARY_SERVICE: &str = "tern.io/primary-service";
    pub const STAGE_SERVICE: &str = "tern.io/stage-service";
    /// Extra workload applied alongside the single blue-green workload.
    pub const DIRECT_APPLY: &str = "tern.io/direct-apply";
    pub const SKIP_VERSIONING: &str = "tern.io/skip-versioning";
    pub const SKIP_PRUNING: &str = "tern.io/skip-pruning";
    /// Marks a custom resource as a tracked workload.
    pub const MANAGED_WORKLOAD: &str = "tern.io/managed-workload";
    pub const STEADY_STATE_CONDITION: &str = "tern.io/steady-state-condition";

    pub const RELEASE_NAME_LABEL: &str = "tern.io/release-name";
    pub const COLOR_LABEL: &str = "tern.io/color";
}

/// Identity of a cluster object. Equality is structural over all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: namespace.map(|s| s.to_string()) }
    }

    /// Parse `Kind/name` or `namespace/Kind/name`.
    pub fn parse(s: &str, default_ns: Option<&str>) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                let ns = if kinds::is_cluster_scoped(kind) { None } else { default_ns };
                Ok(Self::new(*kind, *name, ns))
            }
            [ns, kind, name] if !kind.is_empty() && !name.is_empty() => {
                let ns = if ns.is_empty() { None } else { Some(*ns) };
                Ok(Self::new(*kind, *name, ns))
            }
            _ => Err(anyhow!("invalid resource id: {} (expect Kind/name or namespace/Kind/name)", s)),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A parsed manifest document plus the per-resource flags the pipeline honours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub api_version: String,
    /// Full object document as it will be applied.
    pub spec: Json,
    #[serde(default)]
    pub versioned: bool,
    #[serde(default)]
    pub skip_pruning: bool,
    /// Release number whose `-<n>` suffix was appended to the name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffixed_with: Option<u32>,
}

impl Resource {
    /// Build from a JSON object document. `default_ns` fills in a missing
    /// `metadata.namespace` for namespaced kinds.
    pub fn from_json(mut spec: Json, default_ns: Option<&str>) -> Result<Self> {
        let api_version = spec.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?.to_string();
        let kind = spec.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?.to_string();
        let name = spec.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing metadata.name"))?.to_string();
        let mut namespace = spec.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
        if namespace.is_none() && !kinds::is_cluster_scoped(&kind) {
            if let Some(ns) = default_ns {
                namespace = Some(ns.to_string());
                if let Some(meta) = spec.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.insert("namespace".into(), Json::String(ns.to_string()));
                }
            }
        }
        let mut out = Self { id: ResourceId { kind, name, namespace }, api_version, spec, versioned: false, skip_pruning: false, suffixed_with: None };
        out.skip_pruning = out.annotation_is_true(keys::SKIP_PRUNING);
        Ok(out)
    }

    pub fn kind(&self) -> &str { &self.id.kind }
    pub fn name(&self) -> &str { &self.id.name }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.spec.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn annotation_is_true(&self, key: &str) -> bool {
        self.annotation(key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
    }

    pub fn set_name(&mut self, name: &str) {
        self.id.name = name.to_string();
        if let Some(meta) = ensure_object(&mut self.spec, &["metadata"]) {
            meta.insert("name".into(), Json::String(name.to_string()));
        }
    }

    pub fn append_name_suffix(&mut self, suffix: &str) {
        let name = format!("{}{}", self.id.name, suffix);
        self.set_name(&name);
    }

    /// Merge labels into the pod template (or the pod itself for `Pod`).
    pub fn add_pod_template_labels(&mut self, labels: &BTreeMap<String, String>) {
        let path: &[&str] = match self.id.kind.as_str() {
            "Pod" => &["metadata", "labels"],
            "CronJob" => &["spec", "jobTemplate", "spec", "template", "metadata", "labels"],
            k if kinds::has_pod_template(k) => &["spec", "template", "metadata", "labels"],
            _ => return,
        };
        if let Some(map) = ensure_object(&mut self.spec, path) {
            for (k, v) in labels {
                map.insert(k.clone(), Json::String(v.clone()));
            }
        }
    }

    /// Merge labels into the controller's selector.
    pub fn add_selector_labels(&mut self, labels: &BTreeMap<String, String>) {
        let path: &[&str] = match self.id.kind.as_str() {
            // DeploymentConfig and Service use a flat selector map
            "DeploymentConfig" | "Service" => &["spec", "selector"],
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" => &["spec", "selector", "matchLabels"],
            _ => return,
        };
        if let Some(map) = ensure_object(&mut self.spec, path) {
            for (k, v) in labels {
                map.insert(k.clone(), Json::String(v.clone()));
            }
        }
    }

    /// Point a Service's selector at one color.
    pub fn add_color_selector(&mut self, color: Color) {
        let mut labels = BTreeMap::new();
        labels.insert(keys::COLOR_LABEL.to_string(), color.as_str().to_string());
        self.add_selector_labels(&labels);
    }

    /// Flat selector map of a Service or DeploymentConfig, `matchLabels` otherwise.
    pub fn selector(&self) -> Option<&serde_json::Map<String, Json>> {
        let sel = self.spec.get("spec")?.get("selector")?;
        match self.id.kind.as_str() {
            "Service" | "DeploymentConfig" => sel.as_object(),
            _ => sel.get("matchLabels")?.as_object(),
        }
    }
}

/// Walk `path` inside `v`, creating empty objects on the way.
pub fn ensure_object<'a>(v: &'a mut Json, path: &[&str]) -> Option<&'a mut serde_json::Map<String, Json>> {
    let mut cur = v;
    for seg in path {
        let obj = cur.as_object_mut()?;
        let next = obj.entry(seg.to_string()).or_insert_with(|| Json::Object(serde_json::Map::new()));
        if next.is_null() {
            *next = Json::Object(serde_json::Map::new());
        }
        cur = next;
    }
    cur.as_object_mut()
}

/// Label value distinguishing the two blue-green workload copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blue" => Some(Color::Blue),
            "green" => Some(Color::Green),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str) -> Json {
        serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name },
            "spec": { "selector": { "matchLabels": { "app": name } }, "template": { "metadata": { "labels": { "app": name } }, "spec": {} } }
        })
    }

    #[test]
    fn from_json_defaults_namespace_for_namespaced_kinds() {
        let r = Resource::from_json(deployment("web"), Some("prod")).unwrap();
        assert_eq!(r.id, ResourceId::new("Deployment", "web", Some("prod")));
        assert_eq!(r.spec["metadata"]["namespace"], "prod");

        let ns = serde_json::json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "prod"}});
        let r = Resource::from_json(ns, Some("prod")).unwrap();
        assert_eq!(r.id.namespace, None);
    }

    #[test]
    fn from_json_reads_skip_pruning() {
        let mut doc = deployment("web");
        doc["metadata"]["annotations"] = serde_json::json!({ (keys::SKIP_PRUNING): "true" });
        let r = Resource::from_json(doc, None).unwrap();
        assert!(r.skip_pruning);
    }

    #[test]
    fn label_mutators_touch_template_and_selector() {
        let mut r = Resource::from_json(deployment("web"), None).unwrap();
        let mut labels = BTreeMap::new();
        labels.insert(keys::RELEASE_NAME_LABEL.to_string(), "rel".to_string());
        r.add_pod_template_labels(&labels);
        r.add_selector_labels(&labels);
        r.append_name_suffix("-blue");
        assert_eq!(r.name(), "web-blue");
        assert_eq!(r.spec["metadata"]["name"], "web-blue");
        assert_eq!(r.spec["spec"]["template"]["metadata"]["labels"][keys::RELEASE_NAME_LABEL], "rel");
        assert_eq!(r.selector().unwrap()[keys::RELEASE_NAME_LABEL], "rel");
    }

    #[test]
    fn service_color_selector() {
        let svc = serde_json::json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web"}, "spec": {"selector": {"app": "web"}}});
        let mut r = Resource::from_json(svc, Some("ns")).unwrap();
        r.add_color_selector(Color::Green);
        assert_eq!(r.selector().unwrap()[keys::COLOR_LABEL], "green");
        assert_eq!(r.selector().unwrap()["app"], "web");
    }

    #[test]
    fn resource_id_parse_and_display() {
        let id = ResourceId::parse("ns/ConfigMap/cfg", None).unwrap();
        assert_eq!(id.to_string(), "ns/ConfigMap/cfg");
        let id = ResourceId::parse("ConfigMap/cfg", Some("dflt")).unwrap();
        assert_eq!(id.namespace.as_deref(), Some("dflt"));
        assert!(ResourceId::parse("cfg", None).is_err());
    }

    #[test]
    fn colors_alternate() {
        assert_eq!(Color::Blue.opposite(), Color::Green);
        assert_eq!(Color::parse("green").map(|c| c.opposite()), Some(Color::Blue));
        assert_eq!(Color::parse("default"), None);
    }
}
