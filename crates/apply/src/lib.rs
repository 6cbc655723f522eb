//! Tern apply: manifest parsing with size budgets, SSA helpers and minimal diffs.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kube::{api::{Api, Patch, PatchParams}, core::DynamicObject};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tern_core::Resource;
use tracing::{debug, warn};

fn max_yaml_bytes() -> usize {
    std::env::var("TERN_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("TERN_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200_000)
}

/// True once `v` holds `max` or more JSON nodes. Stops counting at the cap.
fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    let mut stack = vec![v];
    let mut seen = 0usize;
    while let Some(node) = stack.pop() {
        seen += 1;
        if seen >= max {
            return true;
        }
        match node {
            Json::Object(map) => stack.extend(map.values()),
            Json::Array(arr) => stack.extend(arr.iter()),
            _ => {}
        }
    }
    false
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub created: bool,
    pub new_rv: Option<String>,
    pub summary: DiffSummary,
}

/// Parse a multi-document manifest stream. `kind: List` documents are expanded;
/// empty documents are skipped.
pub fn parse_manifests(yaml: &str, default_ns: Option<&str>) -> Result<Vec<Resource>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
        }
        if json.get("kind").and_then(|k| k.as_str()) == Some("List") {
            let items = json.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
            for item in items {
                out.push(Resource::from_json(item, default_ns).with_context(|| format!("document {} (List item)", idx))?);
            }
            continue;
        }
        out.push(Resource::from_json(json, default_ns).with_context(|| format!("document {}", idx))?);
    }
    debug!(count = out.len(), "parsed manifests");
    Ok(out)
}

/// Read every `.yaml`/`.yml` file under the given paths (directories are walked one level).
pub fn read_manifest_paths(paths: &[PathBuf], default_ns: Option<&str>) -> Result<Vec<Resource>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for p in paths {
        if p.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(p)
                .with_context(|| format!("reading manifest dir {}", p.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| is_yaml(p))
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(p.clone());
        }
    }
    let mut out = Vec::new();
    for f in files {
        let text = std::fs::read_to_string(&f).with_context(|| format!("reading manifest {}", f.display()))?;
        out.extend(parse_manifests(&text, default_ns).with_context(|| format!("in {}", f.display()))?);
    }
    Ok(out)
}

fn is_yaml(p: &Path) -> bool {
    matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

/// Server-side apply one object, returning the diff against the live copy.
pub async fn apply_object(api: &Api<DynamicObject>, resource: &Resource, field_manager: &str) -> Result<ApplyResult> {
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);
    let name = resource.name();
    let live_json = match api.get_opt(name).await.with_context(|| format!("reading live {}", resource.id))? {
        Some(obj) => Some(strip_noisy(serde_json::to_value(&obj)?)),
        None => None,
    };
    let summary = diff_summary(&strip_noisy(resource.spec.clone()), live_json.as_ref().unwrap_or(&Json::Null));

    let pp = PatchParams::apply(field_manager).force();
    let obj = match api.patch(name, &pp, &Patch::Apply(&resource.spec)).await {
        Ok(o) => o,
        Err(e) => {
            counter!("apply_err", 1u64);
            warn!(resource = %resource.id, error = %e, "server-side apply failed");
            return Err(anyhow!("server-side apply of {} failed: {}", resource.id, e));
        }
    };
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64);
    Ok(ApplyResult { created: live_json.is_none(), new_rv: obj.metadata.resource_version.clone(), summary })
}

/// Server-populated metadata dropped before diffing or re-applying a live object.
const NOISY_METADATA: &[&str] = &["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"];

/// Remove server-owned fields (and `status`) so a live object can be compared with,
/// or re-applied as, a desired manifest.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.retain(|k, _| !NOISY_METADATA.contains(&k.as_str()));
        }
    }
    v
}

impl DiffSummary {
    fn record(&mut self, desired: &Json, live: &Json) {
        match (desired, live) {
            (Json::Object(d), Json::Object(l)) => {
                for (k, dv) in d {
                    match l.get(k) {
                        None => self.adds += 1,
                        Some(lv) if lv != dv => self.record(dv, lv),
                        Some(_) => {}
                    }
                }
                self.removes += l.keys().filter(|k| !d.contains_key(k.as_str())).count();
            }
            (Json::Array(d), Json::Array(l)) => {
                self.updates += d.iter().zip(l).filter(|(a, b)| a != b).count();
                self.adds += d.len().saturating_sub(l.len());
                self.removes += l.len().saturating_sub(d.len());
            }
            (_, Json::Null) => self.adds += 1,
            (d, l) if d != l => self.updates += 1,
            _ => {}
        }
    }
}

/// Field-level change counts going from `live` to `desired`.
pub fn diff_summary(desired: &Json, live: &Json) -> DiffSummary {
    let mut s = DiffSummary::default();
    s.record(desired, live);
    s
}
