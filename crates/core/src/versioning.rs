//! Release-number suffixing and release/color labeling of manifests.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value as Json;

use crate::{keys, Color, Resource};

/// Kinds versioned by default. Each release gets fresh objects named `<name>-<n>`.
pub const VERSIONED_KINDS: &[&str] = &["ConfigMap", "Secret", "Deployment", "StatefulSet", "DaemonSet"];

/// Flag resources that take part in suffix versioning. Opt out per resource
/// with the skip-versioning annotation.
pub fn mark_versioned(resources: &mut [Resource]) {
    for r in resources.iter_mut() {
        r.versioned = VERSIONED_KINDS.contains(&r.kind()) && !r.annotation_is_true(keys::SKIP_VERSIONING);
    }
}

/// Append `-<n>` to every versioned resource and to every reference to it in the set.
/// Resources already suffixed with `n` are left alone, so repeating the call is a
/// no-op. One suffixed with another number is renamed from its base name.
pub fn add_revision_suffix(resources: &mut [Resource], release_number: u32) -> Vec<(String, String)> {
    let suffix = format!("-{}", release_number);
    let mut renamed: HashMap<(String, String), String> = HashMap::new();
    let mut log = Vec::new();
    for r in resources.iter_mut().filter(|r| r.versioned) {
        let old = r.name().to_string();
        match r.suffixed_with {
            Some(n) if n == release_number => continue,
            Some(n) => {
                let base = old.strip_suffix(&format!("-{}", n)).unwrap_or(&old).to_string();
                r.set_name(&base);
            }
            None => {}
        }
        r.append_name_suffix(&suffix);
        r.suffixed_with = Some(release_number);
        renamed.insert((r.kind().to_string(), old.clone()), r.name().to_string());
        log.push((old, r.name().to_string()));
    }
    if renamed.is_empty() {
        return log;
    }
    for r in resources.iter_mut() {
        rewrite_references(r, &renamed);
    }
    log
}

fn rewrite_references(r: &mut Resource, renamed: &HashMap<(String, String), String>) {
    let kind = r.kind().to_string();
    if kind == "HorizontalPodAutoscaler" {
        if let Some(target) = r.spec.pointer_mut("/spec/scaleTargetRef") {
            let target_kind = target.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            rename_field(target, "name", &target_kind, renamed);
        }
        return;
    }
    let pod_path = match kind.as_str() {
        "Pod" => "/spec",
        "CronJob" => "/spec/jobTemplate/spec/template/spec",
        k if crate::kinds::has_pod_template(k) => "/spec/template/spec",
        _ => return,
    };
    if let Some(pod) = r.spec.pointer_mut(pod_path) {
        rewrite_pod_spec(pod, renamed);
    }
}

fn rewrite_pod_spec(pod: &mut Json, renamed: &HashMap<(String, String), String>) {
    for vol in array_mut(pod, "volumes") {
        if let Some(cm) = vol.get_mut("configMap") {
            rename_field(cm, "name", "ConfigMap", renamed);
        }
        if let Some(sec) = vol.get_mut("secret") {
            rename_field(sec, "secretName", "Secret", renamed);
        }
        if let Some(projected) = vol.get_mut("projected") {
            for src in array_mut(projected, "sources") {
                if let Some(cm) = src.get_mut("configMap") {
                    rename_field(cm, "name", "ConfigMap", renamed);
                }
                if let Some(sec) = src.get_mut("secret") {
                    rename_field(sec, "name", "Secret", renamed);
                }
            }
        }
    }
    for secret in array_mut(pod, "imagePullSecrets") {
        rename_field(secret, "name", "Secret", renamed);
    }
    for field in ["containers", "initContainers"] {
        for c in array_mut(pod, field) {
            for from in array_mut(c, "envFrom") {
                if let Some(cm) = from.get_mut("configMapRef") {
                    rename_field(cm, "name", "ConfigMap", renamed);
                }
                if let Some(sec) = from.get_mut("secretRef") {
                    rename_field(sec, "name", "Secret", renamed);
                }
            }
            for env in array_mut(c, "env") {
                if let Some(vf) = env.get_mut("valueFrom") {
                    if let Some(cm) = vf.get_mut("configMapKeyRef") {
                        rename_field(cm, "name", "ConfigMap", renamed);
                    }
                    if let Some(sec) = vf.get_mut("secretKeyRef") {
                        rename_field(sec, "name", "Secret", renamed);
                    }
                }
            }
        }
    }
}

fn array_mut<'a>(v: &'a mut Json, key: &str) -> std::slice::IterMut<'a, Json> {
    match v.get_mut(key).and_then(|a| a.as_array_mut()) {
        Some(arr) => arr.iter_mut(),
        None => (&mut []).iter_mut(),
    }
}

fn rename_field(obj: &mut Json, field: &str, kind: &str, renamed: &HashMap<(String, String), String>) {
    let Some(cur) = obj.get(field).and_then(|v| v.as_str()) else { return };
    if let Some(new_name) = renamed.get(&(kind.to_string(), cur.to_string())) {
        obj[field] = Json::String(new_name.clone());
    }
}

/// Stamp the release-name label (and color, when given) on pod templates.
pub fn label_pod_spec(resources: &mut [Resource], release_name: &str, color: Option<Color>) {
    let labels = release_labels(release_name, color);
    for r in resources.iter_mut() {
        r.add_pod_template_labels(&labels);
    }
}

/// Stamp the same labels onto workload selectors.
pub fn label_selector(resources: &mut [Resource], release_name: &str, color: Option<Color>) {
    let labels = release_labels(release_name, color);
    for r in resources.iter_mut().filter(|r| crate::kinds::MANAGED_WORKLOAD_KINDS.contains(&r.kind())) {
        r.add_selector_labels(&labels);
    }
}

pub fn release_labels(release_name: &str, color: Option<Color>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(keys::RELEASE_NAME_LABEL.to_string(), release_name.to_string());
    if let Some(c) = color {
        labels.insert(keys::COLOR_LABEL.to_string(), c.as_str().to_string());
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> Vec<Resource> {
        let cm = serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}, "data": {"k": "v"}});
        let sec = serde_json::json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "creds"}});
        let pinned = serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "pinned", "annotations": {(keys::SKIP_VERSIONING): "true"}}});
        let dep = serde_json::json!({
            "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "app"},
            "spec": {"template": {"spec": {
                "volumes": [{"name": "c", "configMap": {"name": "cfg"}}, {"name": "p", "configMap": {"name": "pinned"}}],
                "imagePullSecrets": [{"name": "creds"}],
                "containers": [{"name": "main",
                    "envFrom": [{"secretRef": {"name": "creds"}}],
                    "env": [{"name": "K", "valueFrom": {"configMapKeyRef": {"name": "cfg", "key": "k"}}}]
                }]
            }}}
        });
        let hpa = serde_json::json!({"apiVersion": "autoscaling/v2", "kind": "HorizontalPodAutoscaler", "metadata": {"name": "app"},
            "spec": {"scaleTargetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "app"}}});
        let mut out: Vec<Resource> = [cm, sec, pinned, dep, hpa].into_iter().map(|d| Resource::from_json(d, Some("ns")).unwrap()).collect();
        mark_versioned(&mut out);
        out
    }

    #[test]
    fn suffix_renames_objects_and_references() {
        let mut rs = set();
        add_revision_suffix(&mut rs, 1);
        let names: Vec<&str> = rs.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["cfg-1", "creds-1", "pinned", "app-1", "app"]);
        let pod = &rs[3].spec["spec"]["template"]["spec"];
        assert_eq!(pod["volumes"][0]["configMap"]["name"], "cfg-1");
        assert_eq!(pod["volumes"][1]["configMap"]["name"], "pinned");
        assert_eq!(pod["imagePullSecrets"][0]["name"], "creds-1");
        assert_eq!(pod["containers"][0]["envFrom"][0]["secretRef"]["name"], "creds-1");
        assert_eq!(pod["containers"][0]["env"][0]["valueFrom"]["configMapKeyRef"]["name"], "cfg-1");
        assert_eq!(rs[4].spec["spec"]["scaleTargetRef"]["name"], "app-1");
    }

    #[test]
    fn suffix_is_idempotent_for_same_number() {
        let mut once = set();
        add_revision_suffix(&mut once, 3);
        let mut twice = once.clone();
        let renamed = add_revision_suffix(&mut twice, 3);
        assert!(renamed.is_empty());
        assert_eq!(once, twice);
    }

    #[test]
    fn user_names_ending_in_a_number_still_get_suffixed() {
        let doc = serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "db-1"}});
        let mut rs = vec![Resource::from_json(doc, Some("ns")).unwrap()];
        mark_versioned(&mut rs);
        add_revision_suffix(&mut rs, 1);
        assert_eq!(rs[0].name(), "db-1-1");
        assert!(add_revision_suffix(&mut rs, 1).is_empty());
        assert_eq!(rs[0].name(), "db-1-1");

        add_revision_suffix(&mut rs, 2);
        assert_eq!(rs[0].name(), "db-1-2");
        assert_eq!(rs[0].spec["metadata"]["name"], "db-1-2");
    }

    #[test]
    fn labels_land_on_template_and_selector() {
        let mut rs = set();
        label_pod_spec(&mut rs, "rel", Some(Color::Blue));
        label_selector(&mut rs, "rel", Some(Color::Blue));
        let dep = &rs[3].spec;
        assert_eq!(dep["spec"]["template"]["metadata"]["labels"][keys::COLOR_LABEL], "blue");
        assert_eq!(dep["spec"]["selector"]["matchLabels"][keys::RELEASE_NAME_LABEL], "rel");
        assert!(rs[0].spec.get("spec").is_none());
    }
}
