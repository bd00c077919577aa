//! Dependency graph over rendered workloads.
//!
//! Walks every pod-spec-bearing object in the desired set and extracts its
//! references to ConfigMaps, Secrets, PVCs, and ServiceAccounts. Reference
//! targets that exist in the desired set become `rendered` nodes, anything
//! else is `external`. Output ordering is fixed so successive plan runs
//! produce identical artifacts.

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::Value;

use ktl_manifest::ManifestIndex;
use ktl_types::{DependencyGraph, GraphEdge, GraphNode, NodeSource, ResourceKey};

/// Kinds whose pod spec we walk.
pub const WORKLOAD_KINDS: &[&str] = &[
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "ReplicaSet",
    "Job",
    "CronJob",
    "Pod",
];

/// Kinds a pod spec can reference.
const REFERENCE_KINDS: &[&str] = &[
    "ConfigMap",
    "Secret",
    "PersistentVolumeClaim",
    "ServiceAccount",
];

pub fn is_workload_kind(kind: &str) -> bool {
    WORKLOAD_KINDS.iter().any(|k| k.eq_ignore_ascii_case(kind))
}

/// Locate the pod spec wherever it lives in the object.
pub fn pod_spec<'a>(kind: &str, value: &'a Value) -> Option<&'a Value> {
    match kind {
        "Pod" => value.get("spec"),
        "CronJob" => value
            .get("spec")?
            .get("jobTemplate")?
            .get("spec")?
            .get("template")?
            .get("spec"),
        _ => value.get("spec")?.get("template")?.get("spec"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Reference {
    kind: &'static str,
    name: String,
    reason: String,
}

/// Build the dependency graph for one desired set.
///
/// `live_keys` marks which desired objects currently exist in the cluster;
/// external reference targets are never looked up and report `live: false`.
pub fn build(
    desired: &ManifestIndex,
    live_keys: &BTreeSet<ResourceKey>,
    default_ns: &str,
) -> DependencyGraph {
    let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
    let mut edges: BTreeSet<GraphEdge> = BTreeSet::new();

    // Rendered nodes: every workload and every referenceable object in the
    // chart, whether or not anything points at it yet.
    for (key, doc) in desired.iter() {
        if !is_workload_kind(&key.kind) && !is_reference_kind(&key.kind) {
            continue;
        }
        let node = rendered_node(key, &doc.value, live_keys.contains(key), default_ns);
        nodes.insert(node.id.clone(), node);
    }

    for (key, doc) in desired.iter() {
        if !is_workload_kind(&key.kind) {
            continue;
        }
        let Some(spec) = pod_spec(&key.kind, &doc.value) else {
            continue;
        };
        let from_id = node_id(&key.kind, effective_ns(key, default_ns), &key.name);
        let ns = effective_ns(key, default_ns).to_string();

        for reference in collect_references(spec) {
            let to_id = node_id(reference.kind, &ns, &reference.name);
            nodes.entry(to_id.clone()).or_insert_with(|| {
                // Not part of the chart: the reference points outside the
                // desired set.
                GraphNode {
                    id: to_id.clone(),
                    kind: reference.kind.to_string(),
                    namespace: ns.clone(),
                    name: reference.name.clone(),
                    source: NodeSource::External,
                    live: false,
                    meta: BTreeMap::new(),
                }
            });
            edges.insert(GraphEdge {
                from: from_id.clone(),
                to: to_id,
                reason: reference.reason,
            });
        }
    }

    let mut node_list: Vec<GraphNode> = nodes.into_values().collect();
    node_list.sort_by(|a, b| {
        (&a.namespace, &a.kind, &a.name).cmp(&(&b.namespace, &b.kind, &b.name))
    });

    DependencyGraph {
        nodes: node_list,
        edges: edges.into_iter().collect(),
    }
}

fn is_reference_kind(kind: &str) -> bool {
    REFERENCE_KINDS.iter().any(|k| k.eq_ignore_ascii_case(kind))
}

fn effective_ns<'a>(key: &'a ResourceKey, default_ns: &'a str) -> &'a str {
    if key.namespace.is_empty() {
        default_ns
    } else {
        &key.namespace
    }
}

fn node_id(kind: &str, namespace: &str, name: &str) -> String {
    let ns = if namespace.is_empty() { "cluster" } else { namespace };
    format!("{ns}|{kind}|{name}").to_lowercase()
}

fn rendered_node(
    key: &ResourceKey,
    value: &Value,
    live: bool,
    default_ns: &str,
) -> GraphNode {
    let ns = effective_ns(key, default_ns);
    let mut meta = BTreeMap::new();
    match key.kind.as_str() {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let replicas = value
                .get("spec")
                .and_then(|s| s.get("replicas"))
                .and_then(Value::as_i64)
                .unwrap_or(1);
            meta.insert("replicas".to_string(), replicas.to_string());
        }
        "ConfigMap" => {
            let keys = value
                .get("data")
                .and_then(Value::as_mapping)
                .map(|m| m.len())
                .unwrap_or(0)
                + value
                    .get("binaryData")
                    .and_then(Value::as_mapping)
                    .map(|m| m.len())
                    .unwrap_or(0);
            meta.insert("keys".to_string(), keys.to_string());
        }
        "PersistentVolumeClaim" => {
            if let Some(size) = value
                .get("spec")
                .and_then(|s| s.get("resources"))
                .and_then(|r| r.get("requests"))
                .and_then(|r| r.get("storage"))
                .and_then(Value::as_str)
            {
                meta.insert("request".to_string(), size.to_string());
            }
        }
        _ => {}
    }
    if is_workload_kind(&key.kind) {
        if let Some(spec) = pod_spec(&key.kind, value) {
            let containers = spec
                .get("containers")
                .and_then(Value::as_sequence)
                .map(|s| s.len())
                .unwrap_or(0);
            meta.insert("containers".to_string(), containers.to_string());
        }
    }
    GraphNode {
        id: node_id(&key.kind, ns, &key.name),
        kind: key.kind.clone(),
        namespace: ns.to_string(),
        name: key.name.clone(),
        source: NodeSource::Rendered,
        live,
        meta,
    }
}

/// Every `(target kind, target name, reason)` reference in one pod spec.
fn collect_references(spec: &Value) -> Vec<Reference> {
    let mut refs = Vec::new();

    if let Some(volumes) = spec.get("volumes").and_then(Value::as_sequence) {
        for volume in volumes {
            let Some(vol_name) = volume.get("name").and_then(Value::as_str) else {
                continue;
            };
            if let Some(name) = volume
                .get("configMap")
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
            {
                refs.push(reference("ConfigMap", name, format!("volume:{vol_name}")));
            }
            if let Some(secret) = volume.get("secret") {
                // Pod volumes use `secretName`; projected sources use `name`.
                let name = secret
                    .get("secretName")
                    .or_else(|| secret.get("name"))
                    .and_then(Value::as_str);
                if let Some(name) = name {
                    refs.push(reference("Secret", name, format!("volume:{vol_name}")));
                }
            }
            if let Some(claim) = volume
                .get("persistentVolumeClaim")
                .and_then(|p| p.get("claimName"))
                .and_then(Value::as_str)
            {
                refs.push(reference(
                    "PersistentVolumeClaim",
                    claim,
                    format!("pvc:{vol_name}"),
                ));
            }
            if let Some(sources) = volume
                .get("projected")
                .and_then(|p| p.get("sources"))
                .and_then(Value::as_sequence)
            {
                for source in sources {
                    if let Some(name) = source
                        .get("configMap")
                        .and_then(|c| c.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(reference("ConfigMap", name, format!("volume:{vol_name}")));
                    }
                    if let Some(name) = source
                        .get("secret")
                        .and_then(|s| s.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(reference("Secret", name, format!("volume:{vol_name}")));
                    }
                }
            }
        }
    }

    for container_field in ["containers", "initContainers", "ephemeralContainers"] {
        let Some(containers) = spec.get(container_field).and_then(Value::as_sequence) else {
            continue;
        };
        for container in containers {
            let Some(container_name) = container.get("name").and_then(Value::as_str) else {
                continue;
            };
            if let Some(env) = container.get("env").and_then(Value::as_sequence) {
                for entry in env {
                    let Some(var_name) = entry.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(value_from) = entry.get("valueFrom") else {
                        continue;
                    };
                    if let Some(name) = value_from
                        .get("configMapKeyRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(reference(
                            "ConfigMap",
                            name,
                            format!("env:{container_name}/{var_name}"),
                        ));
                    }
                    if let Some(name) = value_from
                        .get("secretKeyRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(reference(
                            "Secret",
                            name,
                            format!("env:{container_name}/{var_name}"),
                        ));
                    }
                }
            }
            if let Some(env_from) = container.get("envFrom").and_then(Value::as_sequence) {
                for entry in env_from {
                    if let Some(name) = entry
                        .get("configMapRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(reference("ConfigMap", name, format!("envFrom:{container_name}")));
                    }
                    if let Some(name) = entry
                        .get("secretRef")
                        .and_then(|r| r.get("name"))
                        .and_then(Value::as_str)
                    {
                        refs.push(reference("Secret", name, format!("envFrom:{container_name}")));
                    }
                }
            }
        }
    }

    if let Some(pull_secrets) = spec.get("imagePullSecrets").and_then(Value::as_sequence) {
        for entry in pull_secrets {
            if let Some(name) = entry.get("name").and_then(Value::as_str) {
                refs.push(reference("Secret", name, "imagePullSecret".to_string()));
            }
        }
    }

    if let Some(sa) = spec.get("serviceAccountName").and_then(Value::as_str) {
        refs.push(reference("ServiceAccount", sa, "serviceAccount".to_string()));
    }

    refs
}

fn reference(kind: &'static str, name: &str, reason: String) -> Reference {
    Reference {
        kind,
        name: name.to_string(),
        reason,
    }
}
