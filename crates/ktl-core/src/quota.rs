//! Per-namespace resource rollups for the desired set.
//!
//! Pod totals multiply by the workload's replica count where that is
//! knowable; DaemonSets and CronJobs are estimated at one pod with a
//! warning. Live `ResourceQuota`/`LimitRange` context is attached
//! best-effort.

use std::collections::BTreeMap;

use serde_yaml::Value;

use ktl_manifest::ManifestIndex;
use ktl_types::{Quantity, QuotaRollup, ResourceKey, parse_quantity};

use crate::client::KubeClient;
use crate::graph::{is_workload_kind, pod_spec};

/// Estimate rollups for every namespace the desired set touches.
/// Returns the rollups plus accumulated warnings.
pub fn estimate(
    desired: &ManifestIndex,
    default_ns: &str,
) -> (BTreeMap<String, QuotaRollup>, Vec<String>) {
    let mut rollups: BTreeMap<String, QuotaRollup> = BTreeMap::new();
    let mut warnings = Vec::new();

    for (key, doc) in desired.iter() {
        let ns = if key.namespace.is_empty() {
            default_ns.to_string()
        } else {
            key.namespace.clone()
        };
        let rollup = rollups.entry(ns).or_default();

        match key.kind.as_str() {
            "Service" => rollup.services += 1,
            "ConfigMap" => rollup.configmaps += 1,
            "Secret" => rollup.secrets += 1,
            "PersistentVolumeClaim" => {
                rollup.pvcs += 1;
                accumulate_pvc_storage(key, &doc.value, rollup, &mut warnings);
            }
            _ if is_workload_kind(&key.kind) => {
                accumulate_workload(key, &doc.value, rollup, &mut warnings);
            }
            _ => {}
        }
    }

    (rollups, warnings)
}

/// Attach live quota context to each rollup. Lookup failure is non-fatal
/// and comes back as a warning.
pub fn augment_live(
    rollups: &mut BTreeMap<String, QuotaRollup>,
    client: &dyn KubeClient,
) -> Vec<String> {
    let mut warnings = Vec::new();
    for (namespace, rollup) in rollups.iter_mut() {
        match client.resource_quotas(namespace) {
            Ok(quotas) => rollup.live_quotas = quotas,
            Err(err) => warnings.push(format!(
                "could not read ResourceQuota objects in {namespace}: {err}"
            )),
        }
        match client.limit_ranges(namespace) {
            Ok(ranges) => rollup.limit_ranges = ranges,
            Err(err) => warnings.push(format!(
                "could not read LimitRange objects in {namespace}: {err}"
            )),
        }
    }
    warnings
}

/// Replica multiplier for one workload, with estimation warnings where the
/// real count is not knowable from the manifest.
fn replica_count(key: &ResourceKey, value: &Value, warnings: &mut Vec<String>) -> i64 {
    let spec = value.get("spec");
    match key.kind.as_str() {
        "Deployment" | "StatefulSet" | "ReplicaSet" => spec
            .and_then(|s| s.get("replicas"))
            .and_then(Value::as_i64)
            .unwrap_or(1),
        "DaemonSet" => {
            warnings.push(format!(
                "DaemonSet {} runs one pod per node; estimating 1 pod for quota purposes",
                key.name
            ));
            1
        }
        "CronJob" => {
            warnings.push(format!(
                "CronJob {} pod count depends on schedule; estimating 1 active pod",
                key.name
            ));
            1
        }
        "Job" => {
            let parallelism = spec.and_then(|s| s.get("parallelism")).and_then(Value::as_i64);
            let completions = spec.and_then(|s| s.get("completions")).and_then(Value::as_i64);
            if parallelism.is_none() && completions.is_none() {
                warnings.push(format!(
                    "Job {} sets neither parallelism nor completions; estimating 1 pod",
                    key.name
                ));
            }
            parallelism.unwrap_or(0).max(completions.unwrap_or(0)).max(1)
        }
        _ => 1,
    }
}

fn accumulate_workload(
    key: &ResourceKey,
    value: &Value,
    rollup: &mut QuotaRollup,
    warnings: &mut Vec<String>,
) {
    let replicas = replica_count(key, value, warnings);
    rollup.pods += replicas.max(0) as u32;

    let Some(spec) = pod_spec(&key.kind, value) else {
        return;
    };
    let Some(containers) = spec.get("containers").and_then(Value::as_sequence) else {
        return;
    };

    let mut cpu_requests = Quantity::ZERO;
    let mut cpu_limits = Quantity::ZERO;
    let mut memory_requests = Quantity::ZERO;
    let mut memory_limits = Quantity::ZERO;
    let mut declared_any = false;

    for container in containers {
        let container_name = container
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>");
        let resources = container.get("resources");
        for (section, cpu_total, memory_total) in [
            ("requests", &mut cpu_requests, &mut memory_requests),
            ("limits", &mut cpu_limits, &mut memory_limits),
        ] {
            let Some(section_value) = resources.and_then(|r| r.get(section)) else {
                continue;
            };
            for (field, total) in [("cpu", &mut *cpu_total), ("memory", &mut *memory_total)] {
                let Some(raw) = section_value.get(field).and_then(Value::as_str) else {
                    // Bare numbers parse as YAML integers.
                    if let Some(n) = section_value.get(field).and_then(Value::as_i64) {
                        *total = *total + parse_or_warn(&n.to_string(), key, container_name, warnings);
                        declared_any = true;
                    }
                    continue;
                };
                *total = *total + parse_or_warn(raw, key, container_name, warnings);
                declared_any = true;
            }
        }
    }

    if !declared_any {
        warnings.push(format!(
            "{} {} ({}) declares no resource requests or limits; quota estimates may be incomplete",
            key.kind, key.name, rollup_ns(key)
        ));
    }

    let multiply = |q: Quantity| Quantity {
        nanos: q.nanos.saturating_mul(replicas.max(0) as i128),
    };
    rollup.cpu_requests = rollup.cpu_requests + multiply(cpu_requests);
    rollup.cpu_limits = rollup.cpu_limits + multiply(cpu_limits);
    rollup.memory_requests = rollup.memory_requests + multiply(memory_requests);
    rollup.memory_limits = rollup.memory_limits + multiply(memory_limits);
}

fn rollup_ns(key: &ResourceKey) -> &str {
    if key.namespace.is_empty() {
        "default"
    } else {
        &key.namespace
    }
}

fn parse_or_warn(
    raw: &str,
    key: &ResourceKey,
    container: &str,
    warnings: &mut Vec<String>,
) -> Quantity {
    match parse_quantity(raw) {
        Ok(q) => q,
        Err(_) => {
            warnings.push(format!(
                "skipping unparseable quantity {raw:?} on {}/{}/{container}",
                key.kind, key.name
            ));
            Quantity::ZERO
        }
    }
}

fn accumulate_pvc_storage(
    key: &ResourceKey,
    value: &Value,
    rollup: &mut QuotaRollup,
    warnings: &mut Vec<String>,
) {
    let Some(raw) = value
        .get("spec")
        .and_then(|s| s.get("resources"))
        .and_then(|r| r.get("requests"))
        .and_then(|r| r.get("storage"))
        .and_then(Value::as_str)
    else {
        return;
    };
    rollup.storage = rollup.storage + parse_or_warn(raw, key, "-", warnings);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_types::{format_bytes, format_cpu};

    fn index(manifest: &str) -> ManifestIndex {
        ManifestIndex::parse(manifest).unwrap()
    }

    const DEPLOYMENT: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: app
          resources:
            requests:
              cpu: 250m
              memory: 256Mi
            limits:
              cpu: 500m
              memory: 512Mi
";

    #[test]
    fn deployment_totals_multiply_by_replicas() {
        let (rollups, warnings) = estimate(&index(DEPLOYMENT), "default");
        let rollup = &rollups["prod"];
        assert_eq!(format_cpu(rollup.cpu_requests), "750m");
        assert_eq!(format_cpu(rollup.cpu_limits), "1500m");
        assert_eq!(format_bytes(rollup.memory_requests), "768Mi");
        assert_eq!(format_bytes(rollup.memory_limits), "1536Mi");
        assert_eq!(rollup.pods, 3);
        assert!(warnings.is_empty());
    }

    #[test]
    fn daemonset_estimates_one_pod_with_warning() {
        let manifest = "\
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: agent
  namespace: prod
spec:
  template:
    spec:
      containers:
        - name: agent
          resources:
            requests:
              cpu: 100m
";
        let (rollups, warnings) = estimate(&index(manifest), "default");
        assert_eq!(rollups["prod"].pods, 1);
        assert!(warnings.iter().any(|w| w.contains("one pod per node")));
    }

    #[test]
    fn job_uses_max_of_parallelism_and_completions() {
        let manifest = "\
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  namespace: prod
spec:
  parallelism: 2
  completions: 5
  template:
    spec:
      containers:
        - name: run
          resources:
            requests:
              cpu: 1
";
        let (rollups, _) = estimate(&index(manifest), "default");
        assert_eq!(rollups["prod"].pods, 5);
        assert_eq!(format_cpu(rollups["prod"].cpu_requests), "5000m");
    }

    #[test]
    fn job_without_counts_warns_and_estimates_one() {
        let manifest = "\
apiVersion: batch/v1
kind: Job
metadata:
  name: once
  namespace: prod
spec:
  template:
    spec:
      containers:
        - name: run
          resources:
            requests:
              cpu: 1
";
        let (rollups, warnings) = estimate(&index(manifest), "default");
        assert_eq!(rollups["prod"].pods, 1);
        assert!(warnings.iter().any(|w| w.contains("neither parallelism")));
    }

    #[test]
    fn workload_without_resources_warns_incomplete() {
        let manifest = "\
apiVersion: v1
kind: Pod
metadata:
  name: p
  namespace: prod
spec:
  containers:
    - name: c
      image: busybox
";
        let (rollups, warnings) = estimate(&index(manifest), "default");
        assert_eq!(rollups["prod"].pods, 1);
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("quota estimates may be incomplete"))
        );
    }

    #[test]
    fn unparseable_quantity_names_the_source() {
        let manifest = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
spec:
  template:
    spec:
      containers:
        - name: app
          resources:
            requests:
              cpu: lots
";
        let (_, warnings) = estimate(&index(manifest), "default");
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("\"lots\"") && w.contains("Deployment/web/app"))
        );
    }

    #[test]
    fn pvc_storage_and_object_counts_accumulate() {
        let manifest = "\
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: data
  namespace: prod
spec:
  resources:
    requests:
      storage: 10Gi
---
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: prod
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  namespace: prod
---
apiVersion: v1
kind: Secret
metadata:
  name: sec
  namespace: prod
";
        let (rollups, _) = estimate(&index(manifest), "default");
        let rollup = &rollups["prod"];
        assert_eq!(format_bytes(rollup.storage), "10Gi");
        assert_eq!(
            (rollup.pvcs, rollup.services, rollup.configmaps, rollup.secrets),
            (1, 1, 1, 1)
        );
    }

    #[test]
    fn namespaces_roll_up_independently() {
        let manifest = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
  namespace: one
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: b
";
        let (rollups, _) = estimate(&index(manifest), "fallback");
        assert_eq!(rollups["one"].configmaps, 1);
        assert_eq!(rollups["fallback"].configmaps, 1);
    }
}
