//! Background readiness tracking during an apply.
//!
//! The tracker polls every object named by the pre-rendered manifest and
//! fans snapshots out as `Resources` events, with `Health` aggregates on
//! transitions. Polling starts fast and backs off while nothing changes.
//! The tracker always terminates before the engine reports final status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use serde_yaml::Value;

use ktl_events::EventBus;
use ktl_types::{
    EventKind, HealthPayload, LogLevel, LogPayload, ResourceKey, ResourcePhase, ResourceStatus,
    ResourcesPayload,
};

use crate::cancel::CancelToken;
use crate::client::{KubeClient, RestMapping, lookup_namespace};

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// First poll interval; reset to this on any observed change.
    pub initial_interval: Duration,
    /// Backoff ceiling while snapshots are unchanged.
    pub max_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(2),
        }
    }
}

/// Handle to a running tracker thread.
pub struct TrackerHandle {
    stop: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    /// Stop polling and wait for the tracker thread to finish.
    pub fn stop(mut self) {
        self.stop.cancel("tracker stopped");
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Start tracking `keys` on a background thread. The tracker stops when
/// either `cancel` (the apply context) or its own handle fires.
pub fn spawn(
    client: Arc<dyn KubeClient>,
    keys: Vec<ResourceKey>,
    default_ns: String,
    bus: EventBus,
    cancel: CancelToken,
    config: TrackerConfig,
) -> TrackerHandle {
    let stop = CancelToken::new();
    let own_stop = stop.clone();
    let worker = thread::Builder::new()
        .name("resource-tracker".to_string())
        .spawn(move || run(client, keys, &default_ns, bus, cancel, own_stop, config))
        .expect("failed to spawn tracker thread");
    TrackerHandle {
        stop,
        worker: Some(worker),
    }
}

fn run(
    client: Arc<dyn KubeClient>,
    keys: Vec<ResourceKey>,
    default_ns: &str,
    bus: EventBus,
    cancel: CancelToken,
    stop: CancelToken,
    config: TrackerConfig,
) {
    let mut statuses: BTreeMap<ResourceKey, ResourceStatus> = BTreeMap::new();
    let mut mappings: BTreeMap<ResourceKey, Option<RestMapping>> = BTreeMap::new();
    let mut skipped_logged = false;
    let mut interval = config.initial_interval;
    let mut last_health = HealthPayload::default();

    loop {
        if cancel.is_cancelled() || stop.is_cancelled() {
            return;
        }

        let mut changed = false;
        for key in &keys {
            let mapping = mappings.entry(key.clone()).or_insert_with(|| {
                match client.map_kind(&key.group, &key.version, &key.kind) {
                    Ok(mapping) => mapping,
                    Err(_) => None,
                }
            });
            let Some(mapping) = mapping else {
                if !skipped_logged {
                    bus.log(LogPayload::new(
                        LogLevel::Debug,
                        "tracker",
                        format!("skipping {key}: kind not served by this cluster"),
                    ));
                }
                continue;
            };

            let namespace = lookup_namespace(mapping, key, default_ns);
            let object = client.get_dynamic(mapping, namespace, &key.name).ok().flatten();
            let (phase, message) = classify(&key.kind, object.as_ref());

            let now = Utc::now();
            match statuses.get_mut(key) {
                Some(existing) => {
                    if existing.phase != phase || existing.message != message {
                        existing.phase = phase;
                        existing.message = message;
                        existing.last_update = now;
                        changed = true;
                    }
                }
                None => {
                    statuses.insert(
                        key.clone(),
                        ResourceStatus {
                            kind: key.kind.clone(),
                            namespace: namespace.unwrap_or("").to_string(),
                            name: key.name.clone(),
                            phase,
                            message,
                            first_seen: now,
                            last_update: now,
                        },
                    );
                    changed = true;
                }
            }
        }
        skipped_logged = true;

        bus.emit(EventKind::Resources(ResourcesPayload {
            resources: statuses.values().cloned().collect(),
        }));

        if changed {
            let health = aggregate(&statuses);
            if health != last_health {
                last_health = health;
                bus.emit(EventKind::Health(health));
            }
            interval = config.initial_interval;
        } else {
            interval = (interval * 2).min(config.max_interval);
        }

        // Either token wakes the sleep early.
        let step = Duration::from_millis(50).min(interval);
        let mut slept = Duration::ZERO;
        while slept < interval {
            if cancel.is_cancelled() || stop.is_cancelled() {
                return;
            }
            if !stop.sleep(step) {
                return;
            }
            slept += step;
        }
    }
}

fn aggregate(statuses: &BTreeMap<ResourceKey, ResourceStatus>) -> HealthPayload {
    let mut health = HealthPayload::default();
    for status in statuses.values() {
        health.total += 1;
        match status.phase {
            ResourcePhase::Ready => health.ready += 1,
            ResourcePhase::Progressing => health.progressing += 1,
            ResourcePhase::Pending => health.pending += 1,
            ResourcePhase::Degraded => health.degraded += 1,
            ResourcePhase::Unknown => health.unknown += 1,
        }
    }
    health
}

fn int_at(value: &Value, path: &[&str]) -> Option<i64> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_i64()
}

/// Readiness rules per kind, over the raw (un-normalized) live object.
fn classify(kind: &str, object: Option<&Value>) -> (ResourcePhase, String) {
    let Some(object) = object else {
        return (ResourcePhase::Pending, "not found yet".to_string());
    };
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = int_at(object, &["spec", "replicas"]).unwrap_or(1);
            let ready = int_at(object, &["status", "readyReplicas"]).unwrap_or(0);
            if ready >= desired {
                (ResourcePhase::Ready, format!("{ready}/{desired} ready"))
            } else {
                (
                    ResourcePhase::Progressing,
                    format!("{ready}/{desired} ready"),
                )
            }
        }
        "DaemonSet" => {
            let desired = int_at(object, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let ready = int_at(object, &["status", "numberReady"]).unwrap_or(0);
            if desired > 0 && ready >= desired {
                (ResourcePhase::Ready, format!("{ready}/{desired} ready"))
            } else {
                (
                    ResourcePhase::Progressing,
                    format!("{ready}/{desired} ready"),
                )
            }
        }
        "Job" => {
            let completions = int_at(object, &["spec", "completions"]).unwrap_or(1);
            let succeeded = int_at(object, &["status", "succeeded"]).unwrap_or(0);
            let failed = int_at(object, &["status", "failed"]).unwrap_or(0);
            if succeeded >= completions {
                (ResourcePhase::Ready, format!("{succeeded}/{completions} completed"))
            } else if failed > 0 {
                (ResourcePhase::Degraded, format!("{failed} pods failed"))
            } else {
                (
                    ResourcePhase::Progressing,
                    format!("{succeeded}/{completions} completed"),
                )
            }
        }
        "Pod" => {
            let pod_phase = object
                .get("status")
                .and_then(|s| s.get("phase"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            match pod_phase {
                "Running" | "Succeeded" => (ResourcePhase::Ready, pod_phase.to_string()),
                "Pending" => (ResourcePhase::Pending, "Pending".to_string()),
                "Failed" => (ResourcePhase::Degraded, "Failed".to_string()),
                other => (ResourcePhase::Unknown, other.to_string()),
            }
        }
        "PersistentVolumeClaim" => {
            let pvc_phase = object
                .get("status")
                .and_then(|s| s.get("phase"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if pvc_phase == "Bound" {
                (ResourcePhase::Ready, "Bound".to_string())
            } else {
                (ResourcePhase::Pending, pvc_phase.to_string())
            }
        }
        // Existence is readiness for plain objects.
        _ => (ResourcePhase::Ready, "exists".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeKube;

    fn yaml(doc: &str) -> Value {
        serde_yaml::from_str(doc).unwrap()
    }

    #[test]
    fn absent_objects_are_pending() {
        let (phase, message) = classify("ConfigMap", None);
        assert_eq!(phase, ResourcePhase::Pending);
        assert_eq!(message, "not found yet");
    }

    #[test]
    fn deployment_readiness_compares_ready_to_desired() {
        let progressing = yaml("spec:\n  replicas: 3\nstatus:\n  readyReplicas: 1\n");
        assert_eq!(
            classify("Deployment", Some(&progressing)).0,
            ResourcePhase::Progressing
        );
        let ready = yaml("spec:\n  replicas: 3\nstatus:\n  readyReplicas: 3\n");
        assert_eq!(classify("Deployment", Some(&ready)).0, ResourcePhase::Ready);
    }

    #[test]
    fn daemonset_uses_scheduled_counts() {
        let ds = yaml("status:\n  desiredNumberScheduled: 2\n  numberReady: 2\n");
        assert_eq!(classify("DaemonSet", Some(&ds)).0, ResourcePhase::Ready);
        let pending = yaml("status:\n  desiredNumberScheduled: 2\n  numberReady: 0\n");
        assert_eq!(
            classify("DaemonSet", Some(&pending)).0,
            ResourcePhase::Progressing
        );
    }

    #[test]
    fn job_completion_and_failure() {
        let done = yaml("spec:\n  completions: 2\nstatus:\n  succeeded: 2\n");
        assert_eq!(classify("Job", Some(&done)).0, ResourcePhase::Ready);
        let failed = yaml("status:\n  failed: 1\n");
        assert_eq!(classify("Job", Some(&failed)).0, ResourcePhase::Degraded);
    }

    #[test]
    fn pod_phase_mapping() {
        assert_eq!(
            classify("Pod", Some(&yaml("status:\n  phase: Running\n"))).0,
            ResourcePhase::Ready
        );
        assert_eq!(
            classify("Pod", Some(&yaml("status:\n  phase: Failed\n"))).0,
            ResourcePhase::Degraded
        );
    }

    #[test]
    fn pvc_requires_bound() {
        assert_eq!(
            classify("PersistentVolumeClaim", Some(&yaml("status:\n  phase: Bound\n"))).0,
            ResourcePhase::Ready
        );
        assert_eq!(
            classify("PersistentVolumeClaim", Some(&yaml("status:\n  phase: Pending\n"))).0,
            ResourcePhase::Pending
        );
    }

    #[test]
    fn plain_objects_are_ready_when_present() {
        assert_eq!(
            classify("ConfigMap", Some(&yaml("data: {}\n"))).0,
            ResourcePhase::Ready
        );
        assert_eq!(
            classify("Service", Some(&yaml("spec: {}\n"))).0,
            ResourcePhase::Ready
        );
    }

    #[test]
    fn tracker_emits_snapshots_and_stops_cleanly() {
        let kube = Arc::new(FakeKube::new());
        kube.put_manifest(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: prod\n",
        );
        let bus = EventBus::new();
        let handle = spawn(
            kube,
            vec![ResourceKey::new("", "v1", "ConfigMap", "prod", "cfg")],
            "prod".to_string(),
            bus.clone(),
            CancelToken::new(),
            TrackerConfig {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(20),
            },
        );
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        let retained = bus.retained();
        let snapshots: Vec<_> = retained
            .iter()
            .filter_map(|e| match &e.event {
                EventKind::Resources(r) => Some(r),
                _ => None,
            })
            .collect();
        assert!(!snapshots.is_empty());
        assert_eq!(snapshots[0].resources[0].phase, ResourcePhase::Ready);

        let healths: Vec<_> = retained
            .iter()
            .filter(|e| matches!(e.event, EventKind::Health(_)))
            .collect();
        assert_eq!(healths.len(), 1);
    }

    #[test]
    fn first_seen_is_monotonic_across_updates() {
        let kube = Arc::new(FakeKube::new());
        let bus = EventBus::new();
        let key = ResourceKey::new("", "v1", "ConfigMap", "prod", "cfg");
        let handle = spawn(
            Arc::clone(&kube) as Arc<dyn KubeClient>,
            vec![key],
            "prod".to_string(),
            bus.clone(),
            CancelToken::new(),
            TrackerConfig {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(20),
            },
        );
        thread::sleep(Duration::from_millis(40));
        kube.put_manifest(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: prod\n",
        );
        thread::sleep(Duration::from_millis(80));
        handle.stop();

        let mut first_seen = None;
        for event in bus.retained() {
            if let EventKind::Resources(r) = &event.event {
                let row = &r.resources[0];
                if let Some(seen) = first_seen {
                    assert!(row.first_seen >= seen);
                    assert!(row.last_update >= row.first_seen);
                } else {
                    first_seen = Some(row.first_seen);
                }
            }
        }
    }
}
