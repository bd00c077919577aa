use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::ResourceKey;
use crate::quantity::{Quantity, serde_bytes, serde_cpu};

/// Schema tag written into every plan artifact. Additive evolution only;
/// readers refuse artifacts with an unknown tag.
pub const PLAN_SCHEMA: &str = "ktl.plan.v1";

/// What happens to one resource when the plan is applied.
///
/// The derived ordering (`create` < `update` < `delete`) is part of the
/// artifact contract: changes are sorted by kind first, then by the lexical
/// key string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanChange {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    /// Unified diff. `"" -> desired` for creates, `previous -> ""` for
    /// deletes, `live -> desired` for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanSummaryCounts {
    pub creates: u32,
    pub updates: u32,
    pub deletes: u32,
    pub unchanged: u32,
}

/// Where a graph node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSource {
    /// Present in the rendered manifest.
    Rendered,
    /// Referenced by a rendered workload but not part of the chart.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// `<ns|cluster>|<kind>|<name>`, lowercased.
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub source: NodeSource,
    /// Whether the object currently exists in the cluster.
    pub live: bool,
    /// Small descriptive facts: replicas, container count, configmap keys,
    /// PVC request size.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    /// Names the reference site: `volume:<n>`, `env:<c>/<v>`,
    /// `envFrom:<c>`, `imagePullSecret`, `pvc:<n>`, `serviceAccount`.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Value inputs, recorded for reproducibility.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueSources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_string: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_file: Vec<String>,
}

impl ValueSources {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.set.is_empty()
            && self.set_string.is_empty()
            && self.set_file.is_empty()
    }
}

/// Desired resource totals for one namespace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuotaRollup {
    #[serde(with = "serde_cpu")]
    pub cpu_requests: Quantity,
    #[serde(with = "serde_cpu")]
    pub cpu_limits: Quantity,
    #[serde(with = "serde_bytes")]
    pub memory_requests: Quantity,
    #[serde(with = "serde_bytes")]
    pub memory_limits: Quantity,
    #[serde(with = "serde_bytes")]
    pub storage: Quantity,
    pub pods: u32,
    pub services: u32,
    pub configmaps: u32,
    pub secrets: u32,
    pub pvcs: u32,
    /// Live quota context, best-effort. Lookup failure leaves this empty
    /// and adds a plan warning.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub live_quotas: Vec<LiveQuota>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limit_ranges: Vec<String>,
}

/// A live `ResourceQuota` snapshot attached to a rollup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveQuota {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hard: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub used: BTreeMap<String, String>,
}

/// Manifest blobs carried in the artifact.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanManifests {
    pub desired: String,
    #[serde(default)]
    pub live: String,
    /// Unified diff over the full blobs.
    #[serde(default)]
    pub diff: String,
}

/// Kube API call statistics for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiCallStats {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

/// Per-phase timing attached to the artifact when telemetry is enabled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanTelemetry {
    /// Phase name -> elapsed milliseconds, lexical order.
    pub phases: BTreeMap<String, u64>,
    pub total_ms: u64,
    pub api: ApiCallStats,
}

impl PlanTelemetry {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }
}

/// One side of a plan comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareEntry {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    /// Set for `changed` entries only: the classification in the baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_kind: Option<ChangeKind>,
}

/// Join of a current plan against a persisted baseline, by resource key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanCompare {
    /// Keys present only in the current plan.
    pub new: Vec<CompareEntry>,
    /// Keys present in both with a different change kind.
    pub changed: Vec<CompareEntry>,
    /// Keys present only in the baseline.
    pub resolved: Vec<CompareEntry>,
    /// Keys present in both with the same change kind.
    pub unchanged: Vec<CompareEntry>,
}

impl PlanCompare {
    /// The `--compare-exit` signal: anything new or changed is a regression.
    pub fn has_regressions(&self) -> bool {
        !self.new.is_empty() || !self.changed.is_empty()
    }
}

/// The artifact produced by one plan invocation. Immutable once built;
/// round-trips as JSON and YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub schema: String,
    pub release: String,
    pub namespace: String,
    pub chart: String,
    pub chart_version: String,
    #[serde(default, skip_serializing_if = "ValueSources::is_empty")]
    pub values: ValueSources,
    pub graph: DependencyGraph,
    pub manifests: PlanManifests,
    /// Desired rollups keyed by namespace.
    pub quotas: BTreeMap<String, QuotaRollup>,
    pub changes: Vec<PlanChange>,
    pub summary: PlanSummaryCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub cluster_host: String,
    /// Deterministic shell-quoted reproduction of the apply invocation.
    pub install_command: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub offline_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare: Option<PlanCompare>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<PlanTelemetry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn sample_plan() -> PlanResult {
        PlanResult {
            schema: PLAN_SCHEMA.to_string(),
            release: "web".into(),
            namespace: "prod".into(),
            chart: "core".into(),
            chart_version: "1.2.3".into(),
            values: ValueSources::default(),
            graph: DependencyGraph::default(),
            manifests: PlanManifests {
                desired: "kind: ConfigMap\n".into(),
                live: String::new(),
                diff: String::new(),
            },
            quotas: BTreeMap::new(),
            changes: vec![PlanChange {
                key: ResourceKey::new("", "v1", "ConfigMap", "prod", "cfg"),
                kind: ChangeKind::Create,
                diff: Some("+kind: ConfigMap\n".into()),
            }],
            summary: PlanSummaryCounts {
                creates: 1,
                ..Default::default()
            },
            warnings: vec![],
            cluster_host: "https://kube.example.com".into(),
            install_command: "ktl apply --chart core --release web".into(),
            generated_at: Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap(),
            offline_fallback: false,
            compare: None,
            telemetry: None,
        }
    }

    #[test]
    fn plan_result_roundtrips_as_json() {
        let plan = sample_plan();
        let json = serde_json::to_string_pretty(&plan).unwrap();
        let back: PlanResult = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn change_kind_ordering_is_create_update_delete() {
        let mut kinds = vec![ChangeKind::Delete, ChangeKind::Create, ChangeKind::Update];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![ChangeKind::Create, ChangeKind::Update, ChangeKind::Delete]
        );
    }

    #[test]
    fn compare_regression_signal() {
        let mut cmp = PlanCompare::default();
        assert!(!cmp.has_regressions());
        cmp.new.push(CompareEntry {
            key: ResourceKey::new("", "v1", "ConfigMap", "prod", "cfg"),
            kind: ChangeKind::Create,
            previous_kind: None,
        });
        assert!(cmp.has_regressions());
    }

    #[test]
    fn quota_rollup_serializes_quantities_as_strings() {
        let rollup = QuotaRollup {
            cpu_requests: crate::quantity::parse_quantity("1.5").unwrap(),
            memory_requests: crate::quantity::parse_quantity("512Mi").unwrap(),
            pods: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&rollup).unwrap();
        assert_eq!(json["cpu_requests"], "1500m");
        assert_eq!(json["memory_requests"], "512Mi");
        assert_eq!(json["pods"], 3);
    }
}
