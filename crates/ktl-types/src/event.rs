use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Canonical phase names used by the phase timer and `Phase` events.
pub mod phase {
    pub const RENDER: &str = "render";
    pub const RELEASE: &str = "release";
    pub const LIVE: &str = "live";
    pub const DIFF: &str = "diff";
    pub const QUOTA: &str = "quota";
    pub const DRIFT: &str = "drift";
    pub const PREVIEW: &str = "preview";
    pub const CONFIRM: &str = "confirm";
    pub const INSTALL: &str = "install";
    pub const WAIT: &str = "wait";
    pub const POSTWAIT: &str = "postwait";
    pub const DESTROY: &str = "destroy";
}

/// One event on the deploy stream.
///
/// Events are immutable once emitted; the timestamp is stamped by the
/// observer fabric at emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EventKind,
}

impl StreamEvent {
    /// RFC3339 timestamp with nanosecond precision, as written to capture
    /// stores and JSONL transcripts.
    pub fn timestamp_rfc3339(&self) -> String {
        self.at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn is_log(&self) -> bool {
        matches!(self.event, EventKind::Log(_))
    }
}

/// The tagged union of everything the deploy pipeline can tell an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Summary(SummaryPayload),
    Phase(PhasePayload),
    Resources(ResourcesPayload),
    Health(HealthPayload),
    Diff(DiffPayload),
    Log(LogPayload),
}

/// Release status words used in summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Deployed,
    Failed,
    Destroyed,
    #[default]
    Unknown,
}

/// A concise snapshot of a prior release revision, shown in summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBreadcrumb {
    pub revision: i32,
    pub status: String,
    pub chart: String,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

/// Audit record for one resolved secret reference. Values never appear
/// here; `reference` is the original `secret://` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretAuditEntry {
    pub provider: String,
    pub path: String,
    pub reference: String,
    pub masked: bool,
}

/// The headline state of the whole operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub release: String,
    pub namespace: String,
    pub chart: String,
    pub version: String,
    pub status: ReleaseStatus,
    /// Human action headline, e.g. `Upgrading web (prod)`.
    pub action: String,
    /// Most recent first, bounded at 6 entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryBreadcrumb>,
    /// Revision of the most recent successfully deployed entry in `history`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretAuditEntry>,
    /// Pre-formatted phase durations, phase name -> `1.234s`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phase_durations: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePayload {
    pub phase: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health phase for one tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResourcePhase {
    Pending,
    Progressing,
    Ready,
    Degraded,
    #[default]
    Unknown,
}

/// One row per tracked object in a `Resources` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub phase: ResourcePhase,
    #[serde(default)]
    pub message: String,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourcesPayload {
    pub resources: Vec<ResourceStatus>,
}

/// Aggregate counts emitted when any tracked resource changes phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthPayload {
    pub ready: u32,
    pub progressing: u32,
    pub pending: u32,
    pub degraded: u32,
    pub unknown: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiffPayload {
    /// Unified diff text (may span many resources).
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<crate::plan::PlanSummaryCounts>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// A leveled log line. The pod/container fields are filled by log tailers
/// during the post-apply watch window and stay empty for engine logs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    /// Component that produced the line (`plan`, `apply`, `tracker`, ...).
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

impl LogPayload {
    pub fn new(level: LogLevel, source: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn event_json_is_internally_tagged() {
        let ev = StreamEvent {
            at: fixed_time(),
            event: EventKind::Phase(PhasePayload {
                phase: phase::RENDER.to_string(),
                status: PhaseStatus::Running,
                message: None,
            }),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "phase");
        assert_eq!(json["phase"], "render");
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn summary_roundtrips() {
        let payload = SummaryPayload {
            release: "web".into(),
            namespace: "prod".into(),
            chart: "core".into(),
            version: "1.2.3".into(),
            status: ReleaseStatus::Deployed,
            action: "Upgrading web (prod)".into(),
            history: vec![HistoryBreadcrumb {
                revision: 4,
                status: "deployed".into(),
                chart: "core".into(),
                version: "1.2.2".into(),
                updated_at: fixed_time(),
            }],
            last_successful: Some(4),
            ..Default::default()
        };
        let ev = StreamEvent {
            at: fixed_time(),
            event: EventKind::Summary(payload.clone()),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event, EventKind::Summary(payload));
    }

    #[test]
    fn timestamp_has_nanosecond_precision() {
        let ev = StreamEvent {
            at: Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap(),
            event: EventKind::Log(LogPayload::new(LogLevel::Info, "plan", "hello")),
        };
        assert!(ev.timestamp_rfc3339().contains(".000000000Z"));
    }

    #[test]
    fn log_detection() {
        let log = StreamEvent {
            at: fixed_time(),
            event: EventKind::Log(LogPayload::new(LogLevel::Warn, "apply", "careful")),
        };
        assert!(log.is_log());
    }
}
