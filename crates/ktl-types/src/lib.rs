//! # Types
//!
//! Core domain types for ktl: resource keys, plan artifacts, stream events,
//! and the error taxonomy shared by every crate in the workspace.
//!
//! - [`ResourceKey`] - the `(group, version, kind, namespace, name)` identity
//!   of a single Kubernetes object
//! - [`PlanResult`] - the deterministic plan artifact produced by a plan run
//! - [`StreamEvent`] - the tagged event union fanned out to observers
//! - [`KtlError`] - fatal error kinds, each mapping to a process exit code
//!
//! ## Serialization
//!
//! All artifact and event types implement `Serialize`/`Deserialize`. The
//! `PlanResult` JSON form is a compatibility surface for `--compare-to` and
//! for viewers; evolution is additive only.

mod error;
mod event;
mod key;
mod plan;
mod quantity;

pub use error::KtlError;
pub use event::{
    DiffPayload, EventKind, HealthPayload, HistoryBreadcrumb, LogLevel, LogPayload, PhasePayload,
    PhaseStatus, ReleaseStatus, ResourcePhase, ResourceStatus, ResourcesPayload, SecretAuditEntry,
    StreamEvent, SummaryPayload, phase,
};
pub use key::ResourceKey;
pub use plan::{
    ApiCallStats, ChangeKind, CompareEntry, DependencyGraph, GraphEdge, GraphNode, LiveQuota,
    NodeSource, PLAN_SCHEMA, PlanChange, PlanCompare, PlanManifests, PlanResult,
    PlanSummaryCounts, PlanTelemetry, QuotaRollup, ValueSources,
};
pub use quantity::{Quantity, QuantityParseError, format_bytes, format_cpu, parse_quantity};
