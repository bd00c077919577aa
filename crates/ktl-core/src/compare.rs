//! Plan-to-plan comparison for `--compare-to`.
//!
//! Joins the current plan's changes against a persisted baseline by
//! resource key. A kind change counts as changed; identical kind counts as
//! unchanged regardless of diff body.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use ktl_types::{
    ChangeKind, CompareEntry, KtlError, PLAN_SCHEMA, PlanCompare, PlanResult, ResourceKey,
};

/// Load a baseline artifact, refusing unknown schema tags.
pub fn load_baseline(path: &Path) -> Result<PlanResult> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read baseline plan {}", path.display()))?;
    let plan: PlanResult = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse baseline plan {}", path.display()))?;
    if plan.schema != PLAN_SCHEMA {
        return Err(KtlError::Input(format!(
            "baseline plan {} has unsupported schema {:?} (expected {PLAN_SCHEMA:?})",
            path.display(),
            plan.schema
        ))
        .into());
    }
    Ok(plan)
}

/// Join current changes against the baseline's.
pub fn compare_plans(current: &PlanResult, baseline: &PlanResult) -> PlanCompare {
    let current_changes: BTreeMap<&ResourceKey, ChangeKind> =
        current.changes.iter().map(|c| (&c.key, c.kind)).collect();
    let baseline_changes: BTreeMap<&ResourceKey, ChangeKind> =
        baseline.changes.iter().map(|c| (&c.key, c.kind)).collect();

    let mut result = PlanCompare::default();

    for (key, kind) in &current_changes {
        match baseline_changes.get(key) {
            None => result.new.push(CompareEntry {
                key: (*key).clone(),
                kind: *kind,
                previous_kind: None,
            }),
            Some(previous) if previous != kind => result.changed.push(CompareEntry {
                key: (*key).clone(),
                kind: *kind,
                previous_kind: Some(*previous),
            }),
            Some(_) => result.unchanged.push(CompareEntry {
                key: (*key).clone(),
                kind: *kind,
                previous_kind: None,
            }),
        }
    }

    for (key, kind) in &baseline_changes {
        if !current_changes.contains_key(key) {
            result.resolved.push(CompareEntry {
                key: (*key).clone(),
                kind: *kind,
                previous_kind: None,
            });
        }
    }

    result
}

/// The `--compare-exit` gate: regressions block the operation.
pub fn compare_gate(plan: &PlanResult, compare_exit: bool) -> Result<(), KtlError> {
    if !compare_exit {
        return Ok(());
    }
    let Some(compare) = &plan.compare else {
        return Ok(());
    };
    if compare.has_regressions() {
        return Err(KtlError::Guard(format!(
            "plan regression against baseline: {} new, {} changed",
            compare.new.len(),
            compare.changed.len()
        )));
    }
    Ok(())
}
