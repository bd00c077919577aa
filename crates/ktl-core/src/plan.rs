//! The plan engine: render, diff against live, classify, report.
//!
//! `execute` drives the phases `render -> release -> live -> diff -> quota`
//! and assembles the immutable [`PlanResult`] artifact. Live lookup
//! failures downgrade to offline fallback: the previous release manifest
//! stands in for cluster state and the artifact is flagged.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_yaml::Value;

use ktl_events::{EventBus, PhaseGuard, PhaseTimer};
use ktl_manifest::{ManifestIndex, canonical_object};
use ktl_types::{
    ChangeKind, DiffPayload, EventKind, KtlError, LogLevel, LogPayload, PLAN_SCHEMA, PlanChange,
    PlanManifests, PlanResult, PlanSummaryCounts, PlanTelemetry, ResourceKey, phase,
};

use crate::cancel::CancelToken;
use crate::client::{KubeClient, lookup_namespace};
use crate::compare;
use crate::diff;
use crate::graph;
use crate::install::{InstallFailure, Installer};
use crate::quota;
use crate::render::{RenderRequest, Renderer, ValueOverrides};
use crate::secrets::{ResolveMode, SecretResolver};

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub chart: String,
    pub version: Option<String>,
    pub release: String,
    pub namespace: String,
    pub values: ValueOverrides,
    pub include_crds: bool,
    /// Let the renderer consult cluster capabilities.
    pub use_cluster: bool,
    /// Baseline artifact for `--compare-to`.
    pub compare_to: Option<PathBuf>,
    /// Persist the artifact as pretty JSON.
    pub out: Option<PathBuf>,
    /// Attach phase/API timing to the artifact.
    pub telemetry: bool,
}

pub struct PlanEngine<'a> {
    pub renderer: &'a dyn Renderer,
    pub client: &'a dyn KubeClient,
    pub installer: &'a dyn Installer,
    pub secrets: &'a SecretResolver,
    pub bus: &'a EventBus,
    pub timer: &'a PhaseTimer,
}

/// How live state was obtained for one desired key.
enum LiveState {
    /// GET succeeded; `None` means not found.
    Known(Option<(Value, String)>),
    /// Discovery had no match or the cluster was unreachable; the previous
    /// release manifest stands in.
    Unknown,
}

impl PlanEngine<'_> {
    pub fn execute(&self, opts: &PlanOptions, cancel: &CancelToken) -> Result<PlanResult> {
        if opts.chart.is_empty() {
            return Err(KtlError::Input("a chart reference is required".into()).into());
        }
        if opts.release.is_empty() {
            return Err(KtlError::Input("a release name is required".into()).into());
        }
        let namespace = if opts.namespace.is_empty() {
            "default".to_string()
        } else {
            opts.namespace.clone()
        };
        let mut warnings: Vec<String> = Vec::new();

        // Plan artifacts are comparable run over run, so secret references
        // always substitute to deterministic masks here.
        let mut values = opts.values.clone();
        self.secrets
            .resolve_overrides(&mut values, ResolveMode::Mask)?;

        // render
        cancel.check()?;
        let guard = PhaseGuard::start(self.bus, self.timer, phase::RENDER);
        let rendered = match self.renderer.render(&RenderRequest {
            chart: opts.chart.clone(),
            version: opts.version.clone(),
            release: opts.release.clone(),
            namespace: namespace.clone(),
            values: values.clone(),
            include_crds: opts.include_crds,
            use_cluster: opts.use_cluster,
        }) {
            Ok(rendered) => rendered,
            Err(failure) => {
                guard.fail(failure.to_string());
                return Err(KtlError::from(failure).into());
            }
        };
        let desired = match ManifestIndex::parse(&rendered.manifest) {
            Ok(index) => index,
            Err(err) => {
                guard.fail(err.to_string());
                return Err(KtlError::Input(format!("{err:#}")).into());
            }
        };
        guard.succeed_with(format!("{} documents", desired.len()));

        // release
        cancel.check()?;
        let guard = PhaseGuard::start(self.bus, self.timer, phase::RELEASE);
        let previous = match self.previous_release_manifest(&opts.release) {
            Ok(previous) => previous,
            Err(err) => {
                guard.fail(format!("{err:#}"));
                return Err(err);
            }
        };
        guard.succeed();

        // live
        cancel.check()?;
        let guard = PhaseGuard::start(self.bus, self.timer, phase::LIVE);
        let (live, offline_fallback) =
            self.lookup_live(&desired, &namespace, &mut warnings, cancel)?;
        if offline_fallback {
            guard.succeed_with("offline fallback");
        } else {
            guard.succeed();
        }

        // diff
        cancel.check()?;
        let guard = PhaseGuard::start(self.bus, self.timer, phase::DIFF);
        let (changes, summary) = classify(&desired, &previous, &live);
        guard.succeed_with(format!(
            "{} creates, {} updates, {} deletes, {} unchanged",
            summary.creates, summary.updates, summary.deletes, summary.unchanged
        ));

        // quota
        cancel.check()?;
        let guard = PhaseGuard::start(self.bus, self.timer, phase::QUOTA);
        let (mut quotas, quota_warnings) = quota::estimate(&desired, &namespace);
        warnings.extend(quota_warnings);
        if !offline_fallback {
            warnings.extend(quota::augment_live(&mut quotas, self.client));
        }
        guard.succeed();

        warnings.extend(impact_warnings(&opts.chart, &changes));

        let live_keys: BTreeSet<ResourceKey> = live
            .iter()
            .filter_map(|(key, state)| match state {
                LiveState::Known(Some(_)) => Some(key.clone()),
                _ => None,
            })
            .collect();
        let graph = graph::build(&desired, &live_keys, &namespace);

        let live_blob = live_blob(&live);
        let desired_blob = desired.canonical_blob();
        let manifest_diff = diff::unified(&live_blob, &desired_blob);

        let mut plan = PlanResult {
            schema: PLAN_SCHEMA.to_string(),
            release: opts.release.clone(),
            namespace: namespace.clone(),
            chart: opts.chart.clone(),
            chart_version: rendered.version.clone(),
            values: opts.values.sources(),
            graph,
            manifests: PlanManifests {
                desired: desired_blob,
                live: live_blob,
                diff: manifest_diff,
            },
            quotas,
            changes,
            summary,
            warnings,
            cluster_host: self.client.host(),
            install_command: install_command(opts, &namespace),
            generated_at: Utc::now(),
            offline_fallback,
            compare: None,
            telemetry: None,
        };

        if let Some(baseline_path) = &opts.compare_to {
            let baseline = compare::load_baseline(baseline_path)?;
            plan.compare = Some(compare::compare_plans(&plan, &baseline));
        }

        if opts.telemetry {
            let snapshot = self.timer.snapshot();
            let api = self.client.api_stats();
            plan.telemetry = Some(PlanTelemetry {
                phases: snapshot
                    .iter()
                    .map(|(name, d)| (name.clone(), d.as_millis() as u64))
                    .collect(),
                total_ms: snapshot.values().map(|d| d.as_millis() as u64).sum(),
                api,
            });
        }

        for warning in &plan.warnings {
            self.bus
                .log(LogPayload::new(LogLevel::Warn, "plan", warning.clone()));
        }
        self.bus.emit(EventKind::Diff(DiffPayload {
            text: plan.manifests.diff.clone(),
            summary: Some(plan.summary),
        }));

        if let Some(out) = &opts.out {
            write_artifact(out, &plan)?;
        }

        Ok(plan)
    }

    fn previous_release_manifest(&self, release: &str) -> Result<ManifestIndex> {
        match self.installer.get_release(release) {
            Ok(Some(release)) => ManifestIndex::parse(&release.manifest)
                .context("failed to parse stored release manifest"),
            Ok(None) => Ok(ManifestIndex::empty()),
            Err(InstallFailure::Cancelled) => Err(KtlError::Cancelled("release lookup".into()).into()),
            Err(err) => Err(KtlError::Install(format!("release lookup failed: {err}")).into()),
        }
    }

    /// GET every desired key. Any transport error flips the whole plan
    /// into offline fallback; unknown kinds downgrade to warnings.
    fn lookup_live(
        &self,
        desired: &ManifestIndex,
        default_ns: &str,
        warnings: &mut Vec<String>,
        cancel: &CancelToken,
    ) -> Result<(BTreeMap<ResourceKey, LiveState>, bool)> {
        let mut live = BTreeMap::new();
        let mut offline = false;

        for key in desired.keys() {
            cancel.check()?;
            if offline {
                live.insert(key.clone(), LiveState::Unknown);
                continue;
            }
            let mapping = match self.client.map_kind(&key.group, &key.version, &key.kind) {
                Ok(Some(mapping)) => mapping,
                Ok(None) => {
                    warnings.push(format!(
                        "no API match for {} (is the CRD installed?); skipping live lookup",
                        key
                    ));
                    live.insert(key.clone(), LiveState::Unknown);
                    continue;
                }
                Err(err) => {
                    tracing::debug!(%key, %err, "discovery failed, going offline");
                    warnings.push(offline_warning(&err.to_string()));
                    offline = true;
                    live.insert(key.clone(), LiveState::Unknown);
                    continue;
                }
            };
            let namespace = lookup_namespace(&mapping, key, default_ns);
            match self.client.get_dynamic(&mapping, namespace, &key.name) {
                Ok(Some(value)) => {
                    let (value, yaml) = canonical_object(&value)?;
                    live.insert(key.clone(), LiveState::Known(Some((value, yaml))));
                }
                Ok(None) => {
                    live.insert(key.clone(), LiveState::Known(None));
                }
                Err(err) => {
                    tracing::debug!(%key, %err, "live lookup failed, going offline");
                    warnings.push(offline_warning(&err.to_string()));
                    offline = true;
                    live.insert(key.clone(), LiveState::Unknown);
                }
            }
        }

        Ok((live, offline))
    }
}

fn offline_warning(cause: &str) -> String {
    format!("Live lookup failed ({cause}); falling back to previous release manifest.")
}

/// Classify every desired and previous-only key into exactly one change,
/// and count the unchanged remainder.
fn classify(
    desired: &ManifestIndex,
    previous: &ManifestIndex,
    live: &BTreeMap<ResourceKey, LiveState>,
) -> (Vec<PlanChange>, PlanSummaryCounts) {
    let mut changes = Vec::new();
    let mut summary = PlanSummaryCounts::default();

    for (key, doc) in desired.iter() {
        let previous_doc = previous.get(key);
        match live.get(key) {
            Some(LiveState::Known(Some((_, live_yaml)))) => {
                if *live_yaml == doc.yaml {
                    summary.unchanged += 1;
                } else {
                    summary.updates += 1;
                    changes.push(PlanChange {
                        key: key.clone(),
                        kind: ChangeKind::Update,
                        diff: Some(diff::unified(live_yaml, &doc.yaml)),
                    });
                }
            }
            Some(LiveState::Known(None)) => {
                // The object is definitively absent. If a previous revision
                // applied it, this is a recreate; otherwise a create.
                if let Some(previous_doc) = previous_doc {
                    summary.updates += 1;
                    changes.push(PlanChange {
                        key: key.clone(),
                        kind: ChangeKind::Update,
                        diff: Some(diff::unified(&previous_doc.yaml, &doc.yaml)),
                    });
                } else {
                    summary.creates += 1;
                    changes.push(PlanChange {
                        key: key.clone(),
                        kind: ChangeKind::Create,
                        diff: Some(diff::unified("", &doc.yaml)),
                    });
                }
            }
            Some(LiveState::Unknown) | None => {
                // Live state unknowable: the previous release manifest is
                // the comparison baseline.
                match previous_doc {
                    Some(previous_doc) if previous_doc.yaml == doc.yaml => summary.unchanged += 1,
                    Some(previous_doc) => {
                        summary.updates += 1;
                        changes.push(PlanChange {
                            key: key.clone(),
                            kind: ChangeKind::Update,
                            diff: Some(diff::unified(&previous_doc.yaml, &doc.yaml)),
                        });
                    }
                    None => {
                        summary.creates += 1;
                        changes.push(PlanChange {
                            key: key.clone(),
                            kind: ChangeKind::Create,
                            diff: Some(diff::unified("", &doc.yaml)),
                        });
                    }
                }
            }
        }
    }

    for (key, doc) in previous.iter() {
        if desired.contains(key) {
            continue;
        }
        summary.deletes += 1;
        changes.push(PlanChange {
            key: key.clone(),
            kind: ChangeKind::Delete,
            diff: Some(diff::unified(&doc.yaml, "")),
        });
    }

    changes.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
    });
    (changes, summary)
}

/// Operational impact warnings: workload churn and removed safeguards.
fn impact_warnings(chart: &str, changes: &[PlanChange]) -> Vec<String> {
    let mut warnings = Vec::new();
    for change in changes {
        let key = &change.key;
        let ns = if key.namespace.is_empty() {
            "cluster"
        } else {
            &key.namespace
        };
        if graph::is_workload_kind(&key.kind) {
            match change.kind {
                ChangeKind::Update => warnings.push(format!(
                    "Updating {chart}/{} {} ({ns}) will restart pods",
                    key.name, key.kind
                )),
                ChangeKind::Delete => warnings.push(format!(
                    "Deleting {chart}/{} {} ({ns}) will evict pods",
                    key.name, key.kind
                )),
                ChangeKind::Create => {}
            }
        }
        if key.kind == "PodDisruptionBudget" && change.kind == ChangeKind::Delete {
            warnings.push(format!(
                "Deleting PodDisruptionBudget {ns}/{} removes disruption safeguards",
                key.name
            ));
        }
    }
    warnings
}

fn live_blob(live: &BTreeMap<ResourceKey, LiveState>) -> String {
    let mut out = String::new();
    for state in live.values() {
        if let LiveState::Known(Some((_, yaml))) = state {
            if !out.is_empty() {
                out.push_str("---\n");
            }
            out.push_str(yaml);
        }
    }
    out
}

/// Deterministic, shell-quoted reproduction of the apply invocation.
fn install_command(opts: &PlanOptions, namespace: &str) -> String {
    let mut argv: Vec<String> = vec![
        "ktl".into(),
        "apply".into(),
        "--chart".into(),
        opts.chart.clone(),
    ];
    if let Some(version) = &opts.version {
        argv.push("--chart-version".into());
        argv.push(version.clone());
    }
    argv.push("--release".into());
    argv.push(opts.release.clone());
    argv.push("--namespace".into());
    argv.push(namespace.to_string());
    for file in &opts.values.files {
        argv.push("--values".into());
        argv.push(file.display().to_string());
    }
    for (k, v) in &opts.values.set {
        argv.push("--set".into());
        argv.push(format!("{k}={v}"));
    }
    for (k, v) in &opts.values.set_string {
        argv.push("--set-string".into());
        argv.push(format!("{k}={v}"));
    }
    for (k, v) in &opts.values.set_file {
        argv.push("--set-file".into());
        argv.push(format!("{k}={v}"));
    }
    if opts.include_crds {
        argv.push("--include-crds".into());
    }
    shell_words::join(argv.iter().map(String::as_str))
}

fn write_artifact(path: &Path, plan: &PlanResult) -> Result<()> {
    let json = serde_json::to_string_pretty(plan).context("failed to serialize plan artifact")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create artifact dir {}", parent.display()))?;
        }
    }
    // Atomic replace: write a sibling temp file, then rename over.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move artifact into place at {}", path.display()))?;
    Ok(())
}
