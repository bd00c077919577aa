//! The apply engine.
//!
//! Drives the full state machine: resolve namespace, secret resolution,
//! drift guard, plan preview, confirmation, pre-render, verify guard,
//! resource tracking, install-or-upgrade, and the final summary. The final
//! summary is emitted on success and on every failure path, so observers
//! always see closure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use ktl_events::{EventBus, PhaseGuard, PhaseTimer};
use ktl_manifest::ManifestIndex;
use ktl_types::{
    EventKind, KtlError, LogLevel, LogPayload, PlanResult, ReleaseStatus, ResourceKey,
    SummaryPayload, phase,
};

use crate::cancel::CancelToken;
use crate::client::KubeClient;
use crate::compare;
use crate::drift::{DriftGuard, DriftMode};
use crate::install::{InstallRequest, Installer, breadcrumbs};
use crate::plan::{PlanEngine, PlanOptions};
use crate::render::{RenderRequest, Renderer, ValueOverrides};
use crate::secrets::{ResolveMode, SecretResolver};
use crate::track::{self, TrackerConfig};
use crate::verify;

/// Summaries carry at most this many history breadcrumbs.
pub const HISTORY_LIMIT: usize = 6;

/// Interactive confirmation boundary. The CLI backs this with prompts;
/// headless embedders pass `None` and must set `auto_approve`.
pub trait Confirmer: Send + Sync {
    /// Approve or reject an apply after seeing the plan preview.
    fn confirm_apply(&self, plan: &PlanResult) -> Result<bool>;

    /// Destroy confirmation: returns whatever the user typed; the engine
    /// requires an exact release-name match.
    fn confirm_destroy(&self, release: &str) -> Result<String>;
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub chart: String,
    pub version: Option<String>,
    pub release: String,
    pub namespace: String,
    pub values: ValueOverrides,
    pub include_crds: bool,
    pub create_namespace: bool,
    pub dry_run: bool,
    pub auto_approve: bool,
    /// Drift guard mode; `None` disables the guard.
    pub drift: Option<DriftMode>,
    /// Verify report path; `None` disables the verify guard.
    pub verify_report: Option<PathBuf>,
    pub atomic: bool,
    pub wait: bool,
    pub timeout: Duration,
    /// Keep tracking resources for this long after the final summary.
    pub watch: Option<Duration>,
    /// Baseline plan for `--compare-to`, with `--compare-exit` gating.
    pub compare_to: Option<PathBuf>,
    pub compare_exit: bool,
}

pub struct ApplyEngine<'a> {
    pub renderer: &'a dyn Renderer,
    pub client: Arc<dyn KubeClient>,
    pub installer: &'a dyn Installer,
    pub secrets: &'a SecretResolver,
    pub confirmer: Option<&'a dyn Confirmer>,
    pub bus: &'a EventBus,
    pub timer: &'a PhaseTimer,
}

impl ApplyEngine<'_> {
    /// Run the apply. The returned summary matches the final `Summary`
    /// event; on error that event has `status: failed` and carries the
    /// error string.
    pub fn execute(&self, opts: &ApplyOptions, cancel: &CancelToken) -> Result<SummaryPayload> {
        let namespace = if opts.namespace.is_empty() {
            "default".to_string()
        } else {
            opts.namespace.clone()
        };
        let mut summary = SummaryPayload {
            release: opts.release.clone(),
            namespace: namespace.clone(),
            chart: opts.chart.clone(),
            version: opts.version.clone().unwrap_or_default(),
            status: ReleaseStatus::Pending,
            ..Default::default()
        };

        let result = self.run(opts, &namespace, cancel, &mut summary);

        match &result {
            Ok(()) => {
                summary.status = if opts.dry_run {
                    ReleaseStatus::Pending
                } else {
                    ReleaseStatus::Deployed
                };
            }
            Err(err) => {
                summary.status = ReleaseStatus::Failed;
                summary.error = Some(format!("{err:#}"));
            }
        }
        summary.phase_durations = self.timer.formatted();
        self.bus.emit(EventKind::Summary(summary.clone()));
        self.bus.log(LogPayload::new(
            LogLevel::Info,
            "telemetry",
            self.timer.telemetry_line(&self.client.api_stats()),
        ));

        // The watch window begins only after the final summary is out.
        if result.is_ok() && !opts.dry_run {
            if let Some(window) = opts.watch {
                self.post_wait_window(opts, &namespace, window, cancel);
            }
        }

        result.map(|()| summary)
    }

    fn run(
        &self,
        opts: &ApplyOptions,
        namespace: &str,
        cancel: &CancelToken,
        summary: &mut SummaryPayload,
    ) -> Result<()> {
        if opts.chart.is_empty() {
            return Err(KtlError::Input("a chart reference is required".into()).into());
        }
        if opts.release.is_empty() {
            return Err(KtlError::Input("a release name is required".into()).into());
        }
        cancel.check()?;

        self.ensure_namespace(namespace, opts.create_namespace)?;

        // Secret references resolve to real values for everything the
        // installer sees; dry-run keeps masks since nothing is mutated.
        let mut values = opts.values.clone();
        let mode = if opts.dry_run {
            ResolveMode::Mask
        } else {
            ResolveMode::Reveal
        };
        summary.secrets = self.secrets.resolve_overrides(&mut values, mode)?;

        let render_request = RenderRequest {
            chart: opts.chart.clone(),
            version: opts.version.clone(),
            release: opts.release.clone(),
            namespace: namespace.to_string(),
            values: values.clone(),
            include_crds: opts.include_crds,
            use_cluster: true,
        };

        if let Some(mode) = opts.drift {
            let guard = PhaseGuard::start(self.bus, self.timer, phase::DRIFT);
            let drift = DriftGuard {
                client: &*self.client,
                installer: self.installer,
                renderer: self.renderer,
            };
            match drift.check(mode, &opts.release, namespace, &render_request, cancel) {
                Ok(()) => guard.succeed(),
                Err(err) => {
                    guard.fail(format!("{err:#}"));
                    return Err(err);
                }
            }
        }

        // Plan preview (masked values; artifacts stay comparable).
        let preview_guard = PhaseGuard::start(self.bus, self.timer, phase::PREVIEW);
        let plan_engine = PlanEngine {
            renderer: self.renderer,
            client: &*self.client,
            installer: self.installer,
            secrets: self.secrets,
            bus: self.bus,
            timer: self.timer,
        };
        let preview = match plan_engine.execute(
            &PlanOptions {
                chart: opts.chart.clone(),
                version: opts.version.clone(),
                release: opts.release.clone(),
                namespace: namespace.to_string(),
                values: opts.values.clone(),
                include_crds: opts.include_crds,
                use_cluster: true,
                compare_to: opts.compare_to.clone(),
                out: None,
                telemetry: false,
            },
            cancel,
        ) {
            Ok(preview) => {
                preview_guard.succeed();
                preview
            }
            Err(err) => {
                preview_guard.fail(format!("{err:#}"));
                return Err(err);
            }
        };
        compare::compare_gate(&preview, opts.compare_exit)?;

        self.confirm(opts, &preview)?;

        // History breadcrumbs for every subsequent summary.
        let history = self
            .installer
            .history(&opts.release, HISTORY_LIMIT)
            .unwrap_or_default();
        let (crumbs, last_successful) = breadcrumbs(&history, HISTORY_LIMIT);
        summary.history = crumbs;
        summary.last_successful = last_successful;
        summary.action = if history.is_empty() {
            format!("Installing {} ({namespace})", opts.release)
        } else {
            format!("Upgrading {} ({namespace})", opts.release)
        };

        // Pre-render with resolved values: the tracker needs the target
        // set and the verify guard digests exactly what will be applied.
        let guard = PhaseGuard::start(self.bus, self.timer, phase::RENDER);
        let prerendered = match self.renderer.render(&render_request) {
            Ok(rendered) => {
                guard.succeed();
                rendered
            }
            Err(failure) => {
                guard.fail(failure.to_string());
                return Err(KtlError::from(failure).into());
            }
        };
        summary.version = prerendered.version.clone();

        if let Some(report) = &opts.verify_report {
            verify::enforce(report, &prerendered.manifest)?;
        }

        let tracker = if opts.dry_run {
            // Dry-run mutates nothing; there are no live objects to track.
            None
        } else {
            let keys: Vec<ResourceKey> = ManifestIndex::parse(&prerendered.manifest)
                .map_err(|err| KtlError::Input(format!("{err:#}")))?
                .keys()
                .cloned()
                .collect();
            Some(track::spawn(
                Arc::clone(&self.client),
                keys,
                namespace.to_string(),
                self.bus.clone(),
                cancel.clone(),
                TrackerConfig::default(),
            ))
        };

        self.bus.emit(EventKind::Summary(summary.clone()));

        let install_result = self.install(opts, namespace, &values, cancel);

        // The tracker must terminate before final status goes out.
        if let Some(tracker) = tracker {
            tracker.stop();
        }

        let release = install_result?;
        if let Some(release) = release {
            summary.version = release.chart.version.clone();
            summary.notes = if release.info.notes.is_empty() {
                None
            } else {
                Some(release.info.notes.clone())
            };
            let history = self
                .installer
                .history(&opts.release, HISTORY_LIMIT)
                .unwrap_or_default();
            let (crumbs, last_successful) = breadcrumbs(&history, HISTORY_LIMIT);
            summary.history = crumbs;
            summary.last_successful = last_successful;
        }
        Ok(())
    }

    fn ensure_namespace(&self, namespace: &str, create: bool) -> Result<()> {
        let exists = self
            .client
            .namespace_exists(namespace)
            .map_err(|err| KtlError::LiveLookup(err.to_string()))?;
        if exists {
            return Ok(());
        }
        if !create {
            return Err(KtlError::Input(format!(
                "namespace {namespace:?} does not exist (rerun with --create-namespace)"
            ))
            .into());
        }
        self.client
            .create_namespace(namespace)
            .map_err(|err| KtlError::Install(format!("failed to create namespace: {err}")))?;
        self.bus.log(LogPayload::new(
            LogLevel::Info,
            "apply",
            format!("created namespace {namespace}"),
        ));
        Ok(())
    }

    fn confirm(&self, opts: &ApplyOptions, preview: &PlanResult) -> Result<()> {
        if opts.dry_run || opts.auto_approve {
            return Ok(());
        }
        let guard = PhaseGuard::start(self.bus, self.timer, phase::CONFIRM);
        let Some(confirmer) = self.confirmer else {
            guard.fail("no interactive confirmer");
            return Err(KtlError::Input(
                "confirmation required but not running interactively (use --yes)".into(),
            )
            .into());
        };
        match confirmer.confirm_apply(preview) {
            Ok(true) => {
                guard.succeed();
                Ok(())
            }
            Ok(false) => {
                guard.fail("declined");
                Err(KtlError::Cancelled("apply declined at confirmation".into()).into())
            }
            Err(err) => {
                guard.fail(format!("{err:#}"));
                Err(err)
            }
        }
    }

    fn install(
        &self,
        opts: &ApplyOptions,
        namespace: &str,
        values: &ValueOverrides,
        cancel: &CancelToken,
    ) -> Result<Option<crate::install::Release>> {
        if opts.dry_run {
            self.bus.log(LogPayload::new(
                LogLevel::Info,
                "apply",
                "dry-run: skipping install",
            ));
            return Ok(None);
        }
        cancel.check()?;
        let guard = PhaseGuard::start(self.bus, self.timer, phase::INSTALL);
        let request = InstallRequest {
            release: opts.release.clone(),
            namespace: namespace.to_string(),
            chart: opts.chart.clone(),
            version: opts.version.clone(),
            value_files: values.files.clone(),
            set: values.set.clone(),
            set_string: values.set_string.clone(),
            set_file: values.set_file.clone(),
            include_crds: opts.include_crds,
            wait: opts.wait,
            atomic: opts.atomic,
            timeout: opts.timeout,
        };
        match self.installer.install_or_upgrade(&request, cancel) {
            Ok(release) => {
                guard.succeed_with(format!("revision {}", release.version));
                Ok(Some(release))
            }
            Err(failure) => {
                guard.fail(failure.to_string());
                Err(KtlError::from(failure).into())
            }
        }
    }

    /// Bounded tracking window after the final summary.
    fn post_wait_window(
        &self,
        opts: &ApplyOptions,
        namespace: &str,
        window: Duration,
        cancel: &CancelToken,
    ) {
        let guard = PhaseGuard::start(self.bus, self.timer, phase::POSTWAIT);
        let keys: Vec<ResourceKey> = match self.renderer.render(&RenderRequest {
            chart: opts.chart.clone(),
            version: opts.version.clone(),
            release: opts.release.clone(),
            namespace: namespace.to_string(),
            values: opts.values.clone(),
            include_crds: opts.include_crds,
            use_cluster: true,
        }) {
            Ok(rendered) => match ManifestIndex::parse(&rendered.manifest) {
                Ok(index) => index.keys().cloned().collect(),
                Err(_) => Vec::new(),
            },
            Err(_) => Vec::new(),
        };
        if keys.is_empty() {
            guard.succeed();
            return;
        }
        let tracker = track::spawn(
            Arc::clone(&self.client),
            keys,
            namespace.to_string(),
            self.bus.clone(),
            cancel.clone(),
            TrackerConfig::default(),
        );
        cancel.sleep(window);
        tracker.stop();
        guard.succeed();
    }
}
