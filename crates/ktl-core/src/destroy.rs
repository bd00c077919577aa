//! The destroy engine.
//!
//! Symmetric to apply: enumerate what the stored release manifest would
//! remove, confirm by exact release name, uninstall, summarize. Force mode
//! ignores missing objects and uses foreground deletion propagation.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use ktl_events::{EventBus, PhaseGuard, PhaseTimer};
use ktl_manifest::ManifestIndex;
use ktl_types::{
    EventKind, KtlError, LogLevel, LogPayload, ReleaseStatus, ResourcePhase, ResourceStatus,
    ResourcesPayload, SummaryPayload, phase,
};

use crate::apply::{Confirmer, HISTORY_LIMIT};
use crate::cancel::CancelToken;
use crate::install::{InstallFailure, Installer, UninstallOptions, breadcrumbs};

#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    pub release: String,
    pub namespace: String,
    pub wait: bool,
    pub keep_history: bool,
    pub disable_hooks: bool,
    /// Ignore missing objects and use foreground propagation.
    pub force: bool,
    pub auto_approve: bool,
    pub timeout: Duration,
}

pub struct DestroyEngine<'a> {
    pub installer: &'a dyn Installer,
    pub confirmer: Option<&'a dyn Confirmer>,
    pub bus: &'a EventBus,
    pub timer: &'a PhaseTimer,
}

impl DestroyEngine<'_> {
    pub fn execute(&self, opts: &DestroyOptions, cancel: &CancelToken) -> Result<SummaryPayload> {
        let namespace = if opts.namespace.is_empty() {
            "default".to_string()
        } else {
            opts.namespace.clone()
        };
        let mut summary = SummaryPayload {
            release: opts.release.clone(),
            namespace: namespace.clone(),
            action: format!("Destroying {} ({namespace})", opts.release),
            status: ReleaseStatus::Pending,
            ..Default::default()
        };

        let result = self.run(opts, cancel, &mut summary);

        match &result {
            Ok(()) => summary.status = ReleaseStatus::Destroyed,
            Err(err) => {
                summary.status = ReleaseStatus::Failed;
                summary.error = Some(format!("{err:#}"));
            }
        }
        summary.phase_durations = self.timer.formatted();
        self.bus.emit(EventKind::Summary(summary.clone()));
        result.map(|()| summary)
    }

    fn run(
        &self,
        opts: &DestroyOptions,
        cancel: &CancelToken,
        summary: &mut SummaryPayload,
    ) -> Result<()> {
        if opts.release.is_empty() {
            return Err(KtlError::Input("a release name is required".into()).into());
        }
        cancel.check()?;

        let release = match self.installer.get_release(&opts.release) {
            Ok(Some(release)) => Some(release),
            Ok(None) if opts.force => None,
            Ok(None) => {
                return Err(KtlError::Input(format!(
                    "release {:?} not found",
                    opts.release
                ))
                .into());
            }
            Err(InstallFailure::Cancelled) => {
                return Err(KtlError::Cancelled("release lookup".into()).into());
            }
            Err(err) => {
                return Err(KtlError::Install(format!("release lookup failed: {err}")).into());
            }
        };

        if let Some(release) = &release {
            summary.chart = release.chart.name.clone();
            summary.version = release.chart.version.clone();
            let history = self
                .installer
                .history(&opts.release, HISTORY_LIMIT)
                .unwrap_or_default();
            let (crumbs, last_successful) = breadcrumbs(&history, HISTORY_LIMIT);
            summary.history = crumbs;
            summary.last_successful = last_successful;

            // Preview: everything the stored manifest would take down.
            let index = ManifestIndex::parse(&release.manifest).unwrap_or_default();
            let now = Utc::now();
            let rows: Vec<ResourceStatus> = index
                .keys()
                .map(|key| ResourceStatus {
                    kind: key.kind.clone(),
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                    phase: ResourcePhase::Unknown,
                    message: "will be removed".to_string(),
                    first_seen: now,
                    last_update: now,
                })
                .collect();
            self.bus.log(LogPayload::new(
                LogLevel::Info,
                "destroy",
                format!(
                    "release {} revision {} removes {} resource(s)",
                    release.name,
                    release.version,
                    rows.len()
                ),
            ));
            self.bus
                .emit(EventKind::Resources(ResourcesPayload { resources: rows }));
        }

        self.confirm(opts)?;
        cancel.check()?;

        let guard = PhaseGuard::start(self.bus, self.timer, phase::DESTROY);
        let uninstall = UninstallOptions {
            wait: opts.wait,
            keep_history: opts.keep_history,
            disable_hooks: opts.disable_hooks,
            ignore_not_found: opts.force,
            foreground: opts.force,
            timeout: opts.timeout,
        };
        match self.installer.uninstall(&opts.release, &uninstall) {
            Ok(()) => {
                guard.succeed();
                Ok(())
            }
            Err(failure) => {
                guard.fail(failure.to_string());
                Err(KtlError::from(failure).into())
            }
        }
    }

    /// Destroy requires typing the exact release name.
    fn confirm(&self, opts: &DestroyOptions) -> Result<()> {
        if opts.auto_approve {
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
        let typed = confirmer.confirm_destroy(&opts.release)?;
        if typed == opts.release {
            guard.succeed();
            Ok(())
        } else {
            guard.fail("name mismatch");
            Err(KtlError::Cancelled(format!(
                "confirmation {typed:?} does not match release {:?}",
                opts.release
            ))
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeInstaller, ScriptedConfirmer};

    const MANIFEST: &str = "\
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: prod
";

    struct Rig {
        installer: FakeInstaller,
        bus: EventBus,
        timer: PhaseTimer,
    }

    impl Rig {
        fn new() -> Self {
            let installer = FakeInstaller::new();
            installer.seed_release("web", "core", "1.0.0", MANIFEST);
            Self {
                installer,
                bus: EventBus::new(),
                timer: PhaseTimer::new(),
            }
        }

        fn engine<'a>(&'a self, confirmer: Option<&'a dyn Confirmer>) -> DestroyEngine<'a> {
            DestroyEngine {
                installer: &self.installer,
                confirmer,
                bus: &self.bus,
                timer: &self.timer,
            }
        }
    }

    fn opts() -> DestroyOptions {
        DestroyOptions {
            release: "web".into(),
            namespace: "prod".into(),
            wait: true,
            auto_approve: true,
            timeout: Duration::from_secs(300),
            ..Default::default()
        }
    }

    #[test]
    fn destroys_and_reports_destroyed_status() {
        let rig = Rig::new();
        let summary = rig
            .engine(None)
            .execute(&opts(), &CancelToken::new())
            .unwrap();
        assert_eq!(summary.status, ReleaseStatus::Destroyed);
        assert_eq!(summary.chart, "core");
        assert_eq!(rig.installer.uninstall_calls().len(), 1);
    }

    #[test]
    fn preview_enumerates_resources_from_the_stored_manifest() {
        let rig = Rig::new();
        rig.engine(None)
            .execute(&opts(), &CancelToken::new())
            .unwrap();
        rig.bus.close_all(Duration::from_secs(5));
        let rows = rig
            .bus
            .retained()
            .iter()
            .find_map(|e| match &e.event {
                EventKind::Resources(r) => Some(r.resources.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "Service");
        assert_eq!(rows[0].message, "will be removed");
    }

    #[test]
    fn confirmation_requires_the_exact_release_name() {
        let rig = Rig::new();
        let confirmer = ScriptedConfirmer::typing("wrong-name");
        let mut options = opts();
        options.auto_approve = false;
        let err = rig
            .engine(Some(&confirmer))
            .execute(&options, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.downcast_ref::<KtlError>().unwrap().exit_code(), 4);
        assert!(rig.installer.uninstall_calls().is_empty());

        let confirmer = ScriptedConfirmer::typing("web");
        rig.engine(Some(&confirmer))
            .execute(&options, &CancelToken::new())
            .unwrap();
        assert_eq!(rig.installer.uninstall_calls().len(), 1);
    }

    #[test]
    fn unknown_release_is_an_input_error_unless_forced() {
        let rig = Rig::new();
        let mut options = opts();
        options.release = "ghost".into();
        let err = rig
            .engine(None)
            .execute(&options, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.downcast_ref::<KtlError>().unwrap().exit_code(), 1);

        options.force = true;
        rig.engine(None)
            .execute(&options, &CancelToken::new())
            .unwrap();
        let calls = rig.installer.uninstall_calls();
        assert!(calls.last().unwrap().1.ignore_not_found);
        assert!(calls.last().unwrap().1.foreground);
    }

    #[test]
    fn keep_history_flag_reaches_the_installer() {
        let rig = Rig::new();
        let mut options = opts();
        options.keep_history = true;
        rig.engine(None)
            .execute(&options, &CancelToken::new())
            .unwrap();
        assert!(rig.installer.uninstall_calls()[0].1.keep_history);
    }
}
