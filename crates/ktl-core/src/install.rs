//! Release management contract.
//!
//! The installer owns the actual install/upgrade/uninstall mechanics
//! (including rollback when `atomic` is set) and the release store. The
//! engines only ever see [`Release`] snapshots and typed failures.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use ktl_types::{HistoryBreadcrumb, KtlError};

use crate::cancel::CancelToken;

/// A stored release revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub name: String,
    /// Revision number, starting at 1.
    pub version: i32,
    pub info: ReleaseInfo,
    pub chart: ChartInfo,
    /// The manifest as applied for this revision.
    pub manifest: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseInfo {
    /// Installer status word (`deployed`, `failed`, `superseded`, ...).
    pub status: String,
    pub last_deployed: DateTime<Utc>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
}

impl Release {
    pub fn breadcrumb(&self) -> HistoryBreadcrumb {
        HistoryBreadcrumb {
            revision: self.version,
            status: self.info.status.clone(),
            chart: self.chart.name.clone(),
            version: self.chart.version.clone(),
            updated_at: self.info.last_deployed,
        }
    }
}

/// Inputs for one install-or-upgrade call. Values arrive already resolved;
/// secret references never reach the installer unexpanded.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub release: String,
    pub namespace: String,
    pub chart: String,
    pub version: Option<String>,
    pub value_files: Vec<PathBuf>,
    pub set: Vec<(String, String)>,
    pub set_string: Vec<(String, String)>,
    pub set_file: Vec<(String, String)>,
    pub include_crds: bool,
    pub wait: bool,
    /// Roll back to the previous revision on any failure.
    pub atomic: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    pub wait: bool,
    pub keep_history: bool,
    pub disable_hooks: bool,
    pub ignore_not_found: bool,
    /// Use foreground deletion propagation.
    pub foreground: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Error)]
pub enum InstallFailure {
    #[error("{0}")]
    Failed(String),
    /// The operation failed and the installer rolled the release back to
    /// the previous revision. Carries the original cause.
    #[error("rolled back after failure: {cause}")]
    RolledBack { cause: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<InstallFailure> for KtlError {
    fn from(failure: InstallFailure) -> Self {
        match failure {
            InstallFailure::Failed(msg) => KtlError::Install(msg),
            InstallFailure::RolledBack { cause } => {
                KtlError::Install(format!("rolled back after failure: {cause}"))
            }
            InstallFailure::Timeout(msg) => KtlError::Cancelled(format!("timed out: {msg}")),
            InstallFailure::Cancelled => KtlError::Cancelled("install cancelled".to_string()),
        }
    }
}

pub trait Installer: Send + Sync {
    /// `Ok(None)` when no release with this name exists.
    fn get_release(&self, name: &str) -> Result<Option<Release>, InstallFailure>;

    /// Most recent first, at most `limit` revisions. Unknown releases
    /// yield an empty history.
    fn history(&self, name: &str, limit: usize) -> Result<Vec<Release>, InstallFailure>;

    fn install_or_upgrade(
        &self,
        request: &InstallRequest,
        cancel: &CancelToken,
    ) -> Result<Release, InstallFailure>;

    fn uninstall(&self, release: &str, options: &UninstallOptions) -> Result<(), InstallFailure>;
}

/// Breadcrumbs for summaries: most recent first, bounded, plus the
/// revision of the most recent successful deploy.
pub fn breadcrumbs(history: &[Release], limit: usize) -> (Vec<HistoryBreadcrumb>, Option<i32>) {
    let crumbs: Vec<HistoryBreadcrumb> =
        history.iter().take(limit).map(Release::breadcrumb).collect();
    let last_successful = history
        .iter()
        .find(|r| r.info.status == "deployed")
        .map(|r| r.version);
    (crumbs, last_successful)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn release(version: i32, status: &str) -> Release {
        Release {
            name: "web".into(),
            version,
            info: ReleaseInfo {
                status: status.into(),
                last_deployed: Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap(),
                notes: String::new(),
            },
            chart: ChartInfo {
                name: "core".into(),
                version: "1.2.3".into(),
            },
            manifest: String::new(),
        }
    }

    #[test]
    fn breadcrumbs_are_bounded_and_track_last_success() {
        let history: Vec<Release> = (0..10)
            .map(|i| release(10 - i, if i == 1 { "deployed" } else { "failed" }))
            .collect();
        let (crumbs, last) = breadcrumbs(&history, 6);
        assert_eq!(crumbs.len(), 6);
        assert_eq!(crumbs[0].revision, 10);
        assert_eq!(last, Some(9));
    }

    #[test]
    fn rolled_back_failure_keeps_the_original_cause() {
        let err: KtlError = InstallFailure::RolledBack {
            cause: "probe failed".into(),
        }
        .into();
        assert!(err.to_string().contains("probe failed"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn timeout_maps_to_cancellation_exit() {
        let err: KtlError = InstallFailure::Timeout("wait exceeded 5m".into()).into();
        assert_eq!(err.exit_code(), 4);
    }
}
