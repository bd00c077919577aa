//! Helm-backed renderer and installer.
//!
//! Shells out to the `helm` binary. Rendering uses `helm template`;
//! release management uses `helm upgrade --install`, `helm uninstall`,
//! `helm status`, `helm get manifest`, and `helm history`.

use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use ktl_core::cancel::CancelToken;
use ktl_core::install::{
    ChartInfo, InstallFailure, InstallRequest, Installer, Release, ReleaseInfo, UninstallOptions,
};
use ktl_core::render::{RenderFailure, RenderRequest, Rendered, Renderer};

pub struct Helm {
    /// Target namespace for release operations.
    pub namespace: String,
    /// Optional kubeconfig context.
    pub context: Option<String>,
}

struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

impl Helm {
    pub fn new(namespace: &str, context: Option<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            context,
        }
    }

    fn run(&self, args: &[String]) -> Result<CommandOutput, String> {
        let mut command = Command::new("helm");
        command.args(args);
        if let Some(context) = &self.context {
            command.arg("--kube-context").arg(context);
        }
        tracing::debug!(?args, "invoking helm");
        let output = command
            .output()
            .map_err(|err| format!("failed to invoke helm: {err}"))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        })
    }

    fn value_args(request: &InstallRequest) -> Vec<String> {
        let mut args = Vec::new();
        for file in &request.value_files {
            args.push("--values".to_string());
            args.push(file.display().to_string());
        }
        for (k, v) in &request.set {
            args.push("--set".to_string());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &request.set_string {
            args.push("--set-string".to_string());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &request.set_file {
            args.push("--set-file".to_string());
            args.push(format!("{k}={v}"));
        }
        args
    }
}

impl Renderer for Helm {
    fn render(&self, request: &RenderRequest) -> Result<Rendered, RenderFailure> {
        let mut args = vec![
            "template".to_string(),
            request.release.clone(),
            request.chart.clone(),
            "--namespace".to_string(),
            request.namespace.clone(),
        ];
        if let Some(version) = &request.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        for file in &request.values.files {
            args.push("--values".to_string());
            args.push(file.display().to_string());
        }
        for (k, v) in &request.values.set {
            args.push("--set".to_string());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &request.values.set_string {
            args.push("--set-string".to_string());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &request.values.set_file {
            args.push("--set-file".to_string());
            args.push(format!("{k}={v}"));
        }
        if request.include_crds {
            args.push("--include-crds".to_string());
        }
        if request.use_cluster {
            args.push("--validate".to_string());
        }

        let output = self.run(&args).map_err(RenderFailure::Template)?;
        if !output.success {
            let stderr = output.stderr.trim().to_string();
            return Err(if stderr.contains("not found") {
                RenderFailure::ChartNotFound(stderr)
            } else if stderr.contains("values") {
                RenderFailure::Values(stderr)
            } else {
                RenderFailure::Template(stderr)
            });
        }

        // Template provenance from the `# Source:` headers helm emits.
        let mut sources = std::collections::BTreeMap::new();
        for (id, (source, _)) in ktl_manifest::split_documents(&output.stdout)
            .into_iter()
            .enumerate()
        {
            if let Some(source) = source {
                sources.insert(id.to_string(), source);
            }
        }

        let version = match &request.version {
            Some(version) => version.clone(),
            None => self.chart_version(&request.chart).unwrap_or_default(),
        };

        Ok(Rendered {
            manifest: output.stdout,
            version,
            sources,
        })
    }
}

impl Helm {
    fn chart_version(&self, chart: &str) -> Option<String> {
        let output = self
            .run(&["show".to_string(), "chart".to_string(), chart.to_string()])
            .ok()?;
        if !output.success {
            return None;
        }
        output
            .stdout
            .lines()
            .find_map(|line| line.strip_prefix("version:"))
            .map(|v| v.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct HelmStatus {
    name: String,
    version: i32,
    info: HelmStatusInfo,
    #[serde(default)]
    chart: Option<HelmChart>,
}

#[derive(Debug, Deserialize)]
struct HelmStatusInfo {
    status: String,
    #[serde(default)]
    last_deployed: String,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Deserialize)]
struct HelmChart {
    metadata: HelmChartMetadata,
}

#[derive(Debug, Deserialize)]
struct HelmChartMetadata {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct HelmHistoryEntry {
    revision: i32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    chart: String,
    #[serde(default)]
    updated: String,
}

/// Helm prints a few different timestamp shapes depending on version.
fn parse_helm_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f %z %Z")
                .map(|t| t.with_timezone(&Utc))
        })
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

/// `core-1.2.3` -> (`core`, `1.2.3`).
fn split_chart_ref(chart: &str) -> (String, String) {
    match chart.rsplit_once('-') {
        Some((name, version)) if version.chars().next().is_some_and(|c| c.is_ascii_digit()) => {
            (name.to_string(), version.to_string())
        }
        _ => (chart.to_string(), String::new()),
    }
}

fn not_found(stderr: &str) -> bool {
    stderr.contains("release: not found") || stderr.contains("not found")
}

impl Installer for Helm {
    fn get_release(&self, name: &str) -> Result<Option<Release>, InstallFailure> {
        let status = self
            .run(&[
                "status".to_string(),
                name.to_string(),
                "--namespace".to_string(),
                self.namespace.clone(),
                "--output".to_string(),
                "json".to_string(),
            ])
            .map_err(InstallFailure::Failed)?;
        if !status.success {
            if not_found(&status.stderr) {
                return Ok(None);
            }
            return Err(InstallFailure::Failed(status.stderr.trim().to_string()));
        }
        let parsed: HelmStatus = serde_json::from_str(&status.stdout)
            .map_err(|err| InstallFailure::Failed(format!("bad helm status output: {err}")))?;

        let manifest = self
            .run(&[
                "get".to_string(),
                "manifest".to_string(),
                name.to_string(),
                "--namespace".to_string(),
                self.namespace.clone(),
            ])
            .map_err(InstallFailure::Failed)?;
        let manifest = if manifest.success {
            manifest.stdout
        } else {
            String::new()
        };

        let (chart_name, chart_version) = parsed
            .chart
            .map(|c| (c.metadata.name, c.metadata.version))
            .unwrap_or_else(|| (String::new(), String::new()));
        Ok(Some(Release {
            name: parsed.name,
            version: parsed.version,
            info: ReleaseInfo {
                status: parsed.info.status,
                last_deployed: parse_helm_time(&parsed.info.last_deployed),
                notes: parsed.info.notes,
            },
            chart: ChartInfo {
                name: chart_name,
                version: chart_version,
            },
            manifest,
        }))
    }

    fn history(&self, name: &str, limit: usize) -> Result<Vec<Release>, InstallFailure> {
        let output = self
            .run(&[
                "history".to_string(),
                name.to_string(),
                "--namespace".to_string(),
                self.namespace.clone(),
                "--max".to_string(),
                limit.to_string(),
                "--output".to_string(),
                "json".to_string(),
            ])
            .map_err(InstallFailure::Failed)?;
        if !output.success {
            if not_found(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(InstallFailure::Failed(output.stderr.trim().to_string()));
        }
        let entries: Vec<HelmHistoryEntry> = serde_json::from_str(&output.stdout)
            .map_err(|err| InstallFailure::Failed(format!("bad helm history output: {err}")))?;

        // Helm lists oldest first; summaries want most recent first.
        let mut releases: Vec<Release> = entries
            .into_iter()
            .map(|entry| {
                let (chart_name, chart_version) = split_chart_ref(&entry.chart);
                Release {
                    name: name.to_string(),
                    version: entry.revision,
                    info: ReleaseInfo {
                        status: entry.status,
                        last_deployed: parse_helm_time(&entry.updated),
                        notes: String::new(),
                    },
                    chart: ChartInfo {
                        name: chart_name,
                        version: chart_version,
                    },
                    manifest: String::new(),
                }
            })
            .collect();
        releases.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(releases)
    }

    fn install_or_upgrade(
        &self,
        request: &InstallRequest,
        cancel: &CancelToken,
    ) -> Result<Release, InstallFailure> {
        if cancel.is_cancelled() {
            return Err(InstallFailure::Cancelled);
        }
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            request.release.clone(),
            request.chart.clone(),
            "--namespace".to_string(),
            request.namespace.clone(),
        ];
        if let Some(version) = &request.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        args.extend(Self::value_args(request));
        if request.wait {
            args.push("--wait".to_string());
        }
        if request.atomic {
            args.push("--atomic".to_string());
        }
        if !request.timeout.is_zero() {
            args.push("--timeout".to_string());
            args.push(format!("{}s", request.timeout.as_secs()));
        }

        let output = self.run(&args).map_err(InstallFailure::Failed)?;
        if !output.success {
            let stderr = output.stderr.trim().to_string();
            if stderr.contains("timed out") {
                return Err(InstallFailure::Timeout(stderr));
            }
            if request.atomic {
                return Err(InstallFailure::RolledBack { cause: stderr });
            }
            return Err(InstallFailure::Failed(stderr));
        }

        self.get_release(&request.release)?.ok_or_else(|| {
            InstallFailure::Failed("release vanished immediately after install".to_string())
        })
    }

    fn uninstall(&self, release: &str, options: &UninstallOptions) -> Result<(), InstallFailure> {
        let mut args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
        ];
        if options.wait {
            args.push("--wait".to_string());
        }
        if options.keep_history {
            args.push("--keep-history".to_string());
        }
        if options.disable_hooks {
            args.push("--no-hooks".to_string());
        }
        if options.foreground {
            args.push("--cascade".to_string());
            args.push("foreground".to_string());
        }
        if !options.timeout.is_zero() {
            args.push("--timeout".to_string());
            args.push(format!("{}s", options.timeout.as_secs()));
        }

        let output = self.run(&args).map_err(InstallFailure::Failed)?;
        if !output.success {
            if options.ignore_not_found && not_found(&output.stderr) {
                return Ok(());
            }
            return Err(InstallFailure::Failed(output.stderr.trim().to_string()));
        }
        Ok(())
    }
}
