//! Terminal rendering of the deploy stream.
//!
//! One observer, stateful enough to print resource transitions rather than
//! every snapshot. All output goes to stderr so stdout stays reserved for
//! artifacts (plan JSON, rendered manifests).

use std::collections::HashMap;
use std::io::IsTerminal;

use ktl_events::Observer;
use ktl_types::{
    EventKind, LogLevel, LogPayload, PhaseStatus, ReleaseStatus, ResourcePhase, StreamEvent,
    SummaryPayload,
};

pub struct ConsoleObserver {
    /// Last phase seen per resource, to print transitions only.
    resource_phases: HashMap<String, ResourcePhase>,
    show_diff: bool,
    color: bool,
}

impl ConsoleObserver {
    pub fn new(show_diff: bool) -> Self {
        Self {
            resource_phases: HashMap::new(),
            show_diff,
            color: std::io::stderr().is_terminal(),
        }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn print_summary(&self, summary: &SummaryPayload) {
        let status = match summary.status {
            ReleaseStatus::Deployed => self.paint("32", "deployed"),
            ReleaseStatus::Failed => self.paint("31", "failed"),
            ReleaseStatus::Destroyed => self.paint("33", "destroyed"),
            ReleaseStatus::Pending => "pending".to_string(),
            ReleaseStatus::Unknown => "unknown".to_string(),
        };
        eprintln!();
        eprintln!(
            "{} {} [{status}]",
            summary.action,
            if summary.version.is_empty() {
                summary.chart.clone()
            } else {
                format!("{} {}", summary.chart, summary.version)
            },
        );
        for crumb in &summary.history {
            let marker = if Some(crumb.revision) == summary.last_successful {
                "*"
            } else {
                " "
            };
            eprintln!(
                "  {marker} rev {:<3} {:<10} {}-{} {}",
                crumb.revision,
                crumb.status,
                crumb.chart,
                crumb.version,
                crumb.updated_at.format("%Y-%m-%d %H:%M:%S"),
            );
        }
        for secret in &summary.secrets {
            eprintln!(
                "  secret {}/{} ({})",
                secret.provider,
                secret.path,
                if secret.masked { "masked" } else { "resolved" }
            );
        }
        if !summary.phase_durations.is_empty() {
            let line = summary
                .phase_durations
                .iter()
                .map(|(name, d)| format!("{name}={d}"))
                .collect::<Vec<_>>()
                .join(" ");
            eprintln!("  timing: {line}");
        }
        if let Some(notes) = &summary.notes {
            eprintln!("  notes: {notes}");
        }
        if let Some(error) = &summary.error {
            eprintln!("  {}", self.paint("31", &format!("error: {error}")));
        }
    }
}

impl Observer for ConsoleObserver {
    fn name(&self) -> &str {
        "console"
    }

    fn handle_deploy_event(&mut self, event: &StreamEvent) -> anyhow::Result<()> {
        match &event.event {
            EventKind::Summary(summary) => self.print_summary(summary),
            EventKind::Phase(phase) => {
                let (glyph, code) = match phase.status {
                    PhaseStatus::Running => ("…", "2"),
                    PhaseStatus::Succeeded => ("✓", "32"),
                    PhaseStatus::Failed => ("✗", "31"),
                };
                let mut line = format!("{glyph} {}", phase.phase);
                if let Some(message) = &phase.message {
                    line.push_str(&format!(" ({message})"));
                }
                // Running lines are noise once the phase resolves.
                if phase.status != PhaseStatus::Running {
                    eprintln!("{}", self.paint(code, &line));
                }
            }
            EventKind::Resources(resources) => {
                for row in &resources.resources {
                    let id = format!("{}/{}/{}", row.kind, row.namespace, row.name);
                    let previous = self.resource_phases.insert(id.clone(), row.phase);
                    if previous != Some(row.phase) {
                        eprintln!("    {id}: {:?} {}", row.phase, row.message);
                    }
                }
            }
            EventKind::Health(health) => {
                eprintln!(
                    "    health: {}/{} ready ({} progressing, {} pending, {} degraded)",
                    health.ready, health.total, health.progressing, health.pending, health.degraded
                );
            }
            EventKind::Diff(diff) => {
                if let Some(summary) = &diff.summary {
                    eprintln!(
                        "plan: {} to create, {} to update, {} to delete, {} unchanged",
                        summary.creates, summary.updates, summary.deletes, summary.unchanged
                    );
                }
                if self.show_diff && !diff.text.is_empty() {
                    for line in diff.text.lines() {
                        let painted = match line.as_bytes().first() {
                            Some(b'+') => self.paint("32", line),
                            Some(b'-') => self.paint("31", line),
                            Some(b'@') => self.paint("36", line),
                            _ => line.to_string(),
                        };
                        eprintln!("{painted}");
                    }
                }
            }
            // The fabric routes logs to observe_log.
            EventKind::Log(_) => {}
        }
        Ok(())
    }

    fn observe_log(&mut self, _event: &StreamEvent, log: &LogPayload) -> anyhow::Result<()> {
        let level = match log.level {
            LogLevel::Debug => return Ok(()),
            LogLevel::Info => self.paint("2", "info"),
            LogLevel::Warn => self.paint("33", "warn"),
            LogLevel::Error => self.paint("31", "error"),
        };
        eprintln!("[{level}] {}: {}", log.source, log.message);
        Ok(())
    }
}
