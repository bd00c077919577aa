use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ktl_types::{ApiCallStats, EventKind, PhasePayload, PhaseStatus};

use crate::fabric::EventBus;

#[derive(Debug, Default, Clone, Copy)]
struct PhaseSlot {
    started: Option<Instant>,
    total: Duration,
}

/// Per-phase duration accounting.
///
/// Phases may start and complete more than once per invocation (the drift
/// guard renders too); durations accumulate.
#[derive(Clone, Default)]
pub struct PhaseTimer {
    inner: Arc<Mutex<BTreeMap<String, PhaseSlot>>>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase_started(&self, name: &str) {
        let mut phases = self.inner.lock().unwrap();
        phases.entry(name.to_string()).or_default().started = Some(Instant::now());
    }

    pub fn phase_completed(&self, name: &str) {
        let mut phases = self.inner.lock().unwrap();
        if let Some(slot) = phases.get_mut(name) {
            if let Some(started) = slot.started.take() {
                slot.total += started.elapsed();
            }
        }
    }

    /// Copy of accumulated durations, lexical phase order.
    pub fn snapshot(&self) -> BTreeMap<String, Duration> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.total))
            .collect()
    }

    pub fn total(&self) -> Duration {
        self.snapshot().values().sum()
    }

    /// Pre-formatted `(phase, duration)` pairs for summary payloads.
    pub fn formatted(&self) -> Vec<(String, String)> {
        self.snapshot()
            .into_iter()
            .map(|(name, d)| (name, format_duration(d)))
            .collect()
    }

    /// One-line invocation telemetry: phases in lexical order, totals, and
    /// Kube API call statistics.
    pub fn telemetry_line(&self, api: &ApiCallStats) -> String {
        let phases = self
            .snapshot()
            .into_iter()
            .map(|(name, d)| format!("{name}={}", format_duration(d)))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "phases: {phases} | total={} | kube api: {} calls avg={}ms max={}ms",
            format_duration(self.total()),
            api.count,
            api.avg_ms,
            api.max_ms,
        )
    }
}

/// Millisecond-precision rendering used in summaries and telemetry.
pub fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

/// Times one phase and emits its `Phase` events.
///
/// `start` emits `running`; exactly one of [`PhaseGuard::succeed`] or
/// [`PhaseGuard::fail`] must follow. Dropping the guard without either
/// marks the phase failed, which keeps observers consistent on early
/// returns through `?`.
pub struct PhaseGuard<'a> {
    bus: &'a EventBus,
    timer: &'a PhaseTimer,
    name: String,
    finished: bool,
}

impl<'a> PhaseGuard<'a> {
    pub fn start(bus: &'a EventBus, timer: &'a PhaseTimer, name: &str) -> Self {
        timer.phase_started(name);
        bus.emit(EventKind::Phase(PhasePayload {
            phase: name.to_string(),
            status: PhaseStatus::Running,
            message: None,
        }));
        Self {
            bus,
            timer,
            name: name.to_string(),
            finished: false,
        }
    }

    pub fn succeed(mut self) {
        self.finish(PhaseStatus::Succeeded, None);
    }

    pub fn succeed_with(mut self, message: impl Into<String>) {
        self.finish(PhaseStatus::Succeeded, Some(message.into()));
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.finish(PhaseStatus::Failed, Some(message.into()));
    }

    fn finish(&mut self, status: PhaseStatus, message: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.timer.phase_completed(&self.name);
        self.bus.emit(EventKind::Phase(PhasePayload {
            phase: self.name.clone(),
            status,
            message,
        }));
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(PhaseStatus::Failed, None);
        }
    }
}
