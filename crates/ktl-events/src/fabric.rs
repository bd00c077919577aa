use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;

use ktl_types::{EventKind, LogPayload, StreamEvent};

/// Retained log tail for late-joiner replay.
pub const DEFAULT_LOG_TAIL: usize = 500;

/// Per-observer delivery queue bound.
pub const DEFAULT_QUEUE_CAP: usize = 256;

/// A sink for deploy events.
///
/// Observers implement the capabilities they care about; the fabric routes
/// `Log` events to [`Observer::observe_log`] and everything else to
/// [`Observer::handle_deploy_event`]. Errors are counted and logged, never
/// propagated to producers.
pub trait Observer: Send {
    fn name(&self) -> &str;

    fn handle_deploy_event(&mut self, _event: &StreamEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn observe_log(&mut self, _event: &StreamEvent, _log: &LogPayload) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once, after the observer's queue has drained.
    fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct QueueState {
    items: VecDeque<StreamEvent>,
    closed: bool,
    dropped_logs: u64,
}

struct DeliveryQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
    cap: usize,
}

impl DeliveryQueue {
    fn new(cap: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                dropped_logs: 0,
            }),
            cv: Condvar::new(),
            cap,
        }
    }

    /// Enqueue one event. On overflow the oldest queued log event is
    /// evicted first; Summary/Phase/Resources/Health/Diff events are never
    /// dropped, so the queue may exceed its bound when an observer stalls
    /// on essential traffic.
    fn push(&self, event: StreamEvent) {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return;
        }
        if st.items.len() >= self.cap {
            if let Some(pos) = st.items.iter().position(StreamEvent::is_log) {
                st.items.remove(pos);
                st.dropped_logs += 1;
            } else if event.is_log() {
                st.dropped_logs += 1;
                return;
            }
        }
        st.items.push_back(event);
        drop(st);
        self.cv.notify_one();
    }

    /// Block until an event is available or the queue is closed and empty.
    fn pop(&self) -> Option<StreamEvent> {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(event) = st.items.pop_front() {
                return Some(event);
            }
            if st.closed {
                return None;
            }
            st = self.cv.wait(st).unwrap();
        }
    }

    fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        drop(st);
        self.cv.notify_all();
    }

    fn dropped_logs(&self) -> u64 {
        self.state.lock().unwrap().dropped_logs
    }
}

struct ObserverSlot {
    id: ObserverId,
    name: String,
    queue: Arc<DeliveryQueue>,
    worker: Option<JoinHandle<()>>,
}

struct BusState {
    /// All non-log events, in emission order, retained for the lifetime of
    /// the invocation.
    control: Vec<StreamEvent>,
    /// Bounded tail of log events.
    logs: VecDeque<StreamEvent>,
    observers: Vec<ObserverSlot>,
    next_id: u64,
}

/// In-process broadcaster for [`StreamEvent`]s.
///
/// Cloning is cheap; all clones share the same retained backlog and
/// observer set. The bus imposes a total order on events: every observer
/// sees the same sequence.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
    log_tail: usize,
    queue_cap: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_bounds(DEFAULT_LOG_TAIL, DEFAULT_QUEUE_CAP)
    }

    pub fn with_bounds(log_tail: usize, queue_cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState {
                control: Vec::new(),
                logs: VecDeque::new(),
                observers: Vec::new(),
                next_id: 0,
            })),
            log_tail,
            queue_cap,
        }
    }

    /// Stamp, retain, and fan out one event. The timestamp is assigned
    /// here; ties in concurrent emission are broken by arrival under the
    /// bus lock.
    pub fn emit(&self, kind: EventKind) -> StreamEvent {
        let event = StreamEvent {
            at: Utc::now(),
            event: kind,
        };
        let mut st = self.inner.lock().unwrap();
        if event.is_log() {
            st.logs.push_back(event.clone());
            while st.logs.len() > self.log_tail {
                st.logs.pop_front();
            }
        } else {
            st.control.push(event.clone());
        }
        for slot in &st.observers {
            slot.queue.push(event.clone());
        }
        event
    }

    /// Convenience for leveled log lines.
    pub fn log(&self, log: LogPayload) -> StreamEvent {
        self.emit(EventKind::Log(log))
    }

    /// Attach an observer and replay the retained backlog into its queue
    /// before it sees any new event.
    ///
    /// Replay follows the canonical order Summary, Phase, Resources,
    /// Health, Diff, then the log tail; within each group the original
    /// emission order is preserved.
    pub fn attach(&self, observer: Box<dyn Observer>) -> ObserverId {
        let mut st = self.inner.lock().unwrap();
        let id = ObserverId(st.next_id);
        st.next_id += 1;

        let name = observer.name().to_string();
        let queue = Arc::new(DeliveryQueue::new(self.queue_cap));
        for event in replay_order(&st.control) {
            queue.push(event.clone());
        }
        for event in &st.logs {
            queue.push(event.clone());
        }

        let worker_queue = Arc::clone(&queue);
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("observer-{worker_name}"))
            .spawn(move || deliver_loop(worker_queue, observer))
            .expect("failed to spawn observer thread");

        st.observers.push(ObserverSlot {
            id,
            name,
            queue,
            worker: Some(worker),
        });
        id
    }

    /// Detach one observer. Idempotent; the observer sees no further
    /// events after this returns. Queued events are still delivered before
    /// its `close` runs.
    pub fn detach(&self, id: ObserverId) {
        let slot = {
            let mut st = self.inner.lock().unwrap();
            let Some(pos) = st.observers.iter().position(|s| s.id == id) else {
                return;
            };
            st.observers.remove(pos)
        };
        finish_slot(slot, Duration::from_secs(5));
    }

    /// Close every observer, giving each up to `grace` to drain and run
    /// its `close`.
    pub fn close_all(&self, grace: Duration) {
        let slots = {
            let mut st = self.inner.lock().unwrap();
            std::mem::take(&mut st.observers)
        };
        for slot in slots {
            finish_slot(slot, grace);
        }
    }

    /// Copy of the retained backlog (control events then log tail), used
    /// by tests and by the capture artifact writer.
    pub fn retained(&self) -> Vec<StreamEvent> {
        let st = self.inner.lock().unwrap();
        st.control
            .iter()
            .chain(st.logs.iter())
            .cloned()
            .collect()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().unwrap().observers.len()
    }
}

/// Order retained control events for replay: group by variant in the
/// canonical order, preserving emission order within each group.
fn replay_order(control: &[StreamEvent]) -> Vec<&StreamEvent> {
    let rank = |e: &StreamEvent| match e.event {
        EventKind::Summary(_) => 0,
        EventKind::Phase(_) => 1,
        EventKind::Resources(_) => 2,
        EventKind::Health(_) => 3,
        EventKind::Diff(_) => 4,
        EventKind::Log(_) => 5,
    };
    let mut ordered: Vec<&StreamEvent> = control.iter().collect();
    // Stable sort: emission order is preserved within each group.
    ordered.sort_by_key(|e| rank(e));
    ordered
}

fn deliver_loop(queue: Arc<DeliveryQueue>, mut observer: Box<dyn Observer>) {
    while let Some(event) = queue.pop() {
        let result = match &event.event {
            EventKind::Log(log) => observer.observe_log(&event, log),
            _ => observer.handle_deploy_event(&event),
        };
        if let Err(err) = result {
            tracing::warn!(observer = observer.name(), %err, "observer delivery failed");
        }
    }
    let dropped = queue.dropped_logs();
    if dropped > 0 {
        tracing::debug!(observer = observer.name(), dropped, "log events dropped on overflow");
    }
    observer.close();
}

fn finish_slot(mut slot: ObserverSlot, grace: Duration) {
    slot.queue.close();
    let Some(worker) = slot.worker.take() else {
        return;
    };
    let deadline = Instant::now() + grace;
    while !worker.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if worker.is_finished() {
        let _ = worker.join();
    } else {
        // The observer is stuck in its own code past the grace window.
        // Abandon the thread rather than hang the engine's shutdown.
        tracing::warn!(observer = %slot.name, "observer did not close within grace period");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_types::{LogLevel, PhasePayload, PhaseStatus, SummaryPayload, phase};
    use std::sync::mpsc;

    struct Collector {
        name: String,
        tx: mpsc::Sender<StreamEvent>,
        closed_tx: mpsc::Sender<()>,
    }

    impl Observer for Collector {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle_deploy_event(&mut self, event: &StreamEvent) -> anyhow::Result<()> {
            self.tx.send(event.clone())?;
            Ok(())
        }

        fn observe_log(&mut self, event: &StreamEvent, _log: &LogPayload) -> anyhow::Result<()> {
            self.tx.send(event.clone())?;
            Ok(())
        }

        fn close(&mut self) {
            let _ = self.closed_tx.send(());
        }
    }

    fn collector(name: &str) -> (Box<Collector>, mpsc::Receiver<StreamEvent>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let (closed_tx, closed_rx) = mpsc::channel();
        (
            Box::new(Collector {
                name: name.to_string(),
                tx,
                closed_tx,
            }),
            rx,
            closed_rx,
        )
    }

    fn phase_event(name: &str) -> EventKind {
        EventKind::Phase(PhasePayload {
            phase: name.to_string(),
            status: PhaseStatus::Running,
            message: None,
        })
    }

    fn drain(rx: &mpsc::Receiver<StreamEvent>, n: usize) -> Vec<StreamEvent> {
        (0..n)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("event"))
            .collect()
    }

    #[test]
    fn all_observers_see_the_same_order() {
        let bus = EventBus::new();
        let (a, rx_a, _) = collector("a");
        let (b, rx_b, _) = collector("b");
        bus.attach(a);
        bus.attach(b);

        for name in [phase::RENDER, phase::DIFF, phase::INSTALL] {
            bus.emit(phase_event(name));
        }
        bus.log(LogPayload::new(LogLevel::Info, "plan", "hello"));

        let seen_a = drain(&rx_a, 4);
        let seen_b = drain(&rx_b, 4);
        assert_eq!(seen_a, seen_b);
        bus.close_all(Duration::from_secs(5));
    }

    #[test]
    fn late_attach_replays_retained_prefix_in_canonical_order() {
        let bus = EventBus::new();
        bus.log(LogPayload::new(LogLevel::Info, "plan", "first log"));
        bus.emit(phase_event(phase::RENDER));
        bus.emit(EventKind::Summary(SummaryPayload::default()));

        let (obs, rx, _) = collector("late");
        bus.attach(obs);
        bus.emit(phase_event(phase::DIFF));

        let seen = drain(&rx, 4);
        // Replay: summary first, then the phase, then the log tail; the
        // post-attach phase event arrives last.
        assert!(matches!(seen[0].event, EventKind::Summary(_)));
        assert!(matches!(seen[1].event, EventKind::Phase(_)));
        assert!(matches!(seen[2].event, EventKind::Log(_)));
        match &seen[3].event {
            EventKind::Phase(p) => assert_eq!(p.phase, phase::DIFF),
            other => panic!("unexpected event {other:?}"),
        }
        bus.close_all(Duration::from_secs(5));
    }

    #[test]
    fn log_tail_is_bounded() {
        let bus = EventBus::with_bounds(3, DEFAULT_QUEUE_CAP);
        for i in 0..10 {
            bus.log(LogPayload::new(LogLevel::Info, "t", format!("line {i}")));
        }
        let retained = bus.retained();
        assert_eq!(retained.len(), 3);
        match &retained[0].event {
            EventKind::Log(l) => assert_eq!(l.message, "line 7"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn detach_is_idempotent_and_closes_observer() {
        let bus = EventBus::new();
        let (obs, _rx, closed_rx) = collector("x");
        let id = bus.attach(obs);
        bus.detach(id);
        bus.detach(id);
        closed_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("close ran");
        assert_eq!(bus.observer_count(), 0);
    }

    #[test]
    fn overflow_drops_oldest_logs_never_control_events() {
        let queue = DeliveryQueue::new(2);
        let log = |msg: &str| StreamEvent {
            at: Utc::now(),
            event: EventKind::Log(LogPayload::new(LogLevel::Info, "t", msg)),
        };
        let control = StreamEvent {
            at: Utc::now(),
            event: phase_event(phase::WAIT),
        };
        queue.push(log("one"));
        queue.push(log("two"));
        queue.push(control.clone());
        // Cap is 2: "one" was evicted to make room for the control event.
        assert_eq!(queue.dropped_logs(), 1);
        let first = queue.pop().unwrap();
        match first.event {
            EventKind::Log(l) => assert_eq!(l.message, "two"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!queue.pop().unwrap().is_log());
    }
}
