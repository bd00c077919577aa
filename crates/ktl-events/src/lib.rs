//! Event fan-out for deploy operations.
//!
//! The [`EventBus`] is the single place that serializes event ordering:
//! every producer (plan engine, apply engine, resource tracker) emits
//! through it, and every sink (terminal console, capture recorder, mirror
//! bus) consumes from it through its own bounded delivery queue. A slow or
//! broken observer never blocks the others.
//!
//! Late joiners get a replay of the retained backlog: all control events
//! are kept for the lifetime of the invocation, log events as a bounded
//! tail.

mod fabric;
mod mirror;
mod recorder;
mod timer;

pub use fabric::{DEFAULT_LOG_TAIL, DEFAULT_QUEUE_CAP, EventBus, Observer, ObserverId};
pub use mirror::MirrorBus;
pub use recorder::{JsonlRecorder, read_transcript};
pub use timer::{PhaseGuard, PhaseTimer, format_duration};
