//! # ktl-core
//!
//! The deploy pipeline: the end-to-end state machine that takes
//! `(chart, values, release, namespace)` and produces a confirmed,
//! auditable, observable cluster mutation.
//!
//! The crate is organized leaves-first:
//!
//! - [`diff`], [`graph`], [`quota`] - pure transforms over parsed manifests
//! - [`plan`] - render, diff against live, classify, and emit the
//!   deterministic [`ktl_types::PlanResult`] artifact
//! - [`drift`], [`verify`] - guards that block an apply before mutation
//! - [`track`] - background readiness polling during an apply
//! - [`apply`], [`destroy`] - the top-level engines
//! - [`client`], [`render`], [`install`] - contracts for the external
//!   collaborators (cluster I/O, chart rendering, release management)
//! - [`testutil`] - in-memory fakes for all three contracts
//!
//! Everything user-visible flows through the
//! [`ktl_events::EventBus`]; engines never print.

pub mod apply;
pub mod cancel;
pub mod client;
pub mod compare;
pub mod destroy;
pub mod diff;
pub mod drift;
pub mod graph;
pub mod install;
pub mod plan;
pub mod quota;
pub mod render;
pub mod secrets;
pub mod testutil;
pub mod track;
pub mod verify;

pub use apply::{ApplyEngine, ApplyOptions, Confirmer};
pub use cancel::CancelToken;
pub use client::{ClientError, KubeClient, RestMapping};
pub use destroy::{DestroyEngine, DestroyOptions};
pub use drift::{DriftGuard, DriftMode};
pub use install::{InstallFailure, InstallRequest, Installer, Release, UninstallOptions};
pub use plan::{PlanEngine, PlanOptions};
pub use render::{RenderFailure, RenderRequest, Rendered, Renderer, ValueOverrides};
pub use secrets::{ResolveMode, SecretProvider, SecretResolver};
pub use track::{TrackerConfig, TrackerHandle};
