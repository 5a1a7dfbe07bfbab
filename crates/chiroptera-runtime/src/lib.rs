//! `chiroptera-runtime` – session orchestration.
//!
//! Wires the sonar front end, the inertial filters, the distance fuser and
//! the room reconstructor into one long-running session.
//!
//! # Modules
//!
//! - [`session`] – [`SonarSession`][session::SonarSession] and its
//!   [`SessionHandle`][session::SessionHandle]: bounded producer queues, a
//!   single processing task, and `watch` snapshots of orientation, position,
//!   scan phase and the latest room model.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to ship spans to any OTLP collector.

pub mod session;
pub mod telemetry;

pub use session::{SessionConfig, SessionHandle, SessionStats, SonarSession};
pub use telemetry::{TracerProviderGuard, init_tracing};
