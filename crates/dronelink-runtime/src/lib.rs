//! `dronelink-runtime` – the running relay.
//!
//! # Modules
//!
//! - [`relay_service`] – [`RelayService`]: composition root owning the
//!   queue, link, throttle controller, observer registry, hub, and heartbeat
//!   monitor; runs the priority drain loop until shutdown.
//! - [`throttle`] – [`ThrottleController`]: turns absolute throttle
//!   set-points into synthetic increase/decrease key sequences, one
//!   adjustment routine at a time.
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with an
//!   optional OTLP span exporter (`OTEL_EXPORTER_OTLP_ENDPOINT`).

pub mod relay_service;
pub mod telemetry;
pub mod throttle;

pub use relay_service::{DEFAULT_DRAIN_PAUSE, RelayConfig, RelayService};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use throttle::{DEFAULT_STEP_DELAY, ThrottleConfig, ThrottleController};
