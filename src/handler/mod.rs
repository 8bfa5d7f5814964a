//! Handler module - routing of decoded frames to application code.
//!
//! Provides:
//! - [`RoutingRegistry`] - maps command and telemetry keys to handlers
//! - [`CommandHandler`] / [`TelemetryHandler`] / [`AddressHandler`] - implemented for plain closures

mod registry;

pub use registry::{AddressHandler, CommandHandler, CommandKey, RoutingRegistry, TelemetryHandler};
