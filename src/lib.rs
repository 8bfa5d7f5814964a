//! # kpa-gateway
//!
//! Gateway for a binary framed command/telemetry protocol over TCP.
//!
//! Remote endpoints send commands, telemetry, receipts and log/text
//! messages; the gateway decodes them, dispatches them to registered
//! handlers, acknowledges commands with receipts, and runs periodic
//! background producers that push frames back out.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): 12-byte little-endian header plus six
//!   tag-driven payload variants. Pure, no I/O.
//! - **Transport** ([`transport`]): one readiness-based event loop thread
//!   serving every socket, and a dispatcher thread raising `received`.
//! - **Routing** ([`handler`]): `(cmd_type, cmd_code)` and `telemetry_type`
//!   dispatch tables.
//! - **Workers** ([`worker`]): independently started periodic tasks.
//! - **Façade** ([`Gateway`]): wires the above together.
//!
//! Logging goes through `tracing`; install a subscriber to see it.
//!
//! ## Example
//!
//! ```no_run
//! use kpa_gateway::Gateway;
//! use kpa_gateway::protocol::CommandArg;
//!
//! # fn main() -> kpa_gateway::Result<()> {
//! let gateway = Gateway::builder()
//!     .bind("0.0.0.0:4000".parse().unwrap())
//!     .build();
//!
//! gateway.register_command_handler(2, 3, |args: &[CommandArg]| {
//!     matches!(args, [CommandArg::Word(5)])
//! });
//!
//! gateway.start()?;
//! // ...
//! gateway.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;
pub mod worker;
pub mod writer;

mod client;
mod gateway;
mod sync;

pub use client::GatewayClient;
pub use config::GatewayConfig;
pub use error::{CodecError, GatewayError, Result};
pub use gateway::{FrameSender, Gateway, GatewayBuilder};
pub use handler::{AddressHandler, CommandHandler, RoutingRegistry, TelemetryHandler};
pub use protocol::{
    AddressParameter, AddressTelemetry, Command, LogMessage, Message, Payload, PositionTelemetry,
    Receipt, TransportFrame,
};
pub use transport::{ConnectionEvent, ConnectionId, DataEvent, Multiplexer, MultiplexerConfig};
pub use worker::{Scheduler, TaskResult, Worker};
