//! Transport module - TCP multiplexing.
//!
//! Provides:
//! - [`Multiplexer`]: event loop plus dispatcher over many client sockets
//! - [`Poller`]: the readiness facility underneath (mio by default)
//! - [`Signal`]: subscriber lists for connection and data events

mod connection;
mod multiplexer;
mod poller;
mod signal;

pub use connection::ConnectionId;
pub use multiplexer::{Multiplexer, MultiplexerConfig, MultiplexerHandle};
pub use poller::{MioPoller, Notify, Poller, ReadyEvent};
pub use signal::{ConnectionEvent, DataEvent, Events, Signal, SubscriptionId};
