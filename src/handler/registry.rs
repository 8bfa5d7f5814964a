//! Routing registry for dispatching commands and telemetry.
//!
//! Commands are keyed by `(cmd_type, cmd_code)`. Position telemetry and
//! address-telemetry parameters are both keyed by `telemetry_type`; an
//! address handler sees the whole parameter, `arg_num` included. Registering a key twice replaces the earlier handler
//! without complaint. Both tables sit behind a `RwLock`, so registering after
//! the gateway has started is allowed.
//!
//! # Example
//!
//! ```
//! use kpa_gateway::handler::RoutingRegistry;
//! use kpa_gateway::protocol::CommandArg;
//!
//! let registry = RoutingRegistry::new();
//! registry.register_command(2, 3, |args: &[CommandArg]| !args.is_empty());
//!
//! let handler = registry.route_command(2, 3).unwrap();
//! assert!(handler.call(&[CommandArg::Word(5)]));
//! assert!(registry.route_command(2, 4).is_none());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::protocol::{AddressParameter, CommandArg};
use crate::sync::{read, write};

/// Handles one command. Returns `true` on success.
pub trait CommandHandler: Send + Sync + 'static {
    fn call(&self, args: &[CommandArg]) -> bool;
}

impl<F> CommandHandler for F
where
    F: Fn(&[CommandArg]) -> bool + Send + Sync + 'static,
{
    fn call(&self, args: &[CommandArg]) -> bool {
        self(args)
    }
}

/// Handles raw telemetry bytes.
pub trait TelemetryHandler: Send + Sync + 'static {
    fn call(&self, data: &[u8]);
}

impl<F> TelemetryHandler for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn call(&self, data: &[u8]) {
        self(data)
    }
}

/// Handles one address-telemetry parameter.
pub trait AddressHandler: Send + Sync + 'static {
    fn call(&self, param: &AddressParameter);
}

impl<F> AddressHandler for F
where
    F: Fn(&AddressParameter) + Send + Sync + 'static,
{
    fn call(&self, param: &AddressParameter) {
        self(param)
    }
}

/// Key of the command table.
pub type CommandKey = (u16, u32);

/// Command and telemetry dispatch tables.
#[derive(Default)]
pub struct RoutingRegistry {
    commands: RwLock<HashMap<CommandKey, Arc<dyn CommandHandler>>>,
    telemetry: RwLock<HashMap<u16, Arc<dyn TelemetryHandler>>>,
    address: RwLock<HashMap<u16, Arc<dyn AddressHandler>>>,
}

impl RoutingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command handler, replacing any previous one for the key.
    pub fn register_command<H>(&self, cmd_type: u16, cmd_code: u32, handler: H)
    where
        H: CommandHandler,
    {
        let replaced = write(&self.commands)
            .insert((cmd_type, cmd_code), Arc::new(handler))
            .is_some();
        tracing::debug!(
            "command handler registered for ({}, {}){}",
            cmd_type,
            cmd_code,
            if replaced { ", replacing previous" } else { "" }
        );
    }

    /// Register a telemetry handler, replacing any previous one for the type.
    pub fn register_telemetry<H>(&self, telemetry_type: u16, handler: H)
    where
        H: TelemetryHandler,
    {
        let replaced = write(&self.telemetry)
            .insert(telemetry_type, Arc::new(handler))
            .is_some();
        tracing::debug!(
            "telemetry handler registered for type {}{}",
            telemetry_type,
            if replaced { ", replacing previous" } else { "" }
        );
    }

    /// Register an address-telemetry handler, replacing any previous one for
    /// the type.
    pub fn register_address<H>(&self, telemetry_type: u16, handler: H)
    where
        H: AddressHandler,
    {
        let replaced = write(&self.address)
            .insert(telemetry_type, Arc::new(handler))
            .is_some();
        tracing::debug!(
            "address handler registered for type {}{}",
            telemetry_type,
            if replaced { ", replacing previous" } else { "" }
        );
    }

    /// Look up the handler for a command. A miss is not an error.
    pub fn route_command(&self, cmd_type: u16, cmd_code: u32) -> Option<Arc<dyn CommandHandler>> {
        read(&self.commands).get(&(cmd_type, cmd_code)).cloned()
    }

    /// Look up the handler for a telemetry type.
    pub fn route_telemetry(&self, telemetry_type: u16) -> Option<Arc<dyn TelemetryHandler>> {
        read(&self.telemetry).get(&telemetry_type).cloned()
    }

    /// Look up the address-telemetry handler for a type.
    pub fn route_address(&self, telemetry_type: u16) -> Option<Arc<dyn AddressHandler>> {
        read(&self.address).get(&telemetry_type).cloned()
    }

    /// Remove a command handler. Returns `true` if one was registered.
    pub fn unregister_command(&self, cmd_type: u16, cmd_code: u32) -> bool {
        write(&self.commands).remove(&(cmd_type, cmd_code)).is_some()
    }

    /// Remove a telemetry handler. Returns `true` if one was registered.
    pub fn unregister_telemetry(&self, telemetry_type: u16) -> bool {
        write(&self.telemetry).remove(&telemetry_type).is_some()
    }

    /// Remove an address-telemetry handler. Returns `true` if one was
    /// registered.
    pub fn unregister_address(&self, telemetry_type: u16) -> bool {
        write(&self.address).remove(&telemetry_type).is_some()
    }

    /// Registered command keys, sorted.
    pub fn command_keys(&self) -> Vec<CommandKey> {
        let mut keys: Vec<_> = read(&self.commands).keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Registered telemetry types, sorted.
    pub fn telemetry_types(&self) -> Vec<u16> {
        let mut types: Vec<_> = read(&self.telemetry).keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Telemetry types with an address handler, sorted.
    pub fn address_types(&self) -> Vec<u16> {
        let mut types: Vec<_> = read(&self.address).keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for RoutingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRegistry")
            .field("commands", &self.command_keys())
            .field("telemetry", &self.telemetry_types())
            .field("address", &self.address_types())
            .finish()
    }
}
