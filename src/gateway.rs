//! Gateway façade.
//!
//! Ties the pieces together: the [`Multiplexer`] delivers complete frames,
//! the gateway decodes them, looks up a handler in the [`RoutingRegistry`],
//! runs it, and for commands sends a [`Receipt`] back on the connection the
//! command came from. Periodic workers run beside it and push frames out
//! through a [`FrameSender`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use kpa_gateway::{Gateway, PositionTelemetry, TransportFrame};
//! use kpa_gateway::protocol::CommandArg;
//!
//! # fn main() -> kpa_gateway::Result<()> {
//! let gateway = Gateway::builder().bind("0.0.0.0:4000".parse().unwrap()).build();
//!
//! gateway.register_command_handler(2, 3, |args: &[CommandArg]| {
//!     tracing::info!("power on: {:?}", args);
//!     true
//! });
//! gateway.register_telemetry_handler(1, |data: &[u8]| {
//!     tracing::info!("position: {} bytes", data.len());
//! });
//!
//! let sender = gateway.sender();
//! gateway.add_periodic_worker(
//!     "position",
//!     Duration::from_secs(1),
//!     move |station: &std::net::IpAddr| {
//!         let frame = TransportFrame::new(PositionTelemetry {
//!             telemetry_type: 1,
//!             data: vec![0u8; 16].into(),
//!         });
//!         sender.send_to_ip(*station, &frame)?;
//!         Ok(())
//!     },
//!     "192.168.0.10".parse().unwrap(),
//! );
//!
//! gateway.start()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::handler::{AddressHandler, CommandHandler, RoutingRegistry, TelemetryHandler};
use crate::protocol::{
    hex, AddressParameter, Command, FrameId, Payload, Receipt, TransportFrame,
};
use crate::transport::{
    ConnectionEvent, ConnectionId, DataEvent, Events, Multiplexer, MultiplexerHandle,
    SubscriptionId,
};
use crate::worker::{Scheduler, TaskResult, Worker};

/// Cloneable handle for sending frames through a running gateway.
///
/// Safe to use from any thread, including handlers and worker tasks.
#[derive(Clone, Debug)]
pub struct FrameSender {
    handle: MultiplexerHandle,
}

impl FrameSender {
    /// Encode `frame` and queue it on one connection.
    pub fn send_to(&self, connection: ConnectionId, frame: &TransportFrame) -> Result<()> {
        let bytes = frame.encode()?;
        tracing::debug!("send to {}: {}", connection, frame);
        self.handle.send_to(connection, bytes)
    }

    /// Encode `frame` and queue it on every connection from `ip`.
    /// Returns the number of connections.
    pub fn send_to_ip(&self, ip: IpAddr, frame: &TransportFrame) -> Result<usize> {
        let bytes = frame.encode()?;
        tracing::debug!("send to {}: {}", ip, frame);
        self.handle.send_to_ip(ip, bytes)
    }

    /// Queue pre-encoded bytes on one connection.
    pub fn send_raw_to(&self, connection: ConnectionId, data: Bytes) -> Result<()> {
        self.handle.send_to(connection, data)
    }

    /// Send `Receipt { receipt_num, return_code: 0 }`.
    pub fn send_ack(&self, connection: ConnectionId, receipt_num: u16) -> Result<()> {
        self.send_to(connection, &TransportFrame::new(Receipt::ack(receipt_num)))
    }

    /// Send `Receipt { receipt_num, return_code: 1 }`.
    pub fn send_nack(&self, connection: ConnectionId, receipt_num: u16) -> Result<()> {
        self.send_to(connection, &TransportFrame::new(Receipt::nack(receipt_num)))
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

/// Decodes received frames and dispatches them to handlers.
struct Router {
    registry: Arc<RoutingRegistry>,
    sender: FrameSender,
}

impl Router {
    fn route(&self, event: &DataEvent) {
        let frame = match TransportFrame::decode(&event.data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    "dropping frame from {}: {} [{}]",
                    event.connection,
                    e,
                    hex(&event.data)
                );
                return;
            }
        };
        tracing::info!("{} -> {}", event.connection, frame);

        match &frame.payload {
            Payload::Command(command) => self.route_command(event.connection, command),
            Payload::PositionTelemetry(telemetry) => {
                self.route_telemetry(telemetry.telemetry_type, &telemetry.data)
            }
            Payload::AddressTelemetry(telemetry) => {
                for param in &telemetry.params {
                    self.route_address(param);
                }
            }
            Payload::Receipt(receipt) if !receipt.is_success() => tracing::warn!(
                "{} reported failure for {}: code {}",
                event.connection,
                receipt.receipt_num,
                receipt.return_code
            ),
            Payload::Receipt(_) | Payload::Message(_) | Payload::LogMessage(_) => {}
        }
    }

    fn route_command(&self, connection: ConnectionId, command: &Command) {
        let Some(handler) = self.registry.route_command(command.cmd_type, command.cmd_code) else {
            tracing::debug!(
                "no handler for command ({}, {}), ignored",
                command.cmd_type,
                command.cmd_code
            );
            return;
        };

        let success = match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&command.args))) {
            Ok(success) => success,
            Err(_) => {
                tracing::error!(
                    "handler for command ({}, {}) panicked",
                    command.cmd_type,
                    command.cmd_code
                );
                false
            }
        };

        let receipt_num = FrameId::Command.as_u16();
        let result = if success {
            self.sender.send_ack(connection, receipt_num)
        } else {
            self.sender.send_nack(connection, receipt_num)
        };
        if let Err(e) = result {
            tracing::warn!("failed to send receipt to {}: {}", connection, e);
        }
    }

    /// Address handler for the parameter's type if there is one, otherwise
    /// the plain telemetry handler with the value bytes.
    fn route_address(&self, param: &AddressParameter) {
        let Some(handler) = self.registry.route_address(param.telemetry_type) else {
            self.route_telemetry(param.telemetry_type, &param.value);
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| handler.call(param))).is_err() {
            tracing::error!(
                "address handler for telemetry type {} (arg {}) panicked",
                param.telemetry_type,
                param.arg_num
            );
        }
    }

    fn route_telemetry(&self, telemetry_type: u16, data: &[u8]) {
        let Some(handler) = self.registry.route_telemetry(telemetry_type) else {
            tracing::debug!("no handler for telemetry type {}, ignored", telemetry_type);
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| handler.call(data))).is_err() {
            tracing::error!("handler for telemetry type {} panicked", telemetry_type);
        }
    }
}

/// Builder for [`Gateway`].
#[derive(Debug, Clone, Default)]
pub struct GatewayBuilder {
    config: GatewayConfig,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Listen address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.multiplexer.bind_addr = addr;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.multiplexer.read_chunk_size = size;
        self
    }

    pub fn inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.multiplexer.inbound_queue_capacity = capacity;
        self
    }

    /// Items waiting per connection before sends to it are refused.
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.multiplexer.outbound_queue_capacity = capacity;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.multiplexer.poll_timeout = timeout;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.multiplexer.join_timeout = timeout;
        self
    }

    /// Sleep increment of periodic workers.
    pub fn worker_tick(mut self, tick: Duration) -> Self {
        self.config.worker_tick = tick;
        self
    }

    /// How long stopping a worker waits for a task in progress.
    pub fn worker_join_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_join_timeout = timeout;
        self
    }

    pub fn build(self) -> Gateway {
        Gateway::new(self.config)
    }
}

/// Protocol gateway: multiplexer, routing registry and workers.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<RoutingRegistry>,
    scheduler: Scheduler,
    multiplexer: Multiplexer,
    /// The router's `received` subscription; it holds a multiplexer handle.
    router: SubscriptionId,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Create a stopped gateway.
    pub fn new(config: GatewayConfig) -> Self {
        let multiplexer = Multiplexer::new(config.multiplexer.clone());
        let registry = Arc::new(RoutingRegistry::new());

        let router = Router {
            registry: Arc::clone(&registry),
            sender: FrameSender {
                handle: multiplexer.handle(),
            },
        };
        let router = multiplexer
            .events()
            .received
            .connect(move |event| router.route(event));

        Self {
            scheduler: Scheduler::with_timing(config.worker_tick, config.worker_join_timeout),
            config,
            registry,
            multiplexer,
            router,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &RoutingRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run `handler` for every `Command` with this `(cmd_type, cmd_code)`.
    ///
    /// Its return value becomes the receipt's return code: `true` sends 0,
    /// `false` (or a panic) sends 1.
    pub fn register_command_handler<H>(&self, cmd_type: u16, cmd_code: u32, handler: H)
    where
        H: CommandHandler,
    {
        self.registry.register_command(cmd_type, cmd_code, handler);
    }

    /// Run `handler` with the data of position telemetry of this type, and
    /// with the value of address-telemetry parameters of this type that have
    /// no address handler.
    pub fn register_telemetry_handler<H>(&self, telemetry_type: u16, handler: H)
    where
        H: TelemetryHandler,
    {
        self.registry.register_telemetry(telemetry_type, handler);
    }

    /// Run `handler` for every address-telemetry parameter of this type.
    pub fn register_address_handler<H>(&self, telemetry_type: u16, handler: H)
    where
        H: AddressHandler,
    {
        self.registry.register_address(telemetry_type, handler);
    }

    /// Register a periodic worker calling `task(&args)` every `period`.
    ///
    /// The worker starts with the next [`start`](Self::start) or
    /// [`start_workers`](Self::start_workers).
    pub fn add_periodic_worker<A, F>(
        &self,
        name: impl Into<String>,
        period: Duration,
        mut task: F,
        args: A,
    ) -> Arc<Worker>
    where
        A: Send + 'static,
        F: FnMut(&A) -> TaskResult + Send + 'static,
    {
        self.scheduler.add_worker(name, period, move || task(&args))
    }

    pub fn get_worker(&self, name: &str) -> Option<Arc<Worker>> {
        self.scheduler.get_worker(name)
    }

    /// Registered worker names, sorted.
    pub fn workers(&self) -> Vec<String> {
        self.scheduler.names()
    }

    pub fn start_workers(&self) -> Result<()> {
        self.scheduler.start_all()
    }

    pub fn stop_workers(&self) {
        self.scheduler.stop_all();
    }

    /// Start the multiplexer, then every registered worker.
    ///
    /// Returns the bound address. A second call fails with
    /// [`GatewayError::AlreadyRunning`](crate::GatewayError::AlreadyRunning)
    /// and leaves the running gateway alone.
    pub fn start(&self) -> Result<SocketAddr> {
        let addr = self.multiplexer.start()?;
        if let Err(e) = self.scheduler.start_all() {
            self.scheduler.stop_all();
            self.multiplexer.stop();
            return Err(e);
        }
        tracing::info!("gateway started on {}", addr);
        Ok(addr)
    }

    /// Stop every worker, then the multiplexer.
    pub fn stop(&self) {
        self.scheduler.stop_all();
        self.multiplexer.stop();
    }

    pub fn is_running(&self) -> bool {
        self.multiplexer.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.multiplexer.local_addr()
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            handle: self.multiplexer.handle(),
        }
    }

    pub fn send_to(&self, connection: ConnectionId, frame: &TransportFrame) -> Result<()> {
        self.sender().send_to(connection, frame)
    }

    pub fn send_to_ip(&self, ip: IpAddr, frame: &TransportFrame) -> Result<usize> {
        self.sender().send_to_ip(ip, frame)
    }

    pub fn send_ack(&self, connection: ConnectionId, receipt_num: u16) -> Result<()> {
        self.sender().send_ack(connection, receipt_num)
    }

    pub fn send_nack(&self, connection: ConnectionId, receipt_num: u16) -> Result<()> {
        self.sender().send_nack(connection, receipt_num)
    }

    /// Open connections, sorted by id.
    pub fn connections(&self) -> Vec<(ConnectionId, SocketAddr)> {
        self.multiplexer.connections()
    }

    pub fn events(&self) -> &Events {
        self.multiplexer.events()
    }

    pub fn on_connected<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events().connected.connect(callback)
    }

    pub fn on_disconnected<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events().disconnected.connect(callback)
    }

    /// Raw frames as received, before decoding.
    pub fn on_received<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DataEvent) + Send + Sync + 'static,
    {
        self.events().received.connect(callback)
    }

    pub fn on_transmitted<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DataEvent) + Send + Sync + 'static,
    {
        self.events().transmitted.connect(callback)
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.stop();
        self.multiplexer.events().received.disconnect(self.router);
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("local_addr", &self.local_addr())
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::protocol::{AddressParameter, AddressTelemetry, CommandArg, PositionTelemetry};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};

    const WAIT: Duration = Duration::from_secs(5);

    fn local_gateway() -> Gateway {
        Gateway::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .poll_timeout(Duration::from_millis(10))
            .build()
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    fn read_frame(stream: &mut TcpStream) -> TransportFrame {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).unwrap();
        let mut rest = vec![0u8; u16::from_le_bytes(len) as usize];
        stream.read_exact(&mut rest).unwrap();

        let mut all = len.to_vec();
        all.extend_from_slice(&rest);
        TransportFrame::decode(&all).unwrap()
    }

    fn send(stream: &mut TcpStream, payload: impl Into<Payload>) {
        let bytes = TransportFrame::new(payload).encode().unwrap();
        stream.write_all(&bytes).unwrap();
    }

    #[test]
    fn test_command_yields_receipt() {
        let gateway = local_gateway();
        gateway.register_command_handler(2, 3, |args: &[CommandArg]| {
            args == [CommandArg::Word(5)]
        });
        let addr = gateway.start().unwrap();
        let mut client = connect(addr);

        send(&mut client, Command::new(2, 3, vec![CommandArg::Word(5)]));
        let reply = read_frame(&mut client);
        assert_eq!(reply.payload, Payload::Receipt(Receipt::ack(2)));

        send(&mut client, Command::new(2, 3, vec![CommandArg::Word(6)]));
        let reply = read_frame(&mut client);
        assert_eq!(reply.payload, Payload::Receipt(Receipt::nack(2)));
    }

    #[test]
    fn test_panicking_handler_sends_nack() {
        let gateway = local_gateway();
        gateway.register_command_handler(1, 1, |_: &[CommandArg]| -> bool { panic!("boom") });
        let addr = gateway.start().unwrap();
        let mut client = connect(addr);

        send(&mut client, Command::new(1, 1, Vec::new()));
        assert_eq!(read_frame(&mut client).payload, Payload::Receipt(Receipt::nack(2)));

        // The dispatcher survived.
        send(&mut client, Command::new(1, 1, Vec::new()));
        assert_eq!(read_frame(&mut client).payload, Payload::Receipt(Receipt::nack(2)));
    }

    #[test]
    fn test_telemetry_routing() {
        let gateway = local_gateway();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        gateway.register_telemetry_handler(4, move |data: &[u8]| {
            let _ = tx.lock().unwrap().send(data.to_vec());
        });
        let addr = gateway.start().unwrap();
        let mut client = connect(addr);

        send(
            &mut client,
            PositionTelemetry {
                telemetry_type: 4,
                data: Bytes::from_static(&[1, 2, 3]),
            },
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![1, 2, 3]);

        // No address handler for type 4: parameter values fall back here.
        send(
            &mut client,
            AddressTelemetry {
                params: vec![
                    AddressParameter::new(4, 1, vec![0xAA]),
                    AddressParameter::new(9, 2, vec![0xBB]),
                    AddressParameter::new(4, 3, vec![0xCC, 0xDD]),
                ],
            },
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![0xAA]);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![0xCC, 0xDD]);
    }

    #[test]
    fn test_address_handler_distinguishes_arg_num() {
        let gateway = local_gateway();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        gateway.register_address_handler(4, move |param: &AddressParameter| {
            let _ = tx.lock().unwrap().send(param.clone());
        });
        let (plain_tx, plain_rx) = mpsc::channel();
        let plain_tx = Mutex::new(plain_tx);
        gateway.register_telemetry_handler(4, move |data: &[u8]| {
            let _ = plain_tx.lock().unwrap().send(data.to_vec());
        });
        let addr = gateway.start().unwrap();
        let mut client = connect(addr);

        send(
            &mut client,
            AddressTelemetry {
                params: vec![
                    AddressParameter::new(4, 1, vec![0x10]),
                    AddressParameter::new(4, 2, vec![0x10]),
                ],
            },
        );

        let first = rx.recv_timeout(WAIT).unwrap();
        let second = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(first, AddressParameter::new(4, 1, vec![0x10]));
        assert_eq!(second, AddressParameter::new(4, 2, vec![0x10]));
        assert_ne!(first.arg_num, second.arg_num);

        // Position telemetry of the same type still reaches the plain handler.
        send(
            &mut client,
            PositionTelemetry {
                telemetry_type: 4,
                data: Bytes::from_static(&[9]),
            },
        );
        assert_eq!(plain_rx.recv_timeout(WAIT).unwrap(), vec![9]);
        assert!(plain_rx.try_recv().is_err());
    }

    #[test]
    fn test_double_start() {
        let gateway = local_gateway();
        let addr = gateway.start().unwrap();

        assert!(matches!(gateway.start(), Err(GatewayError::AlreadyRunning)));
        assert!(gateway.is_running());
        assert_eq!(gateway.local_addr(), Some(addr));
    }

    #[test]
    fn test_start_and_stop_workers() {
        let gateway = local_gateway();
        let calls = Arc::new(AtomicUsize::new(0));
        gateway.add_periodic_worker(
            "tick",
            Duration::from_millis(10),
            |calls: &Arc<AtomicUsize>| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Arc::clone(&calls),
        );
        assert_eq!(gateway.workers(), vec!["tick"]);

        gateway.start().unwrap();
        assert!(gateway.get_worker("tick").unwrap().is_running());

        gateway.stop();
        assert!(!gateway.is_running());
        assert!(!gateway.get_worker("tick").unwrap().is_running());
    }

    #[test]
    fn test_worker_join_timeout_from_config() {
        let gateway = Gateway::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .worker_join_timeout(Duration::from_millis(40))
            .build();
        let worker = gateway.add_periodic_worker("w", Duration::from_secs(1), |_: &()| Ok(()), ());

        assert_eq!(gateway.config().worker_join_timeout, Duration::from_millis(40));
        assert_eq!(worker.join_timeout(), Duration::from_millis(40));
    }

    #[test]
    fn test_send_without_start() {
        let gateway = local_gateway();
        let frame = TransportFrame::new(Receipt::ack(1));
        assert!(matches!(
            gateway.send_to(ConnectionId(1), &frame),
            Err(GatewayError::NotRunning)
        ));
    }
}
