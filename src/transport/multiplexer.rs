//! TCP connection multiplexer.
//!
//! One event-loop thread owns the listener and every client socket. It
//! accepts connections, reads each ready socket in bounded chunks (a few per
//! pass, so one busy peer cannot starve the rest), reassembles frames with a
//! per-connection [`FrameBuffer`], and drains outbound queues. Complete
//! frames are pushed onto a bounded channel consumed by a dispatcher thread,
//! which raises the `received` event; slow subscribers therefore never stall
//! socket I/O until the channel fills.
//!
//! Sending is thread-safe: `send_to` appends to the connection's bounded
//! outbound queue and wakes the event loop, which performs the actual write.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use serde::Deserialize;

use super::connection::{ConnectionId, ConnectionTable, OutboundQueue};
use super::poller::{MioPoller, Notify, Poller, ReadyEvent};
use super::signal::{ConnectionEvent, DataEvent, Events};
use crate::config::millis;
use crate::error::{CodecError, GatewayError, Result};
use crate::protocol::{hex, FrameBuffer};
use crate::sync::{join_bounded, lock};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);

/// Reads one connection may do before the loop moves on to other sockets.
const READ_BUDGET: usize = 16;

/// Multiplexer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Listen address. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Bytes requested per socket read.
    pub read_chunk_size: usize,
    /// Frames buffered between the event loop and the dispatcher.
    pub inbound_queue_capacity: usize,
    /// Items a connection may have waiting to be written before sends to it
    /// are refused.
    pub outbound_queue_capacity: usize,
    /// Upper bound on how long either thread sleeps before rechecking the
    /// running flag.
    #[serde(rename = "poll_timeout_ms", deserialize_with = "millis")]
    pub poll_timeout: Duration,
    /// How long `stop` waits for each thread before detaching it.
    #[serde(rename = "join_timeout_ms", deserialize_with = "millis")]
    pub join_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            read_chunk_size: 1024,
            inbound_queue_capacity: 1024,
            outbound_queue_capacity: 1024,
            poll_timeout: Duration::from_millis(50),
            join_timeout: Duration::from_millis(200),
        }
    }
}

/// State shared between the public handle, the event loop and the dispatcher.
struct Shared {
    table: Mutex<ConnectionTable>,
    notifier: Mutex<Option<Arc<dyn Notify>>>,
    running: AtomicBool,
    /// Bumped on every start; threads from an older run exit when it changes.
    generation: AtomicU64,
    next_id: AtomicU64,
    outbound_capacity: usize,
    events: Events,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn wake(&self) {
        let notifier = lock(&self.notifier).clone();
        if let Some(notifier) = notifier {
            if let Err(e) = notifier.notify() {
                tracing::warn!("failed to wake event loop: {}", e);
            }
        }
    }

    fn enqueue(&self, id: ConnectionId, data: Bytes) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(GatewayError::NotRunning);
        }
        let queue = lock(&self.table)
            .outbound(id)
            .ok_or(GatewayError::UnknownConnection(id))?;
        self.push(id, &queue, data)?;
        self.wake();
        Ok(())
    }

    fn enqueue_ip(&self, ip: IpAddr, data: Bytes) -> Result<usize> {
        if !self.running.load(Ordering::Acquire) {
            return Err(GatewayError::NotRunning);
        }
        let queues = lock(&self.table).outbound_for_ip(ip);
        let mut queued = 0;
        let mut refused = None;
        for (id, queue) in &queues {
            match self.push(*id, queue, data.clone()) {
                Ok(()) => queued += 1,
                Err(e) => refused = Some(e),
            }
        }

        if queued == 0 {
            return Err(refused.unwrap_or(GatewayError::NoConnectionsForIp(ip)));
        }
        self.wake();
        Ok(queued)
    }

    fn push(&self, id: ConnectionId, queue: &OutboundQueue, data: Bytes) -> Result<()> {
        let mut queue = lock(queue);
        if queue.len() >= self.outbound_capacity {
            tracing::warn!("outbound queue of {} full, dropping {} bytes", id, data.len());
            return Err(GatewayError::OutboundQueueFull(id));
        }
        queue.push_back(data);
        Ok(())
    }
}

/// Cloneable sending side of a [`Multiplexer`].
#[derive(Clone)]
pub struct MultiplexerHandle {
    shared: Arc<Shared>,
}

impl MultiplexerHandle {
    /// Queue bytes for one connection.
    pub fn send_to(&self, id: ConnectionId, data: Bytes) -> Result<()> {
        self.shared.enqueue(id, data)
    }

    /// Queue bytes for every connection from `ip`. Returns how many
    /// connections received a copy; connections with a full queue are
    /// skipped.
    pub fn send_to_ip(&self, ip: IpAddr, data: Bytes) -> Result<usize> {
        self.shared.enqueue_ip(ip, data)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MultiplexerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

struct Running {
    local_addr: SocketAddr,
    event_loop: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// TCP server multiplexing many client connections over one event loop.
pub struct Multiplexer<P: Poller = MioPoller> {
    config: MultiplexerConfig,
    shared: Arc<Shared>,
    state: Mutex<Option<Running>>,
    _poller: PhantomData<fn() -> P>,
}

impl Multiplexer {
    /// Create a multiplexer using the platform's default readiness facility.
    pub fn new(config: MultiplexerConfig) -> Self {
        Self::with_poller(config)
    }
}

impl<P: Poller> Multiplexer<P> {
    /// Create a multiplexer on a custom [`Poller`].
    pub fn with_poller(config: MultiplexerConfig) -> Self {
        let outbound_capacity = config.outbound_queue_capacity.max(1);
        Self {
            config,
            shared: Arc::new(Shared {
                table: Mutex::new(ConnectionTable::default()),
                notifier: Mutex::new(None),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                outbound_capacity,
                events: Events::default(),
            }),
            state: Mutex::new(None),
            _poller: PhantomData,
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Event subscriber lists.
    pub fn events(&self) -> &Events {
        &self.shared.events
    }

    /// Sending handle that outlives borrows of the multiplexer.
    pub fn handle(&self) -> MultiplexerHandle {
        MultiplexerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bind the listener and start the event loop and dispatcher.
    ///
    /// Returns the bound address. Fails with [`GatewayError::AlreadyRunning`]
    /// if already started; the running instance is left untouched.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut state = lock(&self.state);
        if state.is_some() {
            tracing::warn!("multiplexer already running");
            return Err(GatewayError::AlreadyRunning);
        }

        let mut poller = P::open()?;
        let mut listener = TcpListener::bind(self.config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        poller.register(&mut listener, LISTENER, Interest::READABLE)?;
        let notifier = poller.notifier(WAKER)?;

        let (inbound_tx, inbound_rx) = mpsc::sync_channel(self.config.inbound_queue_capacity.max(1));
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.shared.notifier) = Some(notifier);
        self.shared.running.store(true, Ordering::Release);

        let event_loop = EventLoop {
            poller,
            listener,
            shared: Arc::clone(&self.shared),
            generation,
            inbound: inbound_tx,
            connections: HashMap::new(),
            read_buf: vec![0; self.config.read_chunk_size.max(1)],
            poll_timeout: self.config.poll_timeout,
        };
        let event_loop = match thread::Builder::new()
            .name("kpa-event-loop".into())
            .spawn(move || event_loop.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.halt();
                return Err(e.into());
            }
        };

        let shared = Arc::clone(&self.shared);
        let poll_timeout = self.config.poll_timeout;
        let dispatcher = match thread::Builder::new()
            .name("kpa-dispatcher".into())
            .spawn(move || run_dispatcher(inbound_rx, shared, generation, poll_timeout))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.halt();
                join_bounded(event_loop, self.config.join_timeout);
                return Err(e.into());
            }
        };

        *state = Some(Running {
            local_addr,
            event_loop,
            dispatcher,
        });
        tracing::info!("multiplexer listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop both threads and close every connection.
    ///
    /// Each thread gets `join_timeout` to finish. `disconnected` fires for
    /// every connection that was open. Stopping a stopped multiplexer is a
    /// no-op.
    pub fn stop(&self) {
        let Some(running) = lock(&self.state).take() else {
            tracing::debug!("multiplexer not running");
            return;
        };

        self.halt();
        join_bounded(running.event_loop, self.config.join_timeout);
        join_bounded(running.dispatcher, self.config.join_timeout);
        *lock(&self.shared.notifier) = None;
        tracing::info!("multiplexer on {} stopped", running.local_addr);
    }

    fn halt(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_some()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).as_ref().map(|running| running.local_addr)
    }

    /// Queue bytes for one connection.
    pub fn send_to(&self, id: ConnectionId, data: Bytes) -> Result<()> {
        self.shared.enqueue(id, data)
    }

    /// Queue bytes for every connection from `ip`.
    pub fn send_to_ip(&self, ip: IpAddr, data: Bytes) -> Result<usize> {
        self.shared.enqueue_ip(ip, data)
    }

    /// Live connections, sorted by id.
    pub fn connections(&self) -> Vec<(ConnectionId, SocketAddr)> {
        lock(&self.shared.table).snapshot()
    }

    /// Live connections from one IP, in accept order.
    pub fn connections_from(&self, ip: IpAddr) -> Vec<ConnectionId> {
        lock(&self.shared.table).ids_for_ip(ip)
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        lock(&self.shared.table).addr(id)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.table).len()
    }
}

impl<P: Poller> Drop for Multiplexer<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<P: Poller> fmt::Debug for Multiplexer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Why a connection was closed.
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    Io(io::Error),
    /// The stream carried an impossible length; framing is lost.
    Desync(CodecError),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Io(e) => write!(f, "I/O error: {}", e),
            CloseReason::Desync(e) => write!(f, "framing error: {}", e),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Event-loop side of one client connection.
struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    stream: TcpStream,
    frames: FrameBuffer,
    outbound: OutboundQueue,
    /// Item being written and how many of its bytes are already out.
    in_flight: Option<(Bytes, usize)>,
    writable: bool,
    /// Data may be waiting; set by readiness and kept while the read budget
    /// runs out before `WouldBlock`.
    readable: bool,
}

impl Connection {
    /// Read until the socket would block or the budget is spent, forwarding
    /// complete frames. `readable` stays set if data may remain.
    fn read_ready(
        &mut self,
        buf: &mut [u8],
        inbound: &SyncSender<DataEvent>,
    ) -> std::result::Result<(), CloseReason> {
        let mut reads = 0;
        while reads < READ_BUDGET {
            match self.stream.read(buf) {
                Ok(0) => return Err(CloseReason::PeerClosed),
                Ok(n) => {
                    reads += 1;
                    tracing::trace!("{} rx {} bytes: {}", self.id, n, hex(&buf[..n]));
                    let frames = self.frames.push(&buf[..n]).map_err(CloseReason::Desync)?;
                    for data in frames {
                        let event = DataEvent {
                            connection: self.id,
                            data,
                        };
                        if inbound.send(event).is_err() {
                            return Err(CloseReason::Shutdown);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readable = false;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
        Ok(())
    }

    /// Write queued items until the queue is empty or the socket would block.
    fn flush(&mut self, events: &Events) -> std::result::Result<(), CloseReason> {
        while self.writable {
            let (item, offset) = match self.in_flight.take() {
                Some(pending) => pending,
                None => match lock(&self.outbound).pop_front() {
                    Some(item) => (item, 0),
                    None => return Ok(()),
                },
            };

            if offset == item.len() {
                self.transmitted(events, item);
                continue;
            }

            match self.stream.write(&item[offset..]) {
                Ok(0) => return Err(CloseReason::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) if offset + n == item.len() => self.transmitted(events, item),
                Ok(n) => self.in_flight = Some((item, offset + n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.in_flight = Some((item, offset));
                    self.writable = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.in_flight = Some((item, offset));
                }
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
        Ok(())
    }

    fn transmitted(&self, events: &Events, data: Bytes) {
        tracing::trace!("{} tx {} bytes: {}", self.id, data.len(), hex(&data));
        events.transmitted.emit(&DataEvent {
            connection: self.id,
            data,
        });
    }
}

struct EventLoop<P> {
    poller: P,
    listener: TcpListener,
    shared: Arc<Shared>,
    generation: u64,
    inbound: SyncSender<DataEvent>,
    connections: HashMap<Token, Connection>,
    read_buf: Vec<u8>,
    poll_timeout: Duration,
}

impl<P: Poller> EventLoop<P> {
    fn run(mut self) {
        let mut events = Vec::new();

        while self.shared.is_current(self.generation) {
            // Connections left with unread data must not wait for a new edge.
            let timeout = if self.connections.values().any(|conn| conn.readable) {
                Duration::ZERO
            } else {
                self.poll_timeout
            };
            if let Err(e) = self.poller.wait(&mut events, Some(timeout)) {
                tracing::error!("poll failed: {}", e);
                if self.shared.generation.load(Ordering::Acquire) == self.generation {
                    self.shared.running.store(false, Ordering::Release);
                }
                break;
            }

            for event in events.drain(..) {
                match event.token {
                    LISTENER => self.accept(),
                    // Outbound queues are flushed below on every iteration.
                    WAKER => {}
                    token => self.connection_ready(token, event),
                }
            }
            self.read_all();
            self.flush_all();
        }

        self.shutdown();
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let id = ConnectionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
                    let token = Token(id.0 as usize);
                    if let Err(e) = self.poller.register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        tracing::error!("failed to register connection from {}: {}", addr, e);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                    }

                    let outbound = lock(&self.shared.table).insert(id, addr);
                    self.connections.insert(
                        token,
                        Connection {
                            id,
                            addr,
                            stream,
                            frames: FrameBuffer::new(),
                            outbound,
                            in_flight: None,
                            writable: true,
                            readable: true,
                        },
                    );

                    tracing::info!("connection {} accepted from {}", id, addr);
                    self.shared.events.connected.emit(&ConnectionEvent {
                        connection: id,
                        addr,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn connection_ready(&mut self, token: Token, event: ReadyEvent) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if event.writable {
            conn.writable = true;
        }
        if event.readable || event.closed {
            conn.readable = true;
        }
    }

    /// One budgeted read pass over every connection with pending input.
    fn read_all(&mut self) {
        let mut failed = Vec::new();
        for (token, conn) in self.connections.iter_mut() {
            if !conn.readable {
                continue;
            }
            if let Err(reason) = conn.read_ready(&mut self.read_buf, &self.inbound) {
                failed.push((*token, reason));
            }
        }
        for (token, reason) in failed {
            self.close(token, reason);
        }
    }

    fn flush_all(&mut self) {
        let mut failed = Vec::new();
        for (token, conn) in self.connections.iter_mut() {
            if let Err(reason) = conn.flush(&self.shared.events) {
                failed.push((*token, reason));
            }
        }
        for (token, reason) in failed {
            self.close(token, reason);
        }
    }

    fn close(&mut self, token: Token, reason: CloseReason) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        match &reason {
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                tracing::info!("connection {} ({}) closed: {}", conn.id, conn.addr, reason)
            }
            CloseReason::Io(_) | CloseReason::Desync(_) => {
                tracing::warn!("connection {} ({}) dropped: {}", conn.id, conn.addr, reason)
            }
        }

        if let Err(e) = self.poller.deregister(&mut conn.stream) {
            tracing::debug!("deregister {} failed: {}", conn.id, e);
        }
        lock(&self.shared.table).remove(conn.id);

        let event = ConnectionEvent {
            connection: conn.id,
            addr: conn.addr,
        };
        drop(conn);
        self.shared.events.disconnected.emit(&event);
    }

    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, CloseReason::Shutdown);
        }
        if let Err(e) = self.poller.deregister(&mut self.listener) {
            tracing::debug!("deregister listener failed: {}", e);
        }
    }
}

fn run_dispatcher(
    inbound: Receiver<DataEvent>,
    shared: Arc<Shared>,
    generation: u64,
    poll_timeout: Duration,
) {
    while shared.is_current(generation) {
        match inbound.recv_timeout(poll_timeout) {
            Ok(event) => shared.events.received.emit(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
