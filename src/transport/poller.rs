//! Readiness notification.
//!
//! The event loop talks to the OS through the [`Poller`] trait so the
//! primitive underneath is swappable. [`MioPoller`] is the default and uses
//! `mio::Poll`, which maps to epoll, kqueue or IOCP depending on platform.
//! Readiness is edge-triggered: a ready source must be drained until it
//! reports `WouldBlock` before the next notification arrives.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// Default event capacity per wait.
const EVENTS_CAPACITY: usize = 256;

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the socket reported an error.
    pub closed: bool,
}

/// Wakes a blocked [`Poller::wait`] from another thread.
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

impl Notify for Waker {
    fn notify(&self) -> io::Result<()> {
        self.wake()
    }
}

/// OS readiness facility used by the event loop.
pub trait Poller: Send + 'static {
    /// Open a fresh poller.
    fn open() -> io::Result<Self>
    where
        Self: Sized;

    fn register(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, source: &mut dyn Source) -> io::Result<()>;

    /// Create a handle that wakes `wait` with an event for `token`.
    fn notifier(&self, token: Token) -> io::Result<Arc<dyn Notify>>;

    /// Block until at least one source is ready or `timeout` elapses.
    ///
    /// `events` is cleared and refilled. An interrupted wait returns no
    /// events rather than an error.
    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>)
        -> io::Result<()>;
}

/// [`Poller`] backed by `mio::Poll`.
pub struct MioPoller {
    poll: Poll,
    events: Events,
}

impl Poller for MioPoller {
    fn open() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
        })
    }

    fn register(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    fn deregister(&mut self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn notifier(&self, token: Token) -> io::Result<Arc<dyn Notify>> {
        Ok(Arc::new(Waker::new(self.poll.registry(), token)?))
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        events.extend(self.events.iter().map(|event| ReadyEvent {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed() || event.is_error(),
        }));
        Ok(())
    }
}
