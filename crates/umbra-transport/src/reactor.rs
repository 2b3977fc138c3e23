//! Readiness-polling reactor over `mio`.
//!
//! Thin ownership wrapper around `Poll`/`Events` plus a `Waker` so threads
//! outside the event loop (command surfaces, keepalive timers) can interrupt
//! a blocking poll. Events are copied out into [`PollEvent`]s so the caller
//! never borrows the internal `Events` buffer across dispatch.
//!
//! Zero-event polls (spurious wakeups, timer expiry) are normal; so is
//! `WouldBlock` on any subsequent socket call. Neither is an error.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Token reserved for the reactor's waker. Sockets must use other tokens.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// One readiness notification, copied out of the poll buffer.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    /// Registration token of the source.
    pub token: Token,
    /// Source is ready for reading.
    pub readable: bool,
    /// Source is ready for writing.
    pub writable: bool,
    /// Peer shut down the read half (likely EOF on next read).
    pub read_closed: bool,
}

impl PollEvent {
    /// Whether this event came from the cross-thread waker.
    #[must_use]
    pub fn is_wake(&self) -> bool {
        self.token == WAKE_TOKEN
    }
}

/// Single-threaded readiness poller; one per process role.
pub struct Reactor {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Reactor {
    /// Create a reactor with the given event buffer capacity.
    ///
    /// # Errors
    ///
    /// Fails when the OS poller or waker cannot be created.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            waker,
        })
    }

    /// Handle that wakes this reactor from any thread.
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Register a source for the given interests.
    ///
    /// # Errors
    ///
    /// Propagates registration failure from the OS poller.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Change the interests of an already-registered source.
    ///
    /// # Errors
    ///
    /// Propagates re-registration failure from the OS poller.
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Remove a source from the poller.
    ///
    /// # Errors
    ///
    /// Propagates deregistration failure from the OS poller.
    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block until readiness, wakeup, or timeout; return the events.
    ///
    /// An empty vec is a normal outcome (timeout or spurious wakeup).
    ///
    /// # Errors
    ///
    /// Propagates poll failure; `Interrupted` is retried internally.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<PollEvent>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }
        let out: Vec<PollEvent> = self
            .events
            .iter()
            .map(|event| PollEvent {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                read_closed: event.is_read_closed(),
            })
            .collect();
        trace!(count = out.len(), "poll returned");
        Ok(out)
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("capacity", &self.events.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::io::Write;

    #[test]
    fn test_poll_times_out_with_no_events() {
        let mut reactor = Reactor::new(8).unwrap();
        let events = reactor.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_waker_interrupts_poll() {
        let mut reactor = Reactor::new(8).unwrap();
        let waker = reactor.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });
        let events = reactor.poll(Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();
        assert!(events.iter().any(PollEvent::is_wake));
    }

    #[test]
    fn test_accept_readiness() {
        let mut reactor = Reactor::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        reactor
            .register(&mut listener, Token(1), Interest::READABLE)
            .unwrap();

        let peer = std::net::TcpStream::connect(addr).unwrap();
        let mut seen = false;
        for _ in 0..50 {
            let events = reactor.poll(Some(Duration::from_millis(100))).unwrap();
            if events.iter().any(|e| e.token == Token(1) && e.readable) {
                seen = true;
                break;
            }
        }
        drop(peer);
        assert!(seen, "listener never became readable");
    }

    #[test]
    fn test_read_readiness_after_peer_write() {
        let mut reactor = Reactor::new(8).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        let (mut accepted, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };
        reactor
            .register(&mut accepted, Token(7), Interest::READABLE)
            .unwrap();

        peer.write_all(b"ready").unwrap();
        let mut seen = false;
        for _ in 0..50 {
            let events = reactor.poll(Some(Duration::from_millis(100))).unwrap();
            if events.iter().any(|e| e.token == Token(7) && e.readable) {
                seen = true;
                break;
            }
        }
        assert!(seen, "connection never became readable");
    }
}
