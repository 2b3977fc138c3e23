//! Synchronous handshake driving over a private poll.
//!
//! A stream may only ever be registered with one mio registry, so the open
//! handshake (and the close handshake at teardown) runs on a throwaway
//! `Poll` owned by the driver; the caller registers the stream with its
//! long-lived reactor only after `drive` returns `Ok`. The loop is exactly
//! the engine's status machine: encrypt when the engine wants to write,
//! read and decrypt when it wants input, hand verification tasks to the
//! pool when it is waiting on one, and stop on `Complete` or a terminal
//! state. A wall-clock deadline bounds the whole loop; on expiry the engine
//! is poisoned so it can never be used for traffic.
//!
//! All four session buffers are cleared on every exit path. Handshake bytes
//! never leak into the established session.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use umbra_crypto::{EngineStatus, HandshakeStatus, SessionEngine};
use umbra_transport::TaskPool;

use crate::config::HandshakeConfig;
use crate::connection::SessionBuffers;
use crate::error::HandshakeError;

const DRIVE_TOKEN: Token = Token(0);

/// Upper bound on one poll wait; keeps the deadline check responsive.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Wait while a delegated verification task is in flight.
const TASK_WAIT: Duration = Duration::from_millis(1);

/// Drives a session engine's handshake to completion over a socket.
pub struct HandshakeDriver<'a> {
    config: &'a HandshakeConfig,
    pool: &'a TaskPool,
}

impl<'a> HandshakeDriver<'a> {
    /// A driver borrowing the shared config and task pool.
    #[must_use]
    pub fn new(config: &'a HandshakeConfig, pool: &'a TaskPool) -> Self {
        Self { config, pool }
    }

    /// Drive the engine's current handshake (open or close) to completion.
    ///
    /// The stream must not be registered with any other registry.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::TimedOut`] when the deadline expires (the engine is
    /// poisoned first), [`HandshakeError::Rejected`] when the engine fails,
    /// [`HandshakeError::PeerClosed`] on EOF mid-handshake, and I/O, engine,
    /// or buffer errors from the loop body.
    pub fn drive(
        &self,
        stream: &mut TcpStream,
        engine: &mut dyn SessionEngine,
        bufs: &mut SessionBuffers,
    ) -> Result<(), HandshakeError> {
        self.drive_inner(stream, engine, bufs, false)
    }

    /// Wait for a non-blocking connect to resolve, then drive the open
    /// handshake.
    ///
    /// # Errors
    ///
    /// As [`drive`](Self::drive), plus the deferred connect error when the
    /// connection attempt itself failed (refused, unreachable).
    pub fn connect_and_drive(
        &self,
        stream: &mut TcpStream,
        engine: &mut dyn SessionEngine,
        bufs: &mut SessionBuffers,
    ) -> Result<(), HandshakeError> {
        self.drive_inner(stream, engine, bufs, true)
    }

    fn drive_inner(
        &self,
        stream: &mut TcpStream,
        engine: &mut dyn SessionEngine,
        bufs: &mut SessionBuffers,
        wait_connect: bool,
    ) -> Result<(), HandshakeError> {
        let deadline = Instant::now() + self.config.timeout;
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(8);
        poll.registry()
            .register(stream, DRIVE_TOKEN, Interest::READABLE | Interest::WRITABLE)?;

        let result = (|| {
            if wait_connect {
                Self::await_connected(&mut poll, &mut events, stream, engine, deadline)?;
            }
            self.run_loop(&mut poll, &mut events, stream, engine, bufs, deadline)
        })();

        let _ = poll.registry().deregister(stream);
        bufs.clear_all();
        result
    }

    /// Block until the non-blocking connect resolves one way or the other.
    fn await_connected(
        poll: &mut Poll,
        events: &mut Events,
        stream: &mut TcpStream,
        engine: &mut dyn SessionEngine,
        deadline: Instant,
    ) -> Result<(), HandshakeError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                engine.mark_timed_out();
                return Err(HandshakeError::TimedOut);
            }
            poll.poll(events, Some(POLL_SLICE.min(deadline - now)))?;
            if events.iter().next().is_none() {
                continue;
            }
            if let Some(err) = stream.take_error()? {
                return Err(HandshakeError::Io(err));
            }
            match stream.peer_addr() {
                Ok(_) => return Ok(()),
                Err(ref err)
                    if err.kind() == ErrorKind::NotConnected
                        || err.raw_os_error() == Some(libc_einprogress()) => {}
                Err(err) => return Err(HandshakeError::Io(err)),
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_loop(
        &self,
        poll: &mut Poll,
        events: &mut Events,
        stream: &mut TcpStream,
        engine: &mut dyn SessionEngine,
        bufs: &mut SessionBuffers,
        deadline: Instant,
    ) -> Result<(), HandshakeError> {
        let mut saw_eof = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                engine.mark_timed_out();
                return Err(HandshakeError::TimedOut);
            }

            match engine.handshake_status() {
                HandshakeStatus::Complete => {
                    debug!(role = engine.role().label(), "handshake complete");
                    return Ok(());
                }
                HandshakeStatus::Failed => {
                    return Err(if saw_eof {
                        HandshakeError::PeerClosed
                    } else {
                        HandshakeError::Rejected
                    });
                }
                HandshakeStatus::TimedOut => return Err(HandshakeError::TimedOut),
                HandshakeStatus::AwaitingTask => {
                    while let Some(task) = engine.take_task() {
                        trace!("submitting identity verification task");
                        self.pool.submit(move || task.run());
                    }
                    // The verdict lands in the engine's cell; poll it.
                    std::thread::sleep(TASK_WAIT);
                }
                HandshakeStatus::AwaitingEncrypt => {
                    bufs.app_out.clear();
                    bufs.app_out.flip();
                    let step = engine.encrypt(&mut bufs.app_out, &mut bufs.net_out)?;
                    match step.status {
                        EngineStatus::Success | EngineStatus::Closed => {
                            Self::flush(poll, events, stream, bufs, deadline)?;
                        }
                        EngineStatus::OutputTooSmall => {
                            bufs.net_out.grow(engine.record_capacity_hint())?;
                        }
                        EngineStatus::InputIncomplete => {}
                    }
                }
                HandshakeStatus::AwaitingDecrypt => {
                    let mut progress = false;
                    if bufs.net_in.has_remaining() {
                        match bufs.net_in.fill_from(stream) {
                            Ok(0) => {
                                saw_eof = true;
                                engine.on_peer_eof();
                                continue;
                            }
                            Ok(_) => progress = true,
                            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                            Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                    bufs.net_in.flip();
                    let step = engine.decrypt(&mut bufs.net_in, &mut bufs.app_in);
                    bufs.net_in.compact();
                    let step = step?;
                    match step.status {
                        EngineStatus::Success | EngineStatus::Closed => {}
                        EngineStatus::OutputTooSmall => {
                            bufs.app_in.grow(engine.plaintext_capacity_hint())?;
                        }
                        EngineStatus::InputIncomplete => {
                            if engine.record_capacity_hint() > bufs.net_in.capacity() {
                                bufs.net_in.grow(engine.record_capacity_hint())?;
                            } else if !progress {
                                let now = Instant::now();
                                if now < deadline {
                                    poll.poll(events, Some(POLL_SLICE.min(deadline - now)))?;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Write everything buffered in `net_out`, waiting out `WouldBlock`.
    fn flush(
        poll: &mut Poll,
        events: &mut Events,
        stream: &mut TcpStream,
        bufs: &mut SessionBuffers,
        deadline: Instant,
    ) -> Result<(), HandshakeError> {
        bufs.net_out.flip();
        let result = loop {
            if !bufs.net_out.has_remaining() {
                break Ok(());
            }
            match bufs.net_out.drain_to(stream) {
                Ok(0) => break Err(std::io::Error::from(ErrorKind::WriteZero).into()),
                Ok(_) => {}
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(HandshakeError::TimedOut);
                    }
                    poll.poll(events, Some(POLL_SLICE.min(deadline - now)))?;
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => break Err(err.into()),
            }
        };
        bufs.net_out.compact();
        result
    }
}

#[cfg(target_os = "linux")]
fn libc_einprogress() -> i32 {
    115
}

#[cfg(not(target_os = "linux"))]
fn libc_einprogress() -> i32 {
    36
}
