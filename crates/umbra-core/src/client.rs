//! The relay client: one background lifecycle thread per client.
//!
//! The thread walks `Connecting → Handshaking → Authenticating → Running`
//! and, on session loss, back through `Reconnecting` with bounded linear
//! backoff. `AUTH_FAILED` and an exhausted reconnect budget are permanent:
//! the thread stops and the handle refuses further commands.
//!
//! Callers talk to the thread through a command channel (send, stop) and
//! listen on an event channel (connected, deliveries, rejection, stopped).
//! A separate timer thread ticks the keepalive; ticks are ignored outside
//! the `Running` state so probes can never race authentication.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use mio::net::TcpStream;
use mio::{Interest, Token, Waker};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use umbra_crypto::{EngineError, Identity, NoiseEngine, Role, TrustProvider};
use umbra_transport::{Reactor, TaskPool, TaskPoolConfig};
use umbra_wire::Message;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::handshake::HandshakeDriver;
use crate::policy::{KeepaliveAction, KeepalivePolicy, ReconnectPolicy};
use crate::queue::OutboundQueue;

const CONNECTION_TOKEN: Token = Token(1);

/// Lifecycle states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// TCP connect in flight.
    Connecting,
    /// Transport handshake in flight.
    Handshaking,
    /// `AUTH` sent, waiting for the server's verdict.
    Authenticating,
    /// Authenticated and relaying.
    Running,
    /// Session lost; waiting out the backoff.
    Reconnecting,
    /// Permanently stopped.
    Stopped,
}

impl ClientState {
    fn label(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Authenticating => "authenticating",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

/// Why the client stopped permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`RelayClient::stop`] was called.
    Requested,
    /// The server rejected our credentials.
    AuthRejected,
    /// The reconnect budget is spent.
    AttemptsExhausted,
}

/// What the lifecycle thread reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Authenticated; the session is usable.
    Connected,
    /// A relayed payload arrived.
    Delivery {
        /// Sender id (or `server` for operator-injected messages).
        from: String,
        /// The payload.
        payload: String,
    },
    /// The server rejected our credentials; the client will stop.
    AuthRejected {
        /// Server-supplied reason.
        reason: String,
    },
    /// The lifecycle thread has exited.
    Stopped {
        /// Why.
        reason: StopReason,
    },
}

enum Command {
    SendTo { to: String, payload: String },
    Stop,
}

/// Handle to a running relay client.
pub struct RelayClient {
    cmd_tx: Sender<Command>,
    events: Receiver<ClientEvent>,
    waker: Arc<Waker>,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Start a client for `addr`, authenticating as `id` with `secret`.
    ///
    /// Returns as soon as the lifecycle thread is running; watch
    /// [`events`](Self::events) for [`ClientEvent::Connected`].
    ///
    /// # Errors
    ///
    /// Reactor setup or key generation failure. Connection failures are
    /// not errors here; they surface as events.
    pub fn connect(
        addr: SocketAddr,
        id: &str,
        secret: &str,
        config: ClientConfig,
        trust: Arc<dyn TrustProvider>,
    ) -> Result<Self, ClientError> {
        let identity = Identity::generate().map_err(EngineError::from)?;
        let reactor = Reactor::new(64)?;
        let waker = reactor.waker();
        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let stopped = Arc::new(AtomicBool::new(false));

        let lifecycle = Lifecycle {
            addr,
            auth_id: id.to_owned(),
            auth_secret: secret.to_owned(),
            config,
            identity,
            trust,
            reactor,
            cmd_rx,
            event_tx,
            stopped: Arc::clone(&stopped),
            state: ClientState::Connecting,
        };
        let thread = std::thread::Builder::new()
            .name(format!("umbra-client-{id}"))
            .spawn(move || lifecycle.run())?;

        Ok(Self {
            cmd_tx,
            events: event_rx,
            waker,
            stopped,
            thread: Some(thread),
        })
    }

    /// Queue a payload for the client bound to `to` on the server.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] once the client has stopped.
    pub fn send_to(&self, to: &str, payload: &str) -> Result<(), ClientError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        self.cmd_tx
            .send(Command::SendTo {
                to: to.to_owned(),
                payload: payload.to_owned(),
            })
            .map_err(|_| ClientError::Stopped)?;
        let _ = self.waker.wake();
        Ok(())
    }

    /// Ask the lifecycle thread to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
        let _ = self.waker.wake();
    }

    /// The event stream.
    #[must_use]
    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    /// Whether the lifecycle thread has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop and wait for the lifecycle thread.
    pub fn stop_and_join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum SessionEnd {
    /// Session lost; the reconnect policy decides what happens next.
    Disconnected,
    /// Permanent stop.
    Stop(StopReason),
}

enum FrameOutcome {
    Continue,
    Stop(StopReason),
}

struct Lifecycle {
    addr: SocketAddr,
    auth_id: String,
    auth_secret: String,
    config: ClientConfig,
    identity: Identity,
    trust: Arc<dyn TrustProvider>,
    reactor: Reactor,
    cmd_rx: Receiver<Command>,
    event_tx: Sender<ClientEvent>,
    stopped: Arc<AtomicBool>,
    state: ClientState,
}

impl Lifecycle {
    fn run(mut self) {
        let pool = TaskPool::new(TaskPoolConfig {
            queue_depth: self.config.handshake.task_queue_depth,
            workers: 0,
        });
        let (tick_rx, timer_stop) = start_keepalive_timer(
            self.config.keepalive.interval,
            self.reactor.waker(),
        );
        let mut reconnect = ReconnectPolicy::new(&self.config.reconnect);

        let reason = loop {
            self.set_state(ClientState::Connecting);
            match self.establish(&pool) {
                Ok(conn) => {
                    reconnect.reset();
                    match self.session(conn, &pool, &tick_rx) {
                        SessionEnd::Stop(reason) => break reason,
                        SessionEnd::Disconnected => {}
                    }
                }
                Err(err) => warn!(error = %err, "connection attempt failed"),
            }
            match reconnect.next_delay() {
                Some(delay) => {
                    self.set_state(ClientState::Reconnecting);
                    info!(attempt = reconnect.attempts(), ?delay, "backing off");
                    if self.backoff_wait(delay) {
                        break StopReason::Requested;
                    }
                }
                None => break StopReason::AttemptsExhausted,
            }
        };

        self.set_state(ClientState::Stopped);
        self.stopped.store(true, Ordering::SeqCst);
        let _ = timer_stop.send(());
        let _ = self.event_tx.send(ClientEvent::Stopped { reason });
        pool.shutdown();
    }

    fn set_state(&mut self, next: ClientState) {
        if self.state != next {
            info!(from = self.state.label(), to = next.label(), "state change");
            self.state = next;
        }
    }

    /// Connect and complete the transport handshake.
    fn establish(&mut self, pool: &TaskPool) -> Result<Connection, ClientError> {
        let stream = TcpStream::connect(self.addr)?;
        let engine = NoiseEngine::new(Role::Initiator, &self.identity, Arc::clone(&self.trust))?;
        // Sessions do not share queues; what a dead session never sent
        // stays dropped (the relay promises no delivery).
        let queue = Arc::new(OutboundQueue::new(&self.config.queue));
        let mut conn = Connection::new(
            stream,
            Box::new(engine),
            queue,
            &self.config.handshake,
            self.config.max_frame(),
        );

        self.set_state(ClientState::Handshaking);
        let driver = HandshakeDriver::new(&self.config.handshake, pool);
        {
            let (stream, engine, bufs) = conn.parts_mut();
            driver.connect_and_drive(stream, engine, bufs)?;
        }
        Ok(conn)
    }

    /// Run one established session until it ends.
    fn session(
        &mut self,
        mut conn: Connection,
        pool: &TaskPool,
        tick_rx: &Receiver<()>,
    ) -> SessionEnd {
        self.set_state(ClientState::Authenticating);
        let auth = Message::Auth {
            id: self.auth_id.clone(),
            secret: self.auth_secret.clone(),
        };
        if conn.enqueue(auth.to_string()).is_err() {
            return SessionEnd::Disconnected;
        }
        if self
            .reactor
            .register(
                conn.stream_mut(),
                CONNECTION_TOKEN,
                Interest::READABLE | Interest::WRITABLE,
            )
            .is_err()
        {
            return SessionEnd::Disconnected;
        }
        // Stale ticks belong to the previous session
        while tick_rx.try_recv().is_ok() {}
        let mut keepalive = KeepalivePolicy::new(&self.config.keepalive);

        let end = 'session: loop {
            let events = match self.reactor.poll(Some(Duration::from_millis(100))) {
                Ok(events) => events,
                Err(err) => {
                    warn!(error = %err, "reactor poll failed");
                    break 'session SessionEnd::Disconnected;
                }
            };

            let mut readable = false;
            let mut writable = false;
            for event in &events {
                if event.token == CONNECTION_TOKEN {
                    readable |= event.readable || event.read_closed;
                    writable |= event.writable;
                }
            }

            if readable {
                match conn.on_readable() {
                    Ok(read) => {
                        for frame in read.frames {
                            match self.on_frame(&frame, &conn, &mut keepalive) {
                                FrameOutcome::Continue => {}
                                FrameOutcome::Stop(reason) => {
                                    self.close_clean(&mut conn, pool);
                                    return SessionEnd::Stop(reason);
                                }
                            }
                        }
                        if read.peer_closed {
                            debug!("server closed the session");
                            self.close_clean(&mut conn, pool);
                            return SessionEnd::Disconnected;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "read failed");
                        break 'session SessionEnd::Disconnected;
                    }
                }
            }
            if writable {
                if let Err(err) = conn.on_writable() {
                    warn!(error = %err, "write failed");
                    break 'session SessionEnd::Disconnected;
                }
            }

            // Commands
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(Command::Stop) => {
                        self.close_clean(&mut conn, pool);
                        return SessionEnd::Stop(StopReason::Requested);
                    }
                    Ok(Command::SendTo { to, payload }) => {
                        let route = Message::Route { to, payload };
                        if let Err(err) = conn.enqueue(route.to_string()) {
                            warn!(error = %err, "dropping outbound message");
                        }
                    }
                    Err(_) => break,
                }
            }

            // Keepalive, only while authenticated
            while tick_rx.try_recv().is_ok() {
                if self.state != ClientState::Running {
                    continue;
                }
                match keepalive.on_tick() {
                    KeepaliveAction::SendPing => {
                        if let Err(err) = conn.enqueue(Message::Ping.to_string()) {
                            warn!(error = %err, "dropping keepalive ping");
                        }
                    }
                    KeepaliveAction::Reconnect => {
                        warn!(missed = keepalive.missed(), "keepalive expired");
                        break 'session SessionEnd::Disconnected;
                    }
                }
            }

            let interest = if conn.wants_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if self
                .reactor
                .reregister(conn.stream_mut(), CONNECTION_TOKEN, interest)
                .is_err()
            {
                break 'session SessionEnd::Disconnected;
            }
        };

        let _ = self.reactor.deregister(conn.stream_mut());
        end
    }

    /// Apply one inbound frame.
    fn on_frame(
        &mut self,
        frame: &str,
        conn: &Connection,
        keepalive: &mut KeepalivePolicy,
    ) -> FrameOutcome {
        let message = match Message::parse(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed frame");
                return FrameOutcome::Continue;
            }
        };
        match message {
            Message::AuthSuccess { id } => {
                info!(id = %id, "authenticated");
                self.set_state(ClientState::Running);
                let _ = self.event_tx.send(ClientEvent::Connected);
            }
            Message::AuthFailed { reason } => {
                warn!(reason = %reason, "authentication rejected");
                let _ = self.event_tx.send(ClientEvent::AuthRejected { reason });
                return FrameOutcome::Stop(StopReason::AuthRejected);
            }
            Message::Delivery { from, payload } => {
                let _ = self.event_tx.send(ClientEvent::Delivery { from, payload });
            }
            Message::Pong => keepalive.on_pong(),
            Message::Ping => {
                if let Err(err) = conn.enqueue(Message::Pong.to_string()) {
                    warn!(error = %err, "dropping pong");
                }
            }
            other => debug!(verb = other.verb(), "ignoring unexpected message"),
        }
        FrameOutcome::Continue
    }

    /// Drive the close handshake on a session that is going away.
    fn close_clean(&mut self, conn: &mut Connection, pool: &TaskPool) {
        let _ = self.reactor.deregister(conn.stream_mut());
        conn.begin_close();
        let driver = HandshakeDriver::new(&self.config.handshake, pool);
        let (stream, engine, bufs) = conn.parts_mut();
        if let Err(err) = driver.drive(stream, engine, bufs) {
            debug!(error = %err, "close handshake incomplete");
        }
    }

    /// Sleep out the backoff, but let `Stop` interrupt it.
    /// Returns `true` when a stop was requested.
    fn backoff_wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.cmd_rx.recv_timeout(deadline - now) {
                Ok(Command::Stop) => return true,
                Ok(Command::SendTo { to, .. }) => {
                    warn!(to = %to, "dropping message while disconnected");
                }
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }
}

/// Keepalive timer: ticks on a channel, wakes the reactor, stops on demand.
fn start_keepalive_timer(
    interval: Duration,
    waker: Arc<Waker>,
) -> (Receiver<()>, Sender<()>) {
    let (tick_tx, tick_rx) = unbounded();
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let _ = std::thread::Builder::new()
        .name("umbra-keepalive".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if tick_tx.send(()).is_err() {
                        break;
                    }
                    let _ = waker.wake();
                }
                _ => break,
            }
        });
    (tick_rx, stop_tx)
}
