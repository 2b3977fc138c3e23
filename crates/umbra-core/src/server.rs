//! The relay server: accept, handshake, authenticate, route.
//!
//! Single reactor thread. Accepted connections complete their transport
//! handshake synchronously (on the driver's private poll) before they are
//! registered with the reactor; the reactor only ever sees established
//! sessions. Application authentication then happens in-band: the first
//! thing a client must send is `AUTH`, and any other traffic before a
//! successful `AUTH` is a protocol violation that terminates the
//! connection.
//!
//! Routing is store-and-forward with no delivery guarantee: `TO` enqueues a
//! sender-tagged `FROM` on the target's queue; an unknown target or a full
//! queue drops the message with a warning.

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use umbra_crypto::{Identity, NoiseEngine, Role, TrustProvider};
use umbra_transport::{Reactor, TaskPool, TaskPoolConfig};
use umbra_wire::{Message, BAD_CREDENTIALS_REASON};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{ConnectionError, ServerError};
use crate::handshake::HandshakeDriver;
use crate::queue::OutboundQueue;
use crate::registry::Registry;

const LISTENER_TOKEN: Token = Token(0);

/// First token handed to accepted connections; low numbers stay reserved.
const FIRST_CONNECTION_TOKEN: usize = 16;

/// Sender id the server uses for operator-injected deliveries.
const SERVER_SENDER: &str = "server";

/// Decides whether an `AUTH id=secret` pair is valid.
pub trait CredentialValidator: Send + Sync {
    /// `true` accepts the login.
    fn validate(&self, id: &str, secret: &str) -> bool;
}

/// Accepts when the secret mirrors the id. Development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorCredentials;

impl CredentialValidator for MirrorCredentials {
    fn validate(&self, id: &str, secret: &str) -> bool {
        !id.is_empty() && id == secret
    }
}

/// The relay server. Owns the listener, the reactor, and every connection.
pub struct RelayServer {
    config: ServerConfig,
    identity: Identity,
    trust: Arc<dyn TrustProvider>,
    credentials: Arc<dyn CredentialValidator>,
    listener: TcpListener,
    local_addr: SocketAddr,
    reactor: Reactor,
    registry: Arc<Registry>,
    pool: TaskPool,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
}

impl RelayServer {
    /// Bind the listener and assemble the server. `run` starts serving.
    ///
    /// # Errors
    ///
    /// Socket bind or reactor setup failure.
    pub fn bind(
        addr: SocketAddr,
        config: ServerConfig,
        identity: Identity,
        trust: Arc<dyn TrustProvider>,
        credentials: Arc<dyn CredentialValidator>,
    ) -> Result<Self, ServerError> {
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let reactor = Reactor::new(256)?;
        reactor.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let registry = Arc::new(Registry::new(reactor.waker()));
        let pool = TaskPool::new(TaskPoolConfig {
            queue_depth: config.handshake.task_queue_depth,
            workers: 0,
        });
        info!(%local_addr, "relay server listening");
        Ok(Self {
            config,
            identity,
            trust,
            credentials,
            listener,
            local_addr,
            reactor,
            registry,
            pool,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for injecting messages and shutting the server down.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            addr: self.local_addr,
            thread: None,
        }
    }

    /// Run on a background thread; the returned handle can stop and join it.
    #[must_use]
    pub fn spawn(self) -> ServerHandle {
        let mut handle = self.handle();
        handle.thread = Some(std::thread::spawn(move || self.run()));
        handle
    }

    /// Serve until [`ServerHandle::stop`] is called.
    ///
    /// # Errors
    ///
    /// Only reactor poll failures end the loop with an error; per-connection
    /// failures close that connection and are logged.
    pub fn run(mut self) -> Result<(), ServerError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            let events = self.reactor.poll(Some(Duration::from_millis(100)))?;
            for event in events {
                match event.token {
                    LISTENER_TOKEN => self.accept_pending(),
                    _ if event.is_wake() => {}
                    token => self.on_connection_event(
                        token,
                        event.readable || event.read_closed,
                        event.writable,
                    ),
                }
            }
            self.flush_dirty();
        }
        self.teardown();
        self.pool.shutdown();
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.admit(stream, peer) {
                        warn!(%peer, error = %err, "connection rejected during handshake");
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Handshake an accepted stream, then register it with the reactor.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let engine = NoiseEngine::new(Role::Responder, &self.identity, Arc::clone(&self.trust))?;
        let queue = Arc::new(OutboundQueue::new(&self.config.queue));
        let mut conn = Connection::new(
            stream,
            Box::new(engine),
            Arc::clone(&queue),
            &self.config.handshake,
            self.config.max_frame(),
        );

        let driver = HandshakeDriver::new(&self.config.handshake, &self.pool);
        {
            let (stream, engine, bufs) = conn.parts_mut();
            driver.drive(stream, engine, bufs)?;
        }

        let token = Token(self.next_token);
        self.next_token += 1;
        self.reactor
            .register(conn.stream_mut(), token, Interest::READABLE)?;
        self.registry.register_connection(token, queue);
        info!(%peer, token = token.0, "connection established");
        self.connections.insert(token, conn);
        Ok(())
    }

    fn on_connection_event(&mut self, token: Token, readable: bool, writable: bool) {
        if readable {
            let (frames, peer_closed) = {
                let Some(conn) = self.connections.get_mut(&token) else {
                    return;
                };
                match conn.on_readable() {
                    Ok(event) => (event.frames, event.peer_closed),
                    Err(err) => {
                        warn!(token = token.0, error = %err, "read failed");
                        self.close_abrupt(token);
                        return;
                    }
                }
            };
            for frame in frames {
                if let Err(err) = self.dispatch(token, &frame) {
                    warn!(token = token.0, error = %err, "closing connection");
                    self.close_abrupt(token);
                    return;
                }
            }
            if peer_closed {
                self.close_clean(token);
                return;
            }
        }
        if writable {
            self.try_flush(token);
        } else {
            self.update_interest(token);
        }
    }

    /// Apply one frame from an established connection.
    fn dispatch(&mut self, token: Token, frame: &str) -> Result<(), ConnectionError> {
        let message = Message::parse(frame)?;
        let identity = self.registry.id_of(token);
        match message {
            Message::Auth { id, secret } => self.handle_auth(token, &id, &secret),
            _ if identity.is_none() => Err(ConnectionError::ProtocolViolation(format!(
                "{} before AUTH",
                message.verb()
            ))),
            Message::Ping => {
                self.reply(token, &Message::Pong);
                Ok(())
            }
            Message::Pong => {
                debug!(token = token.0, "pong");
                Ok(())
            }
            Message::Route { to, payload } => {
                let from = identity.unwrap_or_default();
                self.route(&from, &to, payload);
                Ok(())
            }
            Message::AuthSuccess { .. } | Message::AuthFailed { .. } | Message::Delivery { .. } => {
                Err(ConnectionError::ProtocolViolation(format!(
                    "{} is server-to-client only",
                    message.verb()
                )))
            }
        }
    }

    fn handle_auth(&mut self, token: Token, id: &str, secret: &str) -> Result<(), ConnectionError> {
        if self.credentials.validate(id, secret) {
            if let Some(stale) = self.registry.bind_identity(id, token) {
                info!(id, old = stale.0, new = token.0, "session superseded");
                self.close_abrupt(stale);
            }
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.set_identity(id);
            }
            info!(id, token = token.0, "authenticated");
            self.reply(token, &Message::AuthSuccess { id: id.to_owned() });
        } else {
            warn!(id, token = token.0, "authentication failed");
            self.reply(
                token,
                &Message::AuthFailed {
                    reason: BAD_CREDENTIALS_REASON.to_owned(),
                },
            );
        }
        Ok(())
    }

    /// Forward a payload, tagging it with the sender's id. Unroutable
    /// messages are dropped with a warning; the relay promises no delivery.
    fn route(&mut self, from: &str, to: &str, payload: String) {
        let delivery = Message::Delivery {
            from: from.to_owned(),
            payload,
        };
        match self.registry.enqueue_for_id(to, delivery.to_string()) {
            Ok(()) => debug!(from, to, "routed"),
            Err(ServerError::UnknownTarget(_)) => {
                warn!(from, to, "dropping message for unknown target");
            }
            Err(err) => warn!(from, to, error = %err, "dropping message"),
        }
    }

    /// Best-effort reply to a connection's own queue.
    fn reply(&mut self, token: Token, message: &Message) {
        if let Err(err) = self.registry.enqueue(token, message.to_string()) {
            warn!(token = token.0, error = %err, "reply dropped");
        }
    }

    fn flush_dirty(&mut self) {
        for token in self.registry.take_dirty() {
            self.try_flush(token);
        }
    }

    fn try_flush(&mut self, token: Token) {
        let flush = match self.connections.get_mut(&token) {
            Some(conn) => conn.on_writable(),
            None => return,
        };
        if let Err(err) = flush {
            warn!(token = token.0, error = %err, "write failed");
            self.close_abrupt(token);
            return;
        }
        self.update_interest(token);
    }

    /// Keep write-interest registered exactly while output is pending.
    fn update_interest(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let interest = if conn.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(err) = self.reactor.reregister(conn.stream_mut(), token, interest) {
            warn!(token = token.0, error = %err, "reregister failed");
        }
    }

    /// Drop a connection without the close handshake (violation, I/O error,
    /// superseded session).
    fn close_abrupt(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.reactor.deregister(conn.stream_mut());
        let id = self.registry.drop_connection(token);
        info!(token = token.0, id = id.as_deref().unwrap_or("-"), "connection dropped");
    }

    /// Finish the close handshake, then drop the connection.
    fn close_clean(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.reactor.deregister(conn.stream_mut());
        conn.begin_close();
        let driver = HandshakeDriver::new(&self.config.handshake, &self.pool);
        {
            let (stream, engine, bufs) = conn.parts_mut();
            if let Err(err) = driver.drive(stream, engine, bufs) {
                debug!(token = token.0, error = %err, "close handshake incomplete");
            }
        }
        let id = self.registry.drop_connection(token);
        info!(token = token.0, id = id.as_deref().unwrap_or("-"), "connection closed");
    }

    fn teardown(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_clean(token);
        }
        info!("relay server stopped");
    }
}

/// Control surface for a running server: inject messages, stop, join.
pub struct ServerHandle {
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
    addr: SocketAddr,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    /// The server's bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Deliver a payload to the client bound to `id`, tagged as coming
    /// from the server itself.
    ///
    /// # Errors
    ///
    /// [`ServerError::Stopped`] after shutdown, [`ServerError::UnknownTarget`]
    /// when no client is bound to `id`, or the queue's backpressure error.
    pub fn send_to(&self, id: &str, payload: &str) -> Result<(), ServerError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }
        let delivery = Message::Delivery {
            from: SERVER_SENDER.to_owned(),
            payload: payload.to_owned(),
        };
        self.registry.enqueue_for_id(id, delivery.to_string())
    }

    /// Whether a client is currently bound to `id`.
    #[must_use]
    pub fn is_bound(&self, id: &str) -> bool {
        self.registry.token_of(id).is_some()
    }

    /// Ask the server to stop. Idempotent; returns immediately.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the reactor out of its poll wait
        self.registry.mark_dirty(Token(usize::MAX));
    }

    /// Stop and wait for the server thread (when started via `spawn`).
    ///
    /// # Errors
    ///
    /// The server loop's exit error, if any.
    pub fn stop_and_join(mut self) -> Result<(), ServerError> {
        self.stop();
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or(Err(ServerError::Stopped)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_credentials() {
        let v = MirrorCredentials;
        assert!(v.validate("alice", "alice"));
        assert!(!v.validate("alice", "bob"));
        assert!(!v.validate("", ""));
    }
}
