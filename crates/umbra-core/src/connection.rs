//! One connection: socket, session engine, buffers, codec, queue.
//!
//! Every connection owns exactly four buffers, reused for its whole life:
//!
//! ```text
//! app_out ── plaintext staged for encryption
//! net_out ── ciphertext awaiting the socket
//! net_in  ── ciphertext read from the socket
//! app_in  ── plaintext produced by decryption
//! ```
//!
//! The read path drains the socket to `WouldBlock` (the reactor is
//! edge-style; a partial drain loses wakeups), decrypts every complete
//! record, and feeds the plaintext through the frame codec. The write path
//! flushes pending ciphertext first, then encrypts queued messages one at a
//! time, stopping at the first write that would block.

use mio::net::TcpStream;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

use umbra_crypto::{EngineStatus, SessionEngine, VerifiedPeer};
use umbra_wire::{ByteBuffer, FrameCodec};

use crate::config::HandshakeConfig;
use crate::error::ConnectionError;
use crate::queue::OutboundQueue;

/// The four session buffers, grouped so the handshake driver can borrow
/// them alongside the stream and engine.
#[derive(Debug)]
pub struct SessionBuffers {
    /// Plaintext staged for encryption.
    pub app_out: ByteBuffer,
    /// Ciphertext awaiting the socket.
    pub net_out: ByteBuffer,
    /// Ciphertext read from the socket.
    pub net_in: ByteBuffer,
    /// Plaintext produced by decryption.
    pub app_in: ByteBuffer,
}

impl SessionBuffers {
    /// Allocate all four buffers with the same initial capacity and cap.
    #[must_use]
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            app_out: ByteBuffer::new(initial, max),
            net_out: ByteBuffer::new(initial, max),
            net_in: ByteBuffer::new(initial, max),
            app_in: ByteBuffer::new(initial, max),
        }
    }

    /// Reset every buffer. Capacity is kept; contents are discarded.
    pub fn clear_all(&mut self) {
        self.app_out.clear();
        self.net_out.clear();
        self.net_in.clear();
        self.app_in.clear();
    }
}

/// What one readability pass produced.
#[derive(Debug, Default)]
pub struct ReadEvent {
    /// Complete frames, in receipt order.
    pub frames: Vec<String>,
    /// Peer closed (close record or EOF); the caller should finish the
    /// close handshake and tear the connection down.
    pub peer_closed: bool,
}

/// A live connection with its exclusively-owned session state.
pub struct Connection {
    stream: TcpStream,
    engine: Box<dyn SessionEngine>,
    bufs: SessionBuffers,
    codec: FrameCodec,
    queue: Arc<OutboundQueue>,
    identity: Option<String>,
    peer_addr: Option<SocketAddr>,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    /// Wrap an accepted or connected non-blocking stream.
    #[must_use]
    pub fn new(
        stream: TcpStream,
        engine: Box<dyn SessionEngine>,
        queue: Arc<OutboundQueue>,
        config: &HandshakeConfig,
        max_frame: usize,
    ) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream,
            engine,
            bufs: SessionBuffers::new(config.initial_buffer, config.max_buffer),
            codec: FrameCodec::new(max_frame),
            queue,
            identity: None,
            peer_addr,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// The underlying stream, for reactor registration.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Stream, engine, and buffers together, for the handshake driver.
    pub fn parts_mut(&mut self) -> (&mut TcpStream, &mut dyn SessionEngine, &mut SessionBuffers) {
        (&mut self.stream, self.engine.as_mut(), &mut self.bufs)
    }

    /// Peer address captured at creation.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The application identity bound by `AUTH`, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Bind the application identity.
    pub fn set_identity(&mut self, id: &str) {
        self.identity = Some(id.to_owned());
    }

    /// The transport-level verified peer, once the handshake completed.
    #[must_use]
    pub fn verified_peer(&self) -> Option<&VerifiedPeer> {
        self.engine.peer()
    }

    /// This connection's outbound queue.
    #[must_use]
    pub fn queue(&self) -> Arc<OutboundQueue> {
        Arc::clone(&self.queue)
    }

    /// Queue a wire message for the next write-readiness.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Backpressure`] when the queue is at capacity.
    pub fn enqueue(&self, message: String) -> Result<(), ConnectionError> {
        self.queue.push(message)
    }

    /// Whether the connection has anything to write (pending ciphertext or
    /// queued messages); drives write-interest registration.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        self.bufs.net_out.position() > 0 || !self.queue.is_empty()
    }

    /// Request an orderly close; the close handshake is driven separately.
    pub fn begin_close(&mut self) {
        self.engine.close_outbound();
    }

    /// Total bytes read from and written to the socket.
    #[must_use]
    pub fn traffic(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }

    /// Handle read-readiness: drain the socket, decrypt, split frames.
    ///
    /// # Errors
    ///
    /// Socket errors (not `WouldBlock`), engine failures, codec violations,
    /// and buffer-cap overruns. All of them mean the connection is done.
    pub fn on_readable(&mut self) -> Result<ReadEvent, ConnectionError> {
        let mut peer_closed = false;
        let mut saw_eof = false;

        loop {
            if !self.bufs.net_in.has_remaining() {
                // Ciphertext buffer full: decrypt to free space, growing
                // toward the engine's record hint when one record alone
                // exceeds the current capacity.
                self.drain_ciphertext(&mut peer_closed)?;
                if !self.bufs.net_in.has_remaining() {
                    let target = self
                        .engine
                        .record_capacity_hint()
                        .max(self.bufs.net_in.capacity() + 1);
                    self.bufs.net_in.grow(target)?;
                }
            }
            match self.bufs.net_in.fill_from(&mut self.stream) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => self.bytes_in += n as u64,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.drain_ciphertext(&mut peer_closed)?;
        if saw_eof {
            self.engine.on_peer_eof();
            peer_closed = true;
        }

        self.bufs.app_in.flip();
        let frames = match self.codec.push(self.bufs.app_in.unread()) {
            Ok(frames) => frames,
            Err(err) => {
                self.bufs.app_in.clear();
                return Err(err.into());
            }
        };
        self.bufs.app_in.clear();
        if !frames.is_empty() {
            trace!(count = frames.len(), "frames received");
        }
        Ok(ReadEvent { frames, peer_closed })
    }

    /// Decrypt every complete record currently in `net_in` into `app_in`.
    fn drain_ciphertext(&mut self, peer_closed: &mut bool) -> Result<(), ConnectionError> {
        self.bufs.net_in.flip();
        let result = loop {
            match self
                .engine
                .decrypt(&mut self.bufs.net_in, &mut self.bufs.app_in)
            {
                Ok(step) => match step.status {
                    EngineStatus::Success => {
                        if step.consumed == 0 && step.produced == 0 {
                            break Ok(());
                        }
                    }
                    EngineStatus::OutputTooSmall => {
                        if let Err(err) =
                            self.bufs.app_in.grow(self.engine.plaintext_capacity_hint())
                        {
                            break Err(err.into());
                        }
                    }
                    EngineStatus::InputIncomplete => break Ok(()),
                    EngineStatus::Closed => {
                        *peer_closed = true;
                        break Ok(());
                    }
                },
                Err(err) => break Err(err.into()),
            }
        };
        self.bufs.net_in.compact();
        result
    }

    /// Handle write-readiness: flush pending ciphertext, then drain the
    /// queue in FIFO order, stopping at the first blocked write.
    ///
    /// # Errors
    ///
    /// Socket errors (not `WouldBlock`), engine failures, and buffer-cap
    /// overruns.
    pub fn on_writable(&mut self) -> Result<(), ConnectionError> {
        if !self.flush_net_out()? {
            return Ok(());
        }
        while let Some(message) = self.queue.pop() {
            self.stage_message(&message)?;
            if !self.flush_net_out()? {
                // Blocked: the encrypted remainder stays in net_out, the
                // rest of the queue stays queued.
                break;
            }
        }
        Ok(())
    }

    /// Encode and encrypt one message into `net_out` (which is empty on
    /// entry; see `on_writable`).
    fn stage_message(&mut self, message: &str) -> Result<(), ConnectionError> {
        let wire = FrameCodec::encode(message);
        self.bufs.app_out.clear();
        if self.bufs.app_out.remaining() < wire.len() {
            self.bufs.app_out.grow(wire.len())?;
        }
        self.bufs.app_out.put(&wire)?;
        self.bufs.app_out.flip();

        while self.bufs.app_out.has_remaining() {
            let step = self
                .engine
                .encrypt(&mut self.bufs.app_out, &mut self.bufs.net_out)?;
            match step.status {
                EngineStatus::Success => {}
                EngineStatus::OutputTooSmall => {
                    let target = self.bufs.net_out.position() + self.engine.record_capacity_hint();
                    self.bufs.net_out.grow(target)?;
                }
                // A pending close preempts data; drop the remainder.
                EngineStatus::Closed => break,
                EngineStatus::InputIncomplete => break,
            }
        }
        self.bufs.app_out.clear();
        Ok(())
    }

    /// Write pending ciphertext; `Ok(true)` when fully flushed, `Ok(false)`
    /// when the socket blocked with bytes still pending.
    fn flush_net_out(&mut self) -> Result<bool, ConnectionError> {
        self.bufs.net_out.flip();
        let flushed = loop {
            if !self.bufs.net_out.has_remaining() {
                break true;
            }
            match self.bufs.net_out.drain_to(&mut self.stream) {
                Ok(0) => {
                    self.bufs.net_out.compact();
                    return Err(io::Error::from(ErrorKind::WriteZero).into());
                }
                Ok(n) => self.bytes_out += n as u64,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break false,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    self.bufs.net_out.compact();
                    return Err(err.into());
                }
            }
        };
        self.bufs.net_out.compact();
        Ok(flushed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("identity", &self.identity)
            .field("bytes_in", &self.bytes_in)
            .field("bytes_out", &self.bytes_out)
            .finish_non_exhaustive()
    }
}
