//! Error types for connections, handshakes, client, and server.
//!
//! I/O statuses that are part of normal operation (`WouldBlock`, zero-byte
//! reads) never appear here; they are handled as values where they occur.
//! These enums carry the failures that change a connection's state.

use thiserror::Error;
use umbra_crypto::EngineError;
use umbra_wire::{BufferError, CodecError, MessageError};

/// Failures on an established connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket read/write failure (not `WouldBlock`)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Session engine failure while encrypting or decrypting
    #[error("session engine error: {0}")]
    Engine(#[from] EngineError),

    /// Frame codec rejected the plaintext stream
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Session buffer failure
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Outbound queue is at capacity; the caller must back off
    #[error("outbound queue full: {queued} messages / {queued_bytes} bytes queued")]
    Backpressure {
        /// Messages currently queued
        queued: usize,
        /// Payload bytes currently queued
        queued_bytes: usize,
    },

    /// Peer violated the protocol; the connection closes without retry
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Failures while driving a handshake (open or close)
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Socket read/write failure during the handshake
    #[error("i/o error during handshake: {0}")]
    Io(#[from] std::io::Error),

    /// The engine failed (crypto error, rejected identity, bad record)
    #[error("handshake failed: {0}")]
    Engine(#[from] EngineError),

    /// Session buffer failure during the handshake
    #[error("buffer error during handshake: {0}")]
    Buffer(#[from] BufferError),

    /// The engine reported failure without a call-site error
    #[error("handshake rejected")]
    Rejected,

    /// Peer hung up mid-handshake
    #[error("peer closed during handshake")]
    PeerClosed,

    /// The wall-clock deadline expired
    #[error("handshake timed out")]
    TimedOut,
}

/// Failures surfaced by the relay client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket or reactor failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect or close handshake failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Established connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Engine construction failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The server rejected our credentials; not retried
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The reconnect budget is spent; the client is permanently stopped
    #[error("gave up after {0} reconnect attempts")]
    AttemptsExhausted(u32),

    /// The client was stopped and accepts no further commands
    #[error("client is stopped")]
    Stopped,
}

/// Failures surfaced by the relay server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket or reactor failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine construction failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An accepted connection failed its transport handshake
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Routing target has no live connection
    #[error("no connection bound to id {0:?}")]
    UnknownTarget(String),

    /// Target connection's queue is full
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The server was shut down
    #[error("server is stopped")]
    Stopped,
}

/// A malformed frame is a protocol violation on the server side.
impl From<MessageError> for ConnectionError {
    fn from(err: MessageError) -> Self {
        Self::ProtocolViolation(err.to_string())
    }
}
