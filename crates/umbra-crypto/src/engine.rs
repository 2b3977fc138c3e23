//! The session engine abstraction.
//!
//! One engine drives one encrypted session, client or server side alike.
//! Callers own the I/O: they shuttle ciphertext between the socket and the
//! engine's source/destination buffers, loop on [`HandshakeStatus`] until the
//! session is established, and interpret each call's [`EngineStatus`] to
//! decide whether to grow a buffer, read more, flush, or tear down.

use umbra_wire::ByteBuffer;

use crate::error::EngineError;
use crate::identity::VerifiedPeer;
use crate::trust::HandshakeTask;

/// Which side of the handshake this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connecting side; sends the first handshake message.
    Initiator,
    /// The accepting side; answers the first handshake message.
    Responder,
}

impl Role {
    /// Short label for log fields.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

/// What the engine needs next to make handshake progress.
///
/// The same statuses drive the close handshake once either side has
/// requested shutdown, so a single loop serves both phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has bytes to produce; call `encrypt` and flush them.
    AwaitingEncrypt,
    /// The engine needs peer bytes; read from the channel and call `decrypt`.
    AwaitingDecrypt,
    /// Delegated validation work is outstanding; drain `take_task` and wait.
    AwaitingTask,
    /// Session established (or fully closed after a close handshake).
    Complete,
    /// The handshake or session failed; the engine is unusable.
    Failed,
    /// The driver's deadline expired; the engine is unusable.
    TimedOut,
}

impl HandshakeStatus {
    /// Whether this status is a dead end (`Failed` or `TimedOut`).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

/// Outcome of a single encrypt or decrypt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The call made progress.
    Success,
    /// The destination buffer cannot hold the next record or plaintext;
    /// grow it and retry. No input was consumed.
    OutputTooSmall,
    /// The source buffer does not hold a complete record yet; read more.
    /// No input was consumed.
    InputIncomplete,
    /// A close record was produced or consumed.
    Closed,
}

/// Byte accounting for one engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    /// Operation status.
    pub status: EngineStatus,
    /// Bytes consumed from the source buffer.
    pub consumed: usize,
    /// Bytes produced into the destination buffer.
    pub produced: usize,
}

impl EngineResult {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self {
            status,
            consumed,
            produced,
        }
    }
}

/// A manually driven encrypt/decrypt state machine for one session.
///
/// Buffer conventions: `src` is in read mode (its unread region is the
/// input), `dst` is in write mode. One record is produced or consumed per
/// call; callers loop. Implementations never perform I/O and never block.
pub trait SessionEngine: Send {
    /// Which side this engine plays.
    fn role(&self) -> Role;

    /// Current handshake (or close-handshake) status.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Produce one record into `dst`.
    ///
    /// During the open handshake `src` is ignored. In transport mode, up to
    /// one record's worth of `src` plaintext is consumed. When an outbound
    /// close is pending, the close record is produced instead and the status
    /// is [`EngineStatus::Closed`].
    ///
    /// # Errors
    ///
    /// Fails on protocol errors, on calls into a terminal engine, and while
    /// a validation task is unresolved.
    fn encrypt(
        &mut self,
        src: &mut ByteBuffer,
        dst: &mut ByteBuffer,
    ) -> Result<EngineResult, EngineError>;

    /// Consume one record from `src`, producing plaintext into `dst`.
    ///
    /// Handshake records advance the handshake and produce no plaintext.
    /// A close record reports [`EngineStatus::Closed`].
    ///
    /// # Errors
    ///
    /// Fails on corrupt or out-of-phase records, on calls into a terminal
    /// engine, and while a validation task is unresolved.
    fn decrypt(
        &mut self,
        src: &mut ByteBuffer,
        dst: &mut ByteBuffer,
    ) -> Result<EngineResult, EngineError>;

    /// Take the next delegated validation task, if any.
    ///
    /// Tasks are CPU-bound and safe to run on another thread; the engine
    /// observes their verdicts without further calls.
    fn take_task(&mut self) -> Option<HandshakeTask>;

    /// Request an orderly outbound close. The next `encrypt` produces the
    /// close record; the status machine then walks the close handshake.
    fn close_outbound(&mut self);

    /// Record that the peer's stream hit EOF. During the open handshake this
    /// fails the engine; afterwards it forces inbound closure and queues the
    /// response close if one has not been sent.
    fn on_peer_eof(&mut self);

    /// Whether the outbound close record has been produced.
    fn is_outbound_done(&self) -> bool;

    /// Whether the peer's close (or a forced EOF closure) has been observed.
    fn is_inbound_done(&self) -> bool;

    /// Destination capacity that guarantees `encrypt` can produce its next
    /// record; the growth target on [`EngineStatus::OutputTooSmall`] and for
    /// ciphertext-side buffers on [`EngineStatus::InputIncomplete`].
    fn record_capacity_hint(&self) -> usize;

    /// Destination capacity that guarantees `decrypt` can land any record's
    /// plaintext; the growth target for the inbound plaintext buffer.
    fn plaintext_capacity_hint(&self) -> usize;

    /// The validated peer, once the handshake task has accepted it.
    fn peer(&self) -> Option<&VerifiedPeer>;

    /// Mark the engine timed out. Terminal; set by the handshake driver when
    /// its wall-clock budget expires.
    fn mark_timed_out(&mut self);
}
