//! Error types for the Umbra session engine.

use thiserror::Error;
use umbra_wire::BufferError;

/// Session engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Noise protocol failure (bad MAC, state misuse, malformed message)
    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    /// Staging buffer failure while producing or consuming records
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Identity claim failed to decode or verify
    #[error("identity claim error: {0}")]
    Claim(#[from] IdentityError),

    /// The engine reached a terminal state; no further calls are valid
    #[error("session engine is terminal: {0}")]
    Terminal(String),

    /// A delegated validation task has not delivered its verdict yet
    #[error("handshake task pending")]
    TaskPending,

    /// Record type not valid for the current phase
    #[error("unexpected record type 0x{actual:02X} during {phase}")]
    UnexpectedRecord {
        /// Record type byte received
        actual: u8,
        /// Phase the engine was in
        phase: &'static str,
    },

    /// Record type byte is not part of the protocol
    #[error("unknown record type: 0x{0:02X}")]
    UnknownRecord(u8),

    /// Peer revealed its static key without an identity claim
    #[error("peer sent static key without an identity claim")]
    MissingClaim,

    /// Handshake payload arrived on a message that must not carry one
    #[error("unexpected handshake payload")]
    UnexpectedPayload,
}

/// Identity and claim errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Claim blob has the wrong length
    #[error("claim must be {expected} bytes, got {actual}")]
    ClaimLength {
        /// Required encoded length
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Identity key bytes are not a valid Ed25519 point
    #[error("invalid identity key")]
    InvalidIdentityKey,

    /// Claim signature does not verify
    #[error("claim signature invalid")]
    SignatureInvalid,

    /// Claimed static key differs from the one the handshake produced
    #[error("claimed static key does not match the session")]
    StaticKeyMismatch,

    /// Key generation failed
    #[error("key generation failed: {0}")]
    Keygen(#[from] snow::Error),
}

/// Trust policy errors
#[derive(Debug, Error)]
pub enum TrustError {
    /// The claim itself did not hold up
    #[error("identity verification failed: {0}")]
    Identity(#[from] IdentityError),

    /// Verified identity is not in the allowed set
    #[error("identity {fingerprint} is not trusted")]
    UnknownIdentity {
        /// Fingerprint of the rejected identity
        fingerprint: String,
    },
}
