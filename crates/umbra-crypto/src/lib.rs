//! # Umbra Crypto
//!
//! The session engine for the Umbra relay protocol.
//!
//! This crate provides:
//! - The [`SessionEngine`] trait: a manually driven encrypt/decrypt state
//!   machine with explicit handshake and operation statuses
//! - [`NoiseEngine`], the Noise_XX-backed implementation with its record layer
//! - Identity keypairs and the signed claims that bind them to a session
//! - Trust policies evaluated as delegated handshake tasks
//!
//! ## Driving model
//!
//! Nothing in this crate touches a socket. Callers feed ciphertext in and
//! plaintext out through [`umbra_wire::ByteBuffer`]s, looping on the engine's
//! [`HandshakeStatus`] until it reports `Complete`, and reacting to each
//! operation's [`EngineStatus`] (grow a buffer, read more bytes, flush, or
//! tear down). CPU-heavy peer validation is handed back to the caller as
//! [`HandshakeTask`]s so the engine itself never blocks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod engine;
pub mod error;
pub mod identity;
pub mod noise;
pub mod trust;

pub use engine::{EngineResult, EngineStatus, HandshakeStatus, Role, SessionEngine};
pub use error::{EngineError, IdentityError, TrustError};
pub use identity::{Identity, PeerClaim, VerifiedPeer};
pub use noise::NoiseEngine;
pub use trust::{HandshakeTask, PinnedIdentities, TaskVerdict, TrustAnyVerified, TrustProvider};
