//! # Umbra Core
//!
//! Connection lifecycle, routing, and the relay's two endpoints.
//!
//! The crate splits along one line: everything below the socket is a
//! *session* (handshake, encrypted records, close walk — see
//! `umbra-crypto`), everything above it is *relay protocol* (AUTH, PING,
//! TO/FROM frames — see `umbra-wire`). This crate owns the glue:
//!
//! - [`Connection`]: one socket plus its engine, buffers, codec, and
//!   outbound queue
//! - [`HandshakeDriver`]: drives open and close handshakes synchronously
//!   on a private poll, with identity checks delegated to a task pool
//! - [`Registry`]: server-side id↔connection bindings with atomic
//!   eviction, and the per-connection queues external senders write to
//! - [`RelayClient`]: a self-healing client with keepalive probing and
//!   bounded linear reconnect backoff
//! - [`RelayServer`]: a single-reactor server that authenticates and
//!   routes sender-tagged messages between clients
//!
//! ## A minimal relay
//!
//! ```no_run
//! use std::sync::Arc;
//! use umbra_core::{
//!     ClientConfig, MirrorCredentials, RelayClient, RelayServer, ServerConfig,
//! };
//! use umbra_crypto::{Identity, TrustAnyVerified};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = RelayServer::bind(
//!     "127.0.0.1:0".parse()?,
//!     ServerConfig::default(),
//!     Identity::generate()?,
//!     Arc::new(TrustAnyVerified),
//!     Arc::new(MirrorCredentials),
//! )?;
//! let addr = server.local_addr();
//! let handle = server.spawn();
//!
//! let alice = RelayClient::connect(
//!     addr,
//!     "alice",
//!     "alice",
//!     ClientConfig::default(),
//!     Arc::new(TrustAnyVerified),
//! )?;
//! alice.send_to("bob", "hello")?;
//! # alice.stop_and_join();
//! # handle.stop_and_join()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod server;

pub use client::{ClientEvent, ClientState, RelayClient, StopReason};
pub use config::{
    ClientConfig, HandshakeConfig, KeepaliveConfig, QueueConfig, ReconnectConfig, ServerConfig,
};
pub use connection::{Connection, ReadEvent, SessionBuffers};
pub use error::{ClientError, ConnectionError, HandshakeError, ServerError};
pub use handshake::HandshakeDriver;
pub use policy::{KeepaliveAction, KeepalivePolicy, ReconnectPolicy};
pub use queue::OutboundQueue;
pub use registry::{Bindings, Registry};
pub use server::{CredentialValidator, MirrorCredentials, RelayServer, ServerHandle};
