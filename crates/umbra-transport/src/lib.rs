//! # Umbra Transport
//!
//! Event-driven plumbing under the Umbra relay: a readiness-polling reactor
//! wrapping `mio`, and a small bounded worker pool for CPU-bound handshake
//! work.
//!
//! One reactor drives all socket I/O for a process role (client or server)
//! on a single thread; nothing submitted to the pool ever blocks that
//! thread, and a full pool runs the job on the submitting thread rather
//! than dropping it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod reactor;
pub mod tasks;

pub use reactor::{PollEvent, Reactor, WAKE_TOKEN};
pub use tasks::{TaskPool, TaskPoolConfig};
