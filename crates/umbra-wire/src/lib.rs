//! # Umbra Wire
//!
//! Wire-level primitives for the Umbra relay protocol.
//!
//! This crate provides:
//! - A growable byte buffer with position/limit cursor semantics
//! - The delimiter-based frame codec used above the encrypted channel
//! - Control message parsing and encoding
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Control messages                             │
//! │   (PING / PONG / AUTH / TO / FROM verbs as delimited text)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Frame codec                                   │
//! │   (delimiter-split frames over the decrypted byte stream)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Byte buffers                                  │
//! │   (cursor-managed staging between sockets and the engine)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod codec;
pub mod error;
pub mod message;

pub use buffer::ByteBuffer;
pub use codec::FrameCodec;
pub use error::{BufferError, CodecError, MessageError};
pub use message::{Message, BAD_CREDENTIALS_REASON};

/// Frame delimiter on the plaintext stream
pub const FRAME_DELIMITER: &[u8] = b"v^";

/// Default hard cap on buffer growth
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

/// Default cap on a single undelimited frame
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;
