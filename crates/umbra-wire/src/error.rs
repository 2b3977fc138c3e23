//! Error types for the Umbra wire layer.

use thiserror::Error;

/// Byte buffer errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Write would exceed the remaining space between position and limit
    #[error("buffer overflow: need {needed} bytes, {remaining} remaining")]
    Overflow {
        /// Bytes the write requires
        needed: usize,
        /// Bytes available before the limit
        remaining: usize,
    },

    /// Growth would exceed the configured hard cap
    #[error("buffer capacity cap exceeded: requested {requested}, cap {cap}")]
    CapacityExceeded {
        /// Capacity the growth requested
        requested: usize,
        /// Configured maximum capacity
        cap: usize,
    },

    /// Read past the readable region
    #[error("buffer underflow: need {needed} bytes, {available} readable")]
    Underflow {
        /// Bytes the read requires
        needed: usize,
        /// Bytes available before the limit
        available: usize,
    },
}

/// Frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Accumulated bytes exceed the frame cap without a delimiter
    #[error("frame too large: {size} bytes accumulated, cap {cap}")]
    FrameTooLarge {
        /// Bytes accumulated so far
        size: usize,
        /// Configured frame cap
        cap: usize,
    },

    /// Frame bytes are not valid UTF-8
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Control message errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// Empty frame where a message was expected
    #[error("empty message")]
    Empty,

    /// First token is not a known verb
    #[error("unknown verb: {0:?}")]
    UnknownVerb(String),

    /// Verb recognized but the remainder does not parse
    #[error("malformed {verb} message: {detail}")]
    Malformed {
        /// The verb whose arguments failed to parse
        verb: &'static str,
        /// What was wrong
        detail: &'static str,
    },
}
