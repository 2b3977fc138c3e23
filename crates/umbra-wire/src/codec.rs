//! Delimiter-based frame codec for the plaintext stream.
//!
//! Decrypted bytes arrive in arbitrary chunks; the codec accumulates them
//! per connection and splits on the literal [`FRAME_DELIMITER`], yielding
//! complete messages in arrival order. There is no escaping: a payload that
//! contains the delimiter sequence will mis-split. That limitation is part
//! of the wire contract, kept rather than papered over.

use crate::FRAME_DELIMITER;
use crate::error::CodecError;

/// Per-connection frame accumulator and splitter.
#[derive(Debug)]
pub struct FrameCodec {
    acc: Vec<u8>,
    max_frame: usize,
}

impl FrameCodec {
    /// Create a codec with a cap on undelimited accumulation.
    pub fn new(max_frame: usize) -> Self {
        Self {
            acc: Vec::new(),
            max_frame,
        }
    }

    /// Append decrypted bytes and extract every complete frame.
    ///
    /// Frames come out in order; the undelimited tail stays buffered for the
    /// next push. A frame (or tail) growing past the cap is
    /// [`CodecError::FrameTooLarge`]; frame bytes that are not UTF-8 are
    /// [`CodecError::InvalidUtf8`]. Both are protocol violations and the
    /// connection owning this codec is expected to close.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, CodecError> {
        self.acc.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(at) = find_delimiter(&self.acc) {
            if at > self.max_frame {
                return Err(CodecError::FrameTooLarge {
                    size: at,
                    cap: self.max_frame,
                });
            }
            let rest = self.acc.split_off(at + FRAME_DELIMITER.len());
            self.acc.truncate(at);
            let frame = std::mem::replace(&mut self.acc, rest);
            let text = String::from_utf8(frame).map_err(|_| CodecError::InvalidUtf8)?;
            frames.push(text);
        }

        if self.acc.len() > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                size: self.acc.len(),
                cap: self.max_frame,
            });
        }
        Ok(frames)
    }

    /// Encode one message for the wire: payload followed by the delimiter.
    pub fn encode(msg: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(msg.len() + FRAME_DELIMITER.len());
        out.extend_from_slice(msg.as_bytes());
        out.extend_from_slice(FRAME_DELIMITER);
        out
    }

    /// Bytes accumulated but not yet delimited.
    pub fn pending(&self) -> &[u8] {
        &self.acc
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}
