//! Growable byte buffer with position/limit cursor semantics.
//!
//! Sockets fill these buffers and the session engine drains them (and vice
//! versa), so the cursor discipline matters: a buffer is either being written
//! (`position` = next write index, `limit` = capacity) or being read
//! (`position` = next read index, `limit` = end of valid data). `flip`
//! switches write to read, `compact` switches back while retaining unread
//! bytes, `grow` reallocates without ever dropping pending data.

use std::fmt;
use std::io::{self, Read, Write};

use crate::DEFAULT_MAX_BUFFER;
use crate::error::BufferError;

/// Cursor-managed byte buffer used between sockets and the session engine.
pub struct ByteBuffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
    max_capacity: usize,
}

impl ByteBuffer {
    /// Create a buffer with an initial capacity and a hard growth cap.
    ///
    /// The buffer starts in write mode: `position = 0`, `limit = capacity`.
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.min(max_capacity);
        Self {
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
            max_capacity,
        }
    }

    /// Create a buffer with the default growth cap.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, DEFAULT_MAX_BUFFER)
    }

    /// Total allocated capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Hard cap that `grow` will never exceed.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Current limit (capacity in write mode, end of data in read mode).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit: writable space in write mode,
    /// unread bytes in read mode.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Whether any bytes remain between position and limit.
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Copy `src` into the buffer at the current position.
    ///
    /// Fails with [`BufferError::Overflow`] when `src` does not fit; the
    /// caller decides whether to `grow` and retry. Never reallocates
    /// implicitly.
    pub fn put(&mut self, src: &[u8]) -> Result<(), BufferError> {
        let remaining = self.remaining();
        if src.len() > remaining {
            return Err(BufferError::Overflow {
                needed: src.len(),
                remaining,
            });
        }
        self.data[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
        Ok(())
    }

    /// Switch from write mode to read mode: limit becomes the write
    /// position, position resets to zero.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Retain unread bytes and reopen the rest of the buffer for writing.
    ///
    /// Unread bytes move to offset zero, position lands after them, and the
    /// limit returns to the full capacity.
    pub fn compact(&mut self) {
        let unread = self.limit - self.position;
        self.data.copy_within(self.position..self.limit, 0);
        self.position = unread;
        self.limit = self.data.len();
    }

    /// Reset both cursors, discarding any content. Capacity is untouched.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// The readable region, `position..limit`. Meaningful in read mode.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Consume `n` bytes of the readable region.
    pub fn advance(&mut self, n: usize) -> Result<(), BufferError> {
        let available = self.remaining();
        if n > available {
            return Err(BufferError::Underflow {
                needed: n,
                available,
            });
        }
        self.position += n;
        Ok(())
    }

    /// Grow to at least `target` bytes, doubling when that is larger.
    ///
    /// All bytes up to the old capacity and both cursors are preserved; a
    /// write-mode limit (equal to the old capacity) extends to the new
    /// capacity so the fresh space is reachable. Growth past `max_capacity`
    /// is [`BufferError::CapacityExceeded`] and leaves the buffer untouched.
    pub fn grow(&mut self, target: usize) -> Result<(), BufferError> {
        let current = self.data.len();
        if target <= current {
            return Ok(());
        }
        if target > self.max_capacity {
            return Err(BufferError::CapacityExceeded {
                requested: target,
                cap: self.max_capacity,
            });
        }
        let new_cap = target.max(current.saturating_mul(2)).min(self.max_capacity);

        let mut next = vec![0; new_cap];
        next[..current].copy_from_slice(&self.data);
        self.data = next;
        if self.limit == current {
            self.limit = new_cap;
        }
        Ok(())
    }

    /// Read once from `src` into the writable region, advancing the position
    /// by the bytes read.
    ///
    /// Returns the byte count from the underlying `read`. A zero return with
    /// writable space available means the source hit EOF; callers must
    /// ensure space (compact/grow) before calling to keep that signal
    /// unambiguous. `WouldBlock` propagates untranslated.
    pub fn fill_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let n = src.read(&mut self.data[self.position..self.limit])?;
        self.position += n;
        Ok(n)
    }

    /// Write once from the readable region into `dst`, advancing the
    /// position by the bytes accepted.
    ///
    /// Short writes are normal on non-blocking sockets; the leftover stays
    /// readable. `WouldBlock` propagates untranslated.
    pub fn drain_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<usize> {
        let n = dst.write(&self.data[self.position..self.limit])?;
        self.position += n;
        Ok(n)
    }
}

// Buffers carry plaintext and key-derived material; Debug shows cursors only.
impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.data.len())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}
