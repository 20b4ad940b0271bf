//! Bounded tail buffer.

use std::collections::VecDeque;
use std::io::{self, Write};

/// Sink that keeps only the most recent `capacity` bytes written to it.
///
/// Writes never fail; older bytes are discarded as newer ones arrive, so the
/// retained tail does not depend on how writes are chunked.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl TailBuffer {
    /// Creates an empty buffer retaining at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of bytes retained.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Copies out the retained bytes, oldest first.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        let (head, tail) = self.buf.as_slices();
        [head, tail].concat()
    }

    /// Consumes the buffer, returning the retained bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        Vec::from(self.buf)
    }
}

impl Write for TailBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.capacity == 0 {
            return Ok(data.len());
        }

        let keep = &data[data.len().saturating_sub(self.capacity)..];
        let overflow = (self.buf.len() + keep.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(keep);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
