//! Per-connection send buffer.
//!
//! Bounded staging area between `write` (enqueue) and the socket. Enqueued
//! bytes are always copied in, so callers may reuse their own buffers right
//! after a successful write.

use crate::error::{Status, TransportError};
use bytes::{Buf, BytesMut};

/// Fixed-capacity byte queue drained in FIFO order.
#[derive(Debug)]
pub struct SendBuffer {
    data: BytesMut,
    capacity: usize,
}

impl SendBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a copy of `bytes`.
    ///
    /// All-or-nothing: returns [`TransportError::OutOfMemory`] and leaves the
    /// buffer unchanged when `bytes` does not fit.
    pub fn push(&mut self, bytes: &[u8]) -> Status {
        if bytes.len() > self.available() {
            return Err(TransportError::OutOfMemory);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Bytes not yet handed to the socket.
    pub fn pending(&self) -> &[u8] {
        &self.data
    }

    /// Drop `n` bytes from the front after they were written out.
    pub fn consume(&mut self, n: usize) {
        self.data.advance(n.min(self.data.len()));
    }

    /// Free space left.
    pub fn available(&self) -> usize {
        self.capacity - self.data.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
