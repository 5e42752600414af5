//! Outgoing staging buffer: holds application bytes buffered ahead of a
//! flush, kept separate from the write-backlog.
//!
//! The backlog (owned by [`crate::connection::Connection`]) holds
//! already-wrapped, kernel-refused bytes. This buffer holds un-wrapped
//! application bytes waiting for the next `flush`. For plaintext connections
//! `wrap` is the identity function, so the two concerns nearly collapse into
//! one; for TLS the distinction matters because `wrap()` batches several
//! `write_queue` calls into fewer TLS records.

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

/// A single-writer-at-a-time byte accumulator, flipped to an owned [`Bytes`]
/// on `take`.
pub struct StagingBuffer {
    buf: Mutex<BytesMut>,
}

impl StagingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(BytesMut::with_capacity(capacity)),
        }
    }

    pub fn queue(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.buf.lock().expect("staging buffer poisoned").extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().expect("staging buffer poisoned").is_empty()
    }

    /// Drains everything queued so far into an owned, empty-if-nothing
    /// [`Bytes`]. The underlying `BytesMut` capacity is retained so repeated
    /// small writes don't repeatedly reallocate.
    pub fn take(&self) -> Bytes {
        let mut guard = self.buf.lock().expect("staging buffer poisoned");
        if guard.is_empty() {
            return Bytes::new();
        }
        std::mem::replace(&mut *guard, BytesMut::new()).freeze()
    }
}
