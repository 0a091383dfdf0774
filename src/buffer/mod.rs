//! Growable receive and offset-tracked send buffers.
//!
//! Every connection owns one [`InputBuffer`] for its lifetime; an
//! [`OutputBuffer`] is created per outbound message and discarded once
//! [`OutputBuffer::finished`] reports true.
//!
//! The input buffer grows geometrically up to a hard cap. Once the cap is
//! reached growth is refused: a read can then fill the remaining tail but
//! never corrupt already-buffered bytes, and the worker decides what to do
//! with a saturated connection.

use bytes::Bytes;

/// Initial capacity of a fresh [`InputBuffer`].
pub const INITIAL_CAPACITY: usize = 10 * 1024;

/// Hard upper bound on [`InputBuffer`] capacity.
pub const MAX_CAPACITY: usize = 1024 * 1024;

/// Grow before reading whenever the free tail falls under this mark.
const LOW_WATER: usize = 100;

/// Growable receive buffer for one connection.
///
/// Invariant: `len() <= capacity() <= MAX_CAPACITY` at all times.
/// Mutated only by the worker thread that owns the connection.
#[derive(Debug)]
pub struct InputBuffer {
    buf: Vec<u8>,
    size: usize,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Creates a buffer with the given initial capacity, clamped to
    /// [`MAX_CAPACITY`].
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        Self { buf: vec![0; capacity], size: 0 }
    }

    /// Number of unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current capacity. Grows on demand, never shrinks.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The unread byte span, in arrival order.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// True when the buffer sits at the capacity cap with no free tail.
    /// A saturated buffer cannot make progress until bytes are consumed.
    pub fn is_saturated(&self) -> bool {
        self.size == self.buf.len() && self.buf.len() >= MAX_CAPACITY
    }

    /// Returns the writable free tail, growing first if it fell under the
    /// low-water mark. The returned slice is empty once the buffer is
    /// saturated at the cap.
    pub fn writable_tail(&mut self) -> &mut [u8] {
        if self.buf.len() - self.size < LOW_WATER {
            self.grow();
        }
        &mut self.buf[self.size..]
    }

    /// Records `n` bytes written into the free tail by a transport read.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.size + n <= self.buf.len());
        self.size = (self.size + n).min(self.buf.len());
    }

    /// Removes the first `n` bytes and shifts the unread remainder to the
    /// front, preserving order. `n` larger than the unread length clears
    /// the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.size);
        if n == 0 {
            return;
        }
        self.buf.copy_within(n..self.size, 0);
        self.size -= n;
    }

    /// Drops all unread bytes without releasing capacity.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// Doubles capacity, clamped at [`MAX_CAPACITY`]. Refusing to grow past
    /// the cap leaves size, capacity and content untouched.
    fn grow(&mut self) {
        let new_capacity = (self.buf.len() * 2).min(MAX_CAPACITY);
        if new_capacity > self.buf.len() {
            self.buf.resize(new_capacity, 0);
        }
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound payload plus a monotonically advancing send offset.
///
/// `finished() ⇔ offset == payload.len()`. A transport write advances the
/// offset by however many bytes the peer accepted; advancing past the end
/// clamps, so writes after completion are no-ops.
#[derive(Debug)]
pub struct OutputBuffer {
    payload: Bytes,
    offset: usize,
}

impl OutputBuffer {
    pub fn new<B: Into<Bytes>>(payload: B) -> Self {
        Self { payload: payload.into(), offset: 0 }
    }

    /// The not-yet-sent suffix of the payload.
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.offset..]
    }

    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.payload.len());
    }

    pub fn finished(&self) -> bool {
        self.offset == self.payload.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
