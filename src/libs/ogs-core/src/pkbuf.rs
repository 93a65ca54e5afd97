//! Packet buffer with reserved headroom
//!
//! ```text
//! |<-- headroom -->|<-- data (len) -->|<-- tailroom -->|
//! 0                data               tail             capacity
//! ```
//!
//! Bytes pulled off the front stay in the headroom, so a layer that
//! strips a header can still read it back (`headroom_bytes`) without a
//! second copy.

/// Owned packet buffer
#[derive(Clone, PartialEq, Eq)]
pub struct OgsPkbuf {
    buffer: Vec<u8>,
    /// Start of data
    data: usize,
    /// End of data
    tail: usize,
}

impl OgsPkbuf {
    /// Create an empty buffer able to hold `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size],
            data: 0,
            tail: 0,
        }
    }

    /// Allocate a buffer with `headroom` reserved in front of a copy of `payload`
    pub fn alloc(headroom: usize, payload: &[u8]) -> Self {
        let mut pkbuf = Self::new(headroom + payload.len());
        pkbuf.reserve(headroom);
        pkbuf.put_data(payload);
        pkbuf
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.data
    }

    /// Reserve headroom. Only valid on an empty buffer.
    fn reserve(&mut self, len: usize) {
        debug_assert!(self.data == self.tail, "reserve on non-empty pkbuf");
        let len = len.min(self.buffer.len());
        self.data = len;
        self.tail = len;
    }

    /// Append `data`, growing the buffer if the tailroom is short
    fn put_data(&mut self, data: &[u8]) {
        let end = self.tail + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.tail..end].copy_from_slice(data);
        self.tail = end;
    }

    /// Remove `len` bytes from the front, returning them
    pub fn pull(&mut self, len: usize) -> Option<&[u8]> {
        if len > self.len() {
            return None;
        }
        let start = self.data;
        self.data += len;
        Some(&self.buffer[start..self.data])
    }

    /// The `len` headroom bytes right before the data
    pub fn headroom_bytes(&self, len: usize) -> Option<&[u8]> {
        if len > self.data {
            return None;
        }
        Some(&self.buffer[self.data - len..self.data])
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.data..self.tail]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail == self.data
    }
}

impl Default for OgsPkbuf {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for OgsPkbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OgsPkbuf")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .finish()
    }
}
