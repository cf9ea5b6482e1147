//! Append-only byte sink used by the encoder.

/// Append-only output buffer with a length counter.
///
/// Offsets returned by [`write`](Writer::write) remain valid for the life of
/// the writer; the underlying bytes may move on reallocation, so callers
/// must not retain references across writes.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes`, returning the offset where they begin.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(bytes);
        offset
    }

    /// Current stream length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check whether nothing has been written yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard all written bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// View the written bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer, yielding the written bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
