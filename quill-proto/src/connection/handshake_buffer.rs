use bytes::Bytes;

use crate::Error;

/// Append-only byte accumulator with a read cursor
///
/// Holds handshake bytes between TLS and the wire. Bytes before the cursor have been drained;
/// they are discarded once the buffer runs dry, but the cursor keeps counting so that it doubles
/// as the stream offset of the next byte to drain.
#[derive(Debug)]
pub(super) struct HandshakeBuffer {
    data: Vec<u8>,
    /// Index into `data` of the next byte to drain
    read: usize,
    /// Total bytes drained before `data[0]`
    base: u64,
    limit: usize,
}

impl HandshakeBuffer {
    pub(super) fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            read: 0,
            base: 0,
            limit,
        }
    }

    /// Queue `bytes`, failing if that would hold more than the configured limit
    pub(super) fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.pending() + bytes.len() > self.limit {
            return Err(Error::Proto);
        }
        if self.read > 0 {
            self.data.drain(..self.read);
            self.base += self.read as u64;
            self.read = 0;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Take up to `max_len` bytes from the cursor onwards
    pub(super) fn drain(&mut self, max_len: usize) -> Bytes {
        let end = self.read + max_len.min(self.pending());
        let out = Bytes::copy_from_slice(&self.data[self.read..end]);
        self.read = end;
        if self.read == self.data.len() {
            self.base += self.read as u64;
            self.data.clear();
            self.read = 0;
        }
        out
    }

    /// Stream offset of the next byte `drain` will return
    pub(super) fn offset(&self) -> u64 {
        self.base + self.read as u64
    }

    /// Stream offset one past the last byte appended
    pub(super) fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub(super) fn pending(&self) -> usize {
        self.data.len() - self.read
    }

    pub(super) fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}
