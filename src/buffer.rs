//! Owned transmit and receive byte arenas.
//!
//! [`TxBuffer`] is a linear append-only writer over a fixed-capacity
//! arena; running out of room is a [`MeshError::Resource`]. [`RxBuffer`]
//! is a cursor over a received arena that never reads past the end of
//! data; underrun is a [`MeshError::Protocol`].
//!
//! The two views convert into each other by value, transferring
//! ownership of the arena. There is never a moment where both views
//! alias the same storage.

use crate::error::MeshError;

/// Linear append-only writer over a fixed-capacity owned arena.
#[derive(Debug)]
pub struct TxBuffer {
    storage: Vec<u8>,
    capacity: usize,
}

impl TxBuffer {
    /// Create a transmit buffer with a fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append bytes. Fails with `Resource` if the arena cannot hold them.
    pub fn append(&mut self, data: &[u8]) -> Result<(), MeshError> {
        if self.storage.len() + data.len() > self.capacity {
            return Err(MeshError::Resource);
        }
        self.storage.extend_from_slice(data);
        Ok(())
    }

    /// Bytes written so far.
    pub fn used(&self) -> usize {
        self.storage.len()
    }

    /// Space left in the arena.
    pub fn space(&self) -> usize {
        self.capacity - self.storage.len()
    }

    /// View the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage
    }

    /// Convert into a receive view, transferring ownership of the arena.
    pub fn into_rx(self) -> RxBuffer {
        RxBuffer {
            storage: self.storage,
            pos: 0,
        }
    }

    /// Take the written bytes out of the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.storage
    }
}

/// Cursor over a received arena. Reads never pass the end of data.
#[derive(Debug)]
pub struct RxBuffer {
    storage: Vec<u8>,
    pos: usize,
}

impl RxBuffer {
    /// Wrap received bytes for reading.
    pub fn new(storage: Vec<u8>) -> Self {
        Self { storage, pos: 0 }
    }

    /// Bytes remaining between the cursor and end of data.
    pub fn avail(&self) -> usize {
        self.storage.len() - self.pos
    }

    /// Read exactly `len` bytes, advancing the cursor.
    pub fn read(&mut self, len: usize) -> Result<&[u8], MeshError> {
        if self.avail() < len {
            return Err(MeshError::Protocol(format!(
                "short read: wanted {} bytes, {} available",
                len,
                self.avail()
            )));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.storage[start..self.pos])
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, MeshError> {
        Ok(self.read(1)?[0])
    }

    /// All bytes from the cursor to end of data, consuming the view.
    pub fn remaining(mut self) -> Vec<u8> {
        self.storage.split_off(self.pos)
    }

    /// Convert back into a transmit view, transferring ownership of the
    /// arena. The write position resumes at end of data.
    pub fn into_tx(self, capacity: usize) -> TxBuffer {
        let capacity = capacity.max(self.storage.len());
        TxBuffer {
            storage: self.storage,
            capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_within_capacity() {
        let mut tx = TxBuffer::new(8);
        tx.append(b"abcd").unwrap();
        assert_eq!(tx.used(), 4);
        assert_eq!(tx.space(), 4);
        tx.append(b"efgh").unwrap();
        assert_eq!(tx.space(), 0);
    }

    #[test]
    fn overflow_is_resource_error() {
        let mut tx = TxBuffer::new(4);
        tx.append(b"abc").unwrap();
        assert_eq!(tx.append(b"de"), Err(MeshError::Resource));
        // Failed append leaves the buffer untouched.
        assert_eq!(tx.as_bytes(), b"abc");
    }

    #[test]
    fn underrun_is_protocol_error() {
        let mut rx = RxBuffer::new(b"abc".to_vec());
        assert_eq!(rx.read(2).unwrap(), b"ab");
        assert!(matches!(rx.read(2), Err(MeshError::Protocol(_))));
        // Failed read leaves the cursor in place.
        assert_eq!(rx.read(1).unwrap(), b"c");
    }

    #[test]
    fn conversion_transfers_arena() {
        let mut tx = TxBuffer::new(16);
        tx.append(b"payload").unwrap();
        let mut rx = tx.into_rx();
        assert_eq!(rx.avail(), 7);
        assert_eq!(rx.read(7).unwrap(), b"payload");

        let rx = RxBuffer::new(b"echo".to_vec());
        let mut tx = rx.into_tx(16);
        tx.append(b"-back").unwrap();
        assert_eq!(tx.as_bytes(), b"echo-back");
    }
}
