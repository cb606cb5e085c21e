//! I/O buffers
//!
//! The unit of data exchange with the reactor: a heap-backed payload region,
//! a valid-byte count, a write cursor for partial sends, and the terminal
//! result of the operation that filled or drained it. Buffers are owned
//! values: a queue owns parked buffers and events hand them back to the
//! caller, so every exit path releases them by construction.

use std::net::SocketAddrV4;

use crate::error::{Error, Result};
use crate::mem::{AllocSite, HeapBuf};

/// The operation a buffer or timeout is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Connect,
    Read,
    Write,
}

#[derive(Debug)]
pub struct IoBuffer {
    data: HeapBuf,
    /// Bytes of real payload, always <= capacity.
    valid: usize,
    /// Offset of the first unsent byte during a write.
    start_write: usize,
    /// Terminal error of the operation this buffer carried, if any.
    err: Option<Error>,
    /// Datagram source (reads) or destination (writes) for UDP sockets.
    peer: Option<SocketAddrV4>,
}

impl IoBuffer {
    /// Allocate a buffer of `capacity` bytes from the process heap.
    pub fn with_capacity(capacity: usize, site: AllocSite) -> Result<IoBuffer> {
        Ok(IoBuffer {
            data: HeapBuf::with_capacity(capacity, site)?,
            valid: 0,
            start_write: 0,
            err: None,
            peer: None,
        })
    }

    /// Wrap `payload` for a write: the bytes are copied into a fresh buffer
    /// and `valid` covers all of them.
    pub fn from_payload(payload: &[u8], site: AllocSite) -> Result<IoBuffer> {
        let mut buffer = IoBuffer::with_capacity(payload.len(), site)?;
        buffer.data.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        buffer.valid = payload.len();
        Ok(buffer)
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// The valid payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_slice()[..self.valid]
    }

    /// The whole payload region, for filling.
    pub fn space_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    pub fn valid_bytes(&self) -> usize {
        self.valid
    }

    pub fn set_valid(&mut self, valid: usize) {
        debug_assert!(valid <= self.capacity());
        self.valid = valid;
    }

    pub(crate) fn start_write(&self) -> usize {
        self.start_write
    }

    pub(crate) fn advance_write(&mut self, sent: usize) {
        self.start_write += sent;
    }

    pub(crate) fn write_finished(&self) -> bool {
        self.start_write >= self.valid
    }

    /// The terminal outcome: the valid byte count, or the error that ended
    /// the operation.
    pub fn result(&self) -> Result<usize> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.valid),
        }
    }

    pub fn error(&self) -> Option<Error> {
        self.err
    }

    pub(crate) fn set_error(&mut self, err: Error) {
        self.err = Some(err);
    }

    /// Datagram peer: the sender of a UDP read, or the destination to set
    /// before a UDP write.
    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: SocketAddrV4) {
        self.peer = Some(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_site;

    #[test]
    fn test_buffer_fill_and_result() {
        let mut buffer = IoBuffer::with_capacity(64, alloc_site!()).unwrap();
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.valid_bytes(), 0);
        assert_eq!(buffer.result(), Ok(0));

        buffer.space_mut()[..5].copy_from_slice(b"hello");
        buffer.set_valid(5);
        assert_eq!(buffer.as_slice(), b"hello");
        assert_eq!(buffer.result(), Ok(5));

        buffer.set_error(Error::EndOfStream);
        assert_eq!(buffer.result(), Err(Error::EndOfStream));
    }

    #[test]
    fn test_write_cursor() {
        let mut buffer = IoBuffer::from_payload(b"0123456789", alloc_site!()).unwrap();
        assert_eq!(buffer.valid_bytes(), 10);
        assert!(!buffer.write_finished());
        buffer.advance_write(4);
        assert_eq!(buffer.start_write(), 4);
        buffer.advance_write(6);
        assert!(buffer.write_finished());
    }
}
