//! Owned byte buffers backed by the process heap
//!
//! `HeapBuf` is the RAII face of the allocator: a fixed-capacity byte region
//! allocated from [`Heap::global`] and returned to it on drop. The network
//! layer uses these for every I/O payload.

use std::ptr::NonNull;

use super::block::AllocSite;
use super::heap::Heap;
use crate::error::Result;

pub struct HeapBuf {
    ptr: NonNull<u8>,
    cap: usize,
}

// The buffer exclusively owns its heap block, and the global heap
// serializes all operations behind its own lock.
unsafe impl Send for HeapBuf {}
unsafe impl Sync for HeapBuf {}

impl HeapBuf {
    /// Allocate a zeroed buffer of `cap` bytes from the process heap.
    pub fn with_capacity(cap: usize, site: AllocSite) -> Result<HeapBuf> {
        let ptr = Heap::global().calloc(cap, site)?;
        Ok(HeapBuf { ptr, cap })
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.cap) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }
}

impl Drop for HeapBuf {
    fn drop(&mut self) {
        Heap::global().free(self.ptr.as_ptr());
    }
}

impl std::fmt::Debug for HeapBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuf").field("cap", &self.cap).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_site;

    #[test]
    fn test_heap_buf_round_trip() {
        let mut buf = HeapBuf::with_capacity(300, alloc_site!()).unwrap();
        assert_eq!(buf.capacity(), 300);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice()[299] = 7;
        assert_eq!(buf.as_slice()[299], 7);
        drop(buf);
        // The global heap stays coherent after the round trip.
        Heap::global().check_state().unwrap();
    }
}
