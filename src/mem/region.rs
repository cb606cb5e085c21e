//! Base regions
//!
//! The heap grows by acquiring page-aligned spans from the OS. Each span
//! starts with a region header recording its payload size and the next
//! region; blocks never straddle regions, so coalescing stops at region
//! boundaries.

use std::ptr::NonNull;

use super::block::{ALIGN, BlockHeader, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::platform;

pub(crate) struct RegionHeader {
    /// Bytes usable after this header (block headers + payloads).
    pub bytes_after_header: usize,
    pub next: *mut RegionHeader,
}

pub(crate) const REGION_HEADER_SIZE: usize =
    (std::mem::size_of::<RegionHeader>() + ALIGN - 1) & !(ALIGN - 1);

/// Singly-linked list of base regions, newest first.
pub(crate) struct RegionList {
    head: *mut RegionHeader,
}

impl RegionList {
    pub fn new() -> RegionList {
        RegionList { head: std::ptr::null_mut() }
    }

    /// Map a new region of `bytes` total and link it in. Returns the address
    /// of the first block header slot and the bytes available from there.
    pub fn grow(&mut self, bytes: usize) -> Result<(*mut BlockHeader, usize)> {
        let mapping = platform::map_region(bytes).map_err(|_| Error::OutOfMemory)?;
        let region = mapping.as_ptr().cast::<RegionHeader>();
        unsafe {
            region.write(RegionHeader {
                bytes_after_header: bytes - REGION_HEADER_SIZE,
                next: self.head,
            });
            self.head = region;
            let first = mapping.as_ptr().add(REGION_HEADER_SIZE).cast::<BlockHeader>();
            Ok((first, (*region).bytes_after_header))
        }
    }

    /// The region whose usable span contains `ptr`, if any.
    pub fn find(&self, ptr: *const u8) -> Option<*mut RegionHeader> {
        let mut region = self.head;
        while !region.is_null() {
            unsafe {
                let start = region.cast::<u8>().add(REGION_HEADER_SIZE).cast_const();
                let end = start.add((*region).bytes_after_header);
                if ptr >= start && ptr <= end {
                    return Some(region);
                }
                region = (*region).next;
            }
        }
        None
    }

    pub fn iter(&self) -> RegionIter {
        RegionIter { cursor: self.head }
    }

    /// Unmap every region. Called from `Heap::drop`; nothing may reference
    /// heap memory afterwards.
    pub unsafe fn release_all(&mut self) {
        let mut region = self.head;
        self.head = std::ptr::null_mut();
        while !region.is_null() {
            unsafe {
                let next = (*region).next;
                let bytes = REGION_HEADER_SIZE + (*region).bytes_after_header;
                platform::unmap_region(NonNull::new_unchecked(region.cast::<u8>()), bytes);
                region = next;
            }
        }
    }
}

pub(crate) struct RegionIter {
    cursor: *mut RegionHeader,
}

impl Iterator for RegionIter {
    type Item = *mut RegionHeader;

    fn next(&mut self) -> Option<*mut RegionHeader> {
        if self.cursor.is_null() {
            return None;
        }
        let current = self.cursor;
        self.cursor = unsafe { (*current).next };
        Some(current)
    }
}

/// Span of a region's usable bytes.
///
/// # Safety
/// `region` must be a live region header.
pub(crate) unsafe fn region_span(region: *mut RegionHeader) -> (*mut u8, *mut u8) {
    unsafe {
        let start = region.cast::<u8>().add(REGION_HEADER_SIZE);
        let end = start.add((*region).bytes_after_header);
        (start, end)
    }
}

/// The first block header of a region.
///
/// # Safety
/// `region` must be a live region header with at least one block.
pub(crate) unsafe fn first_block(region: *mut RegionHeader) -> *mut BlockHeader {
    unsafe { region.cast::<u8>().add(REGION_HEADER_SIZE).cast::<BlockHeader>() }
}

const _: () = assert!(REGION_HEADER_SIZE % ALIGN == 0);
const _: () = assert!(HEADER_SIZE % ALIGN == 0);
