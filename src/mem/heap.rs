//! The heap allocator
//!
//! A general-purpose coalescing free-list heap. Allocation walks power-of-two
//! size classes first-fit and splits what it finds; free coalesces with both
//! neighbours. Hot sizes bypass all of that: freed blocks up to 256 bytes
//! park on a per-exact-size cache whose depth tunes itself to the workload.
//!
//! The pointer-threaded block machinery is confined to this module and its
//! siblings; the public surface validates every pointer against the region
//! list before touching a header, so a stray pointer is rejected instead of
//! dereferenced.

use std::fmt::Write as _;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

use super::block::{
    ALIGN, ALLOC_FILL, AllocSite, BlockFlags, BlockHeader, FOOTER_MAGIC, FREE_FILL,
    FREE_LINKS_SIZE, HEADER_MAGIC, HEADER_SIZE, LOG_MAX_BLOCK_SIZE, LOG_MIN_BLOCK_SIZE,
    MAX_BLOCK_SIZE, MAX_CACHEABLE_SIZE, MIN_BLOCK_SIZE, REGION_GROW_SIZE, align_up, footer_ok,
    header_of, links_of, payload_of, size_class, write_footer,
};
use super::cache::SizeCache;
use super::region::{RegionHeader, RegionList, first_block, region_span};
use crate::error::{Error, Result};
use crate::platform;
use bitflags::bitflags;

const FOOTER_SIZE: usize = std::mem::size_of::<u32>();

/// Whether footers, fill patterns and eager validation are active.
fn debug_checks() -> bool {
    cfg!(debug_assertions)
}

bitflags! {
    /// Options for [`Heap::print_allocations`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrintFlags: u32 {
        /// One line per live block instead of one line per call site.
        const VERBOSE = 1 << 0;
        /// Include blocks marked by `suppress_leak`/`mark_allocations`.
        const INCLUDE_SUPPRESSED = 1 << 1;
    }
}

/// Aggregate heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Usable bytes acquired from the OS for the general heap.
    pub total_region_bytes: usize,
    /// Sum of user payload sizes of live blocks.
    pub live_bytes: usize,
    /// Number of live blocks.
    pub live_blocks: usize,
    /// Bytes in live page-aligned spans.
    pub page_bytes: usize,
    /// Number of live page-aligned spans.
    pub page_spans: usize,
}

/// A page-aligned span serviced directly by the OS mapping layer.
struct PageSpan {
    ptr: NonNull<u8>,
    bytes: usize,
    site: AllocSite,
    leak_ignored: bool,
}

struct HeapInner {
    regions: RegionList,
    /// One free list per power-of-two size class; only the slots between the
    /// minimum and maximum class are ever populated.
    free_lists: [*mut BlockHeader; LOG_MAX_BLOCK_SIZE + 1],
    cache: SizeCache,
    page_spans: Vec<PageSpan>,
    stats: HeapStats,
}

// The raw pointers all target memory owned by this value's region list.
unsafe impl Send for HeapInner {}

/// The heap. One process-wide instance is available through
/// [`Heap::global`]; independent instances can be created freely and do not
/// share any state.
pub struct Heap {
    inner: Mutex<HeapInner>,
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            inner: Mutex::new(HeapInner {
                regions: RegionList::new(),
                free_lists: [std::ptr::null_mut(); LOG_MAX_BLOCK_SIZE + 1],
                cache: SizeCache::new(),
                page_spans: Vec::new(),
                stats: HeapStats::default(),
            }),
        }
    }

    /// The process-wide heap.
    pub fn global() -> &'static Heap {
        static GLOBAL: OnceLock<Heap> = OnceLock::new();
        GLOBAL.get_or_init(Heap::new)
    }

    /// Allocate at least `bytes` of payload, aligned for any primitive type.
    pub fn alloc(&self, bytes: usize, site: AllocSite) -> Result<NonNull<u8>> {
        let mut inner = platform::lock(&self.inner);
        unsafe { inner.alloc(bytes, site) }
    }

    /// Allocate and zero-fill.
    pub fn calloc(&self, bytes: usize, site: AllocSite) -> Result<NonNull<u8>> {
        let mut inner = platform::lock(&self.inner);
        let ptr = unsafe { inner.alloc(bytes, site) }?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Ok(ptr)
    }

    /// Release a block. A null pointer is a no-op; a pointer this heap does
    /// not own is rejected and logged.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut inner = platform::lock(&self.inner);
        if let Err(err) = unsafe { inner.free(ptr) } {
            warn!("free rejected pointer {:p}: {}", ptr, err);
        }
    }

    /// Resize a block. `None` behaves as `alloc`; zero bytes behaves as
    /// `free` and returns `None`.
    pub fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        bytes: usize,
    ) -> Result<Option<NonNull<u8>>> {
        let mut inner = platform::lock(&self.inner);
        match ptr {
            None => unsafe { inner.alloc(bytes, AllocSite::UNKNOWN).map(Some) },
            Some(ptr) if bytes == 0 => {
                unsafe { inner.free(ptr.as_ptr()) }?;
                Ok(None)
            }
            Some(ptr) => unsafe { inner.realloc(ptr.as_ptr(), bytes).map(Some) },
        }
    }

    /// Allocate `count` pages whose payload starts on a page boundary.
    ///
    /// Page spans come straight from the OS mapping layer rather than being
    /// carved out of a heap region, so no slack is created on either side.
    pub fn alloc_pages(&self, count: usize, site: AllocSite) -> Result<NonNull<u8>> {
        if count == 0 {
            return Err(Error::InvalidArgument);
        }
        let bytes = count
            .checked_mul(platform::page_size())
            .ok_or(Error::InvalidArgument)?;
        let ptr = platform::map_region(bytes).map_err(|_| Error::OutOfMemory)?;
        let mut inner = platform::lock(&self.inner);
        inner.page_spans.push(PageSpan { ptr, bytes, site, leak_ignored: false });
        inner.stats.page_bytes += bytes;
        inner.stats.page_spans += 1;
        Ok(ptr)
    }

    /// The user payload size recorded for a block, or 0 for a pointer this
    /// heap does not recognize.
    pub fn ptr_size(&self, ptr: *const u8) -> usize {
        let inner = platform::lock(&self.inner);
        unsafe { inner.ptr_size(ptr) }
    }

    /// Exclude one block from leak reports.
    pub fn suppress_leak(&self, ptr: *const u8) {
        let mut inner = platform::lock(&self.inner);
        if let Err(err) = unsafe { inner.set_leak_ignored(ptr) } {
            warn!("suppress_leak rejected pointer {:p}: {}", ptr, err);
        }
    }

    /// Exclude everything currently live from leak reports, so later reports
    /// show only allocations made after this call.
    pub fn mark_allocations(&self) {
        let mut inner = platform::lock(&self.inner);
        unsafe { inner.mark_all() };
    }

    /// Validate a single pointer: header magic, placement inside a region,
    /// chain consistency and footer.
    pub fn check_ptr(&self, ptr: *const u8) -> Result<()> {
        let inner = platform::lock(&self.inner);
        let checked = unsafe { inner.check_ptr(ptr) };
        if let Err(err) = checked {
            warn!("check_ptr failed for {:p}: {}", ptr, err);
            return Err(err);
        }
        Ok(())
    }

    /// Validate the whole heap: every block of every region, every free
    /// list, and the size-class cache.
    pub fn check_state(&self) -> Result<()> {
        let inner = platform::lock(&self.inner);
        let checked = unsafe { inner.check_state() };
        if let Err(err) = checked {
            warn!("heap check_state failed: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Render a leak report into `out`; returns the bytes written.
    pub fn print_allocations(&self, flags: PrintFlags, out: &mut String) -> usize {
        let inner = platform::lock(&self.inner);
        unsafe { inner.print_allocations(flags, out) }
    }

    pub fn stats(&self) -> HeapStats {
        platform::lock(&self.inner).stats
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut inner = platform::lock(&self.inner);
        for span in inner.page_spans.drain(..) {
            unsafe { platform::unmap_region(span.ptr, span.bytes) };
        }
        unsafe { inner.regions.release_all() };
    }
}

impl HeapInner {
    // =========================================================================
    // ALLOCATION
    // =========================================================================

    unsafe fn alloc(&mut self, bytes: usize, site: AllocSite) -> Result<NonNull<u8>> {
        // FAST PATH: a cached block of this exact user size can be recycled
        // without touching the free lists. The slot records misses so its
        // depth adapts to the workload.
        if bytes <= MAX_CACHEABLE_SIZE {
            let sensitivity = self.cache.sensitivity;
            let slot = &mut self.cache.slots[bytes];
            if let Some(header) = slot.pop() {
                unsafe {
                    debug_assert_eq!((*header).size, bytes);
                    return Ok(self.finish_alloc(header, bytes, site));
                }
            }
            slot.note_empty_miss(sensitivity);
        }

        if bytes > MAX_BLOCK_SIZE {
            return Err(Error::InvalidArgument);
        }
        let mut alloc_size = bytes;
        if debug_checks() {
            alloc_size += FOOTER_SIZE;
        }
        alloc_size = align_up(alloc_size.max(MIN_BLOCK_SIZE));
        if alloc_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidArgument);
        }

        let start_class = size_class(alloc_size);
        let mut expanded = false;
        let (header, found_class) = loop {
            if let Some(found) = self.find_fit(alloc_size, start_class) {
                break found;
            }
            // Nothing large enough anywhere: grow once, rescan, then give up.
            if expanded {
                return Err(Error::OutOfMemory);
            }
            self.grow_heap(alloc_size)?;
            expanded = true;
        };

        unsafe {
            self.remove_from_free_list(header, Some(found_class));

            // Break off the tail if it can hold another block.
            let spare = (*header).size - alloc_size;
            if spare >= HEADER_SIZE + MIN_BLOCK_SIZE {
                let upper = payload_of(header).add(alloc_size).cast::<BlockHeader>();
                upper.write(BlockHeader {
                    magic: HEADER_MAGIC,
                    // The tail was patterned while this block sat free.
                    flags: if debug_checks() {
                        BlockFlags::FREE_PATTERN
                    } else {
                        BlockFlags::empty()
                    },
                    size: spare - HEADER_SIZE,
                    prev: header,
                    next: (*header).next,
                    site: AllocSite::UNKNOWN,
                });
                if !(*upper).next.is_null() {
                    (*(*upper).next).prev = upper;
                }
                (*header).next = upper;
                self.add_to_free_list(upper);
            }

            Ok(self.finish_alloc(header, bytes, site))
        }
    }

    /// Stamp an about-to-be-returned block: flags, size, site, footer, fill.
    unsafe fn finish_alloc(
        &mut self,
        header: *mut BlockHeader,
        bytes: usize,
        site: AllocSite,
    ) -> NonNull<u8> {
        unsafe {
            (*header).magic = HEADER_MAGIC;
            (*header).flags = BlockFlags::ALLOCATED;
            (*header).size = bytes;
            (*header).site = site;
            let payload = payload_of(header);
            if debug_checks() {
                (*header).flags.insert(BlockFlags::HAS_FOOTER);
                std::ptr::write_bytes(payload, ALLOC_FILL, bytes);
                write_footer(header);
            }
            self.stats.live_bytes += bytes;
            self.stats.live_blocks += 1;
            NonNull::new_unchecked(payload)
        }
    }

    /// First-fit scan of every size class from `start_class` upward.
    fn find_fit(&self, alloc_size: usize, start_class: usize) -> Option<(*mut BlockHeader, usize)> {
        for class in start_class..=LOG_MAX_BLOCK_SIZE {
            let mut cursor = self.free_lists[class];
            while !cursor.is_null() {
                unsafe {
                    if (*cursor).size >= alloc_size {
                        return Some((cursor, class));
                    }
                    cursor = (*links_of(cursor)).next;
                }
            }
        }
        None
    }

    /// Acquire a new base region big enough for `alloc_size` plus overhead.
    fn grow_heap(&mut self, alloc_size: usize) -> Result<()> {
        let mut grow = REGION_GROW_SIZE;
        let needed = alloc_size + super::region::REGION_HEADER_SIZE + HEADER_SIZE;
        while grow < needed {
            grow <<= 1;
        }
        debug!("growing heap by {} bytes", grow);
        let (header, avail) = self.regions.grow(grow)?;
        unsafe {
            header.write(BlockHeader {
                magic: HEADER_MAGIC,
                flags: BlockFlags::empty(),
                size: avail - HEADER_SIZE,
                prev: std::ptr::null_mut(),
                next: std::ptr::null_mut(),
                site: AllocSite::UNKNOWN,
            });
            if debug_checks() {
                std::ptr::write_bytes(payload_of(header), FREE_FILL, (*header).size);
                (*header).flags.insert(BlockFlags::FREE_PATTERN);
            }
            self.stats.total_region_bytes += avail;
            self.add_to_free_list(header);
        }
        Ok(())
    }

    // =========================================================================
    // FREE
    // =========================================================================

    unsafe fn free(&mut self, ptr: *mut u8) -> Result<()> {
        if ptr as usize & (ALIGN - 1) != 0 {
            return Err(Error::InvalidArgument);
        }

        // Page spans are a separate population keyed by exact start address.
        if let Some(index) = self.page_spans.iter().position(|s| s.ptr.as_ptr() == ptr) {
            let span = self.page_spans.swap_remove(index);
            self.stats.page_bytes -= span.bytes;
            self.stats.page_spans -= 1;
            unsafe { platform::unmap_region(span.ptr, span.bytes) };
            return Ok(());
        }

        // Reject pointers outside every region before reading any header.
        let region = self.regions.find(ptr).ok_or(Error::InvalidArgument)?;
        let header = unsafe { header_of(ptr) };
        unsafe {
            if (*header).magic != HEADER_MAGIC {
                return Err(Error::Corruption("header magic"));
            }
            if !(*header).flags.contains(BlockFlags::ALLOCATED) {
                // Double free or a pointer into a freed block.
                return Err(Error::InvalidArgument);
            }

            let old_size = (*header).size;
            self.stats.live_bytes -= old_size;
            self.stats.live_blocks -= 1;

            // FAST PATH: park the block on its exact-size cache slot. Cached
            // blocks keep their footer and are excluded from coalescing.
            if old_size <= MAX_CACHEABLE_SIZE && self.cache.slots[old_size].has_room() {
                if debug_checks() {
                    std::ptr::write_bytes(ptr, FREE_FILL, old_size);
                    (*header).flags.insert(BlockFlags::FREE_PATTERN);
                }
                (*header).flags.remove(BlockFlags::ALLOCATED);
                (*header).flags.insert(BlockFlags::CACHED);
                self.cache.slots[old_size].push(header);
                return Ok(());
            }

            // A free block owns every byte up to the next header, so extend
            // the recorded size over footer and rounding slack.
            let capacity = self.capacity_of(region, header);
            (*header).size = capacity;
            (*header).flags.remove(BlockFlags::HAS_FOOTER);
            if debug_checks() {
                std::ptr::write_bytes(ptr, FREE_FILL, capacity);
                (*header).flags.insert(BlockFlags::FREE_PATTERN);
            }

            let merged = self.coalesce(header);
            self.add_to_free_list(merged);
        }
        Ok(())
    }

    /// Merge a fully-freed block with its free, non-cached neighbours.
    unsafe fn coalesce(&mut self, header: *mut BlockHeader) -> *mut BlockHeader {
        unsafe {
            let mut current = header;

            let prev = (*current).prev;
            if !prev.is_null() && Self::mergeable(prev) {
                // Pull the neighbour off its free list before its size
                // changes, or it can no longer be found there.
                self.remove_from_free_list(prev, None);
                let prev_patterned = (*prev).flags.contains(BlockFlags::FREE_PATTERN);
                (*prev).flags = BlockFlags::empty();
                (*prev).size += HEADER_SIZE + (*current).size;
                (*prev).next = (*current).next;
                if !(*current).next.is_null() {
                    (*(*current).next).prev = prev;
                }
                if debug_checks() {
                    if !prev_patterned {
                        let fill_at = payload_of(prev).add(FREE_LINKS_SIZE);
                        std::ptr::write_bytes(fill_at, FREE_FILL, (*prev).size - FREE_LINKS_SIZE);
                    }
                    // The stale header is payload now.
                    std::ptr::write_bytes(
                        current.cast::<u8>(),
                        FREE_FILL,
                        HEADER_SIZE + FREE_LINKS_SIZE,
                    );
                    (*prev).flags.insert(BlockFlags::FREE_PATTERN);
                }
                current = prev;
            }

            let next = (*current).next;
            if !next.is_null() && Self::mergeable(next) {
                self.remove_from_free_list(next, None);
                let next_patterned = (*next).flags.contains(BlockFlags::FREE_PATTERN);
                let next_size = (*next).size;
                (*current).size += HEADER_SIZE + next_size;
                (*current).next = (*next).next;
                if !(*next).next.is_null() {
                    (*(*next).next).prev = current;
                }
                if debug_checks() {
                    if !next_patterned && next_size > FREE_LINKS_SIZE {
                        let fill_at = payload_of(next).add(FREE_LINKS_SIZE);
                        std::ptr::write_bytes(fill_at, FREE_FILL, next_size - FREE_LINKS_SIZE);
                    }
                    // Covers the absorbed header and its stale free links.
                    std::ptr::write_bytes(
                        next.cast::<u8>(),
                        FREE_FILL,
                        HEADER_SIZE + FREE_LINKS_SIZE,
                    );
                }
            }

            current
        }
    }

    unsafe fn mergeable(header: *mut BlockHeader) -> bool {
        unsafe {
            !(*header)
                .flags
                .intersects(BlockFlags::ALLOCATED | BlockFlags::CACHED)
        }
    }

    // =========================================================================
    // REALLOC
    // =========================================================================

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>> {
        if ptr as usize & (ALIGN - 1) != 0 {
            return Err(Error::InvalidArgument);
        }
        let region = self.regions.find(ptr).ok_or(Error::InvalidArgument)?;
        let header = unsafe { header_of(ptr) };
        unsafe {
            if (*header).magic != HEADER_MAGIC {
                return Err(Error::Corruption("header magic"));
            }
            if !(*header).flags.contains(BlockFlags::ALLOCATED) {
                return Err(Error::InvalidArgument);
            }

            let mut new_alloc_size = new_size;
            if debug_checks() {
                new_alloc_size += FOOTER_SIZE;
            }
            new_alloc_size = align_up(new_alloc_size.max(MIN_BLOCK_SIZE));
            if new_alloc_size > MAX_BLOCK_SIZE {
                return Err(Error::InvalidArgument);
            }

            let capacity = self.capacity_of(region, header);
            if new_alloc_size <= capacity {
                self.shrink_in_place(header, new_size, new_alloc_size, capacity);
                Ok(NonNull::new_unchecked(ptr))
            } else {
                self.grow_block(header, new_size, new_alloc_size, capacity)
            }
        }
    }

    /// Shrink (or keep) a block within its current capacity, returning the
    /// tail to the free lists when it can stand alone.
    unsafe fn shrink_in_place(
        &mut self,
        header: *mut BlockHeader,
        new_size: usize,
        new_alloc_size: usize,
        capacity: usize,
    ) {
        unsafe {
            let old_size = (*header).size;
            (*header).size = new_size;
            if (*header).flags.contains(BlockFlags::HAS_FOOTER) {
                write_footer(header);
            }

            let spare = capacity - new_alloc_size;
            if spare >= HEADER_SIZE + MIN_BLOCK_SIZE {
                let upper = payload_of(header).add(new_alloc_size).cast::<BlockHeader>();
                upper.write(BlockHeader {
                    magic: HEADER_MAGIC,
                    flags: BlockFlags::empty(),
                    size: spare - HEADER_SIZE,
                    prev: header,
                    next: (*header).next,
                    site: AllocSite::UNKNOWN,
                });
                if !(*upper).next.is_null() {
                    (*(*upper).next).prev = upper;
                }
                (*header).next = upper;
                if debug_checks() {
                    // The tail holds old user data, not pattern bytes.
                    std::ptr::write_bytes(payload_of(upper), FREE_FILL, (*upper).size);
                    (*upper).flags.insert(BlockFlags::FREE_PATTERN);
                }
                // The successor may itself be free; the tail must not stand
                // next to it unmerged.
                let merged = self.coalesce(upper);
                self.add_to_free_list(merged);
            }

            self.stats.live_bytes -= old_size;
            self.stats.live_bytes += new_size;
        }
    }

    /// Grow a block, in place when the successor is free, otherwise by
    /// allocate-copy-free.
    unsafe fn grow_block(
        &mut self,
        header: *mut BlockHeader,
        new_size: usize,
        new_alloc_size: usize,
        capacity: usize,
    ) -> Result<NonNull<u8>> {
        unsafe {
            let old_size = (*header).size;
            let next = (*header).next;

            if !next.is_null() && Self::mergeable(next) {
                let combined = capacity + HEADER_SIZE + (*next).size;
                if combined >= new_alloc_size {
                    self.remove_from_free_list(next, None);
                    (*header).size = new_size;
                    (*header).next = (*next).next;
                    if !(*next).next.is_null() {
                        (*(*next).next).prev = header;
                    }
                    if (*header).flags.contains(BlockFlags::HAS_FOOTER) {
                        write_footer(header);
                    }

                    let spare = combined.saturating_sub(new_alloc_size + HEADER_SIZE);
                    if spare >= MIN_BLOCK_SIZE {
                        let upper =
                            payload_of(header).add(new_alloc_size).cast::<BlockHeader>();
                        upper.write(BlockHeader {
                            magic: HEADER_MAGIC,
                            flags: BlockFlags::empty(),
                            size: spare,
                            prev: header,
                            next: (*header).next,
                            site: AllocSite::UNKNOWN,
                        });
                        if !(*upper).next.is_null() {
                            (*(*upper).next).prev = upper;
                        }
                        (*header).next = upper;
                        if debug_checks() {
                            std::ptr::write_bytes(payload_of(upper), FREE_FILL, (*upper).size);
                            (*upper).flags.insert(BlockFlags::FREE_PATTERN);
                        }
                        self.add_to_free_list(upper);
                    }

                    self.stats.live_bytes -= old_size;
                    self.stats.live_bytes += new_size;
                    return Ok(NonNull::new_unchecked(payload_of(header)));
                }
            }

            // No free successor to absorb: move the payload.
            let site = (*header).site;
            let new_ptr = self.alloc(new_size, site)?;
            std::ptr::copy_nonoverlapping(payload_of(header), new_ptr.as_ptr(), old_size);
            self.free(payload_of(header))?;
            Ok(new_ptr)
        }
    }

    // =========================================================================
    // FREE LISTS
    // =========================================================================

    unsafe fn add_to_free_list(&mut self, header: *mut BlockHeader) {
        unsafe {
            (*header)
                .flags
                .remove(BlockFlags::ALLOCATED | BlockFlags::HAS_FOOTER);
            let class = size_class((*header).size);
            let head = self.free_lists[class];
            let links = links_of(header);
            (*links).next = head;
            (*links).prev = std::ptr::null_mut();
            if !head.is_null() {
                (*links_of(head)).prev = header;
            }
            self.free_lists[class] = header;
        }
    }

    unsafe fn remove_from_free_list(&mut self, header: *mut BlockHeader, class: Option<usize>) {
        unsafe {
            let class = class.unwrap_or_else(|| size_class((*header).size));
            let links = links_of(header);
            let next = (*links).next;
            let prev = (*links).prev;
            if prev.is_null() {
                self.free_lists[class] = next;
            } else {
                (*links_of(prev)).next = next;
            }
            if !next.is_null() {
                (*links_of(next)).prev = prev;
            }
        }
    }

    /// True capacity of a block: all bytes from its payload to the next
    /// header in address order, or to the region end for the last block.
    unsafe fn capacity_of(&self, region: *mut RegionHeader, header: *mut BlockHeader) -> usize {
        unsafe {
            let payload = payload_of(header);
            if !(*header).next.is_null() {
                (*header).next as usize - payload as usize
            } else {
                let (_, end) = region_span(region);
                end as usize - payload as usize
            }
        }
    }

    // =========================================================================
    // VALIDATION AND REPORTS
    // =========================================================================

    unsafe fn ptr_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() || ptr as usize & (ALIGN - 1) != 0 {
            return 0;
        }
        if let Some(span) = self.page_spans.iter().find(|s| s.ptr.as_ptr().cast_const() == ptr) {
            return span.bytes;
        }
        if self.regions.find(ptr).is_none() {
            return 0;
        }
        unsafe {
            let header = header_of(ptr.cast_mut());
            if (*header).magic != HEADER_MAGIC
                || !(*header).flags.contains(BlockFlags::ALLOCATED)
            {
                return 0;
            }
            (*header).size
        }
    }

    unsafe fn set_leak_ignored(&mut self, ptr: *const u8) -> Result<()> {
        if let Some(span) = self.page_spans.iter_mut().find(|s| s.ptr.as_ptr().cast_const() == ptr)
        {
            span.leak_ignored = true;
            return Ok(());
        }
        unsafe {
            self.check_ptr(ptr)?;
            let header = header_of(ptr.cast_mut());
            (*header).flags.insert(BlockFlags::LEAK_IGNORED);
        }
        Ok(())
    }

    unsafe fn mark_all(&mut self) {
        unsafe {
            for region in self.regions.iter() {
                let mut header = first_block(region);
                while !header.is_null() {
                    if (*header).flags.contains(BlockFlags::ALLOCATED) {
                        (*header).flags.insert(BlockFlags::LEAK_IGNORED);
                    }
                    header = (*header).next;
                }
            }
        }
        for span in &mut self.page_spans {
            span.leak_ignored = true;
        }
    }

    unsafe fn check_ptr(&self, ptr: *const u8) -> Result<()> {
        if ptr.is_null() || ptr as usize & (ALIGN - 1) != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.page_spans.iter().any(|s| s.ptr.as_ptr().cast_const() == ptr) {
            return Ok(());
        }
        // Region membership first, so an arbitrary pointer is never
        // dereferenced.
        let region = self.regions.find(ptr).ok_or(Error::InvalidArgument)?;
        unsafe {
            let header = header_of(ptr.cast_mut());
            if (*header).magic != HEADER_MAGIC {
                return Err(Error::Corruption("header magic"));
            }
            if !(*header).flags.contains(BlockFlags::ALLOCATED) {
                return Err(Error::InvalidArgument);
            }

            // Blocks never straddle regions, even adjacent ones.
            let (_, end) = region_span(region);
            let mut block_end = ptr.add((*header).size);
            if (*header).flags.contains(BlockFlags::HAS_FOOTER) {
                block_end = block_end.add(FOOTER_SIZE);
            }
            if block_end > end.cast_const() {
                return Err(Error::Corruption("block spills its region"));
            }

            self.check_chain(header)?;

            if (*header).flags.contains(BlockFlags::HAS_FOOTER) && !footer_ok(header) {
                return Err(Error::Corruption("footer overwritten"));
            }
        }
        Ok(())
    }

    unsafe fn check_chain(&self, header: *mut BlockHeader) -> Result<()> {
        unsafe {
            let next = (*header).next;
            if !next.is_null() {
                if next as usize & (ALIGN - 1) != 0 {
                    return Err(Error::Corruption("misaligned next link"));
                }
                if (*next).prev != header {
                    return Err(Error::Corruption("next block does not link back"));
                }
            }
            let prev = (*header).prev;
            if !prev.is_null() {
                if prev as usize & (ALIGN - 1) != 0 {
                    return Err(Error::Corruption("misaligned prev link"));
                }
                if (*prev).next != header {
                    return Err(Error::Corruption("prev block does not link forward"));
                }
            }
        }
        Ok(())
    }

    unsafe fn check_state(&self) -> Result<()> {
        unsafe {
            for region in self.regions.iter() {
                let (_, end) = region_span(region);
                let mut header = first_block(region);
                let mut prev_was_free = false;
                while !header.is_null() {
                    let payload = payload_of(header);
                    if payload as usize & (ALIGN - 1) != 0 {
                        return Err(Error::Corruption("misaligned block"));
                    }
                    if (*header).magic != HEADER_MAGIC {
                        return Err(Error::Corruption("header magic"));
                    }

                    let flags = (*header).flags;
                    let mut block_end = payload.add((*header).size);
                    if flags.contains(BlockFlags::HAS_FOOTER) {
                        if !flags.intersects(BlockFlags::ALLOCATED | BlockFlags::CACHED) {
                            return Err(Error::Corruption("free block claims a footer"));
                        }
                        block_end = block_end.add(FOOTER_SIZE);
                    }
                    if block_end > end {
                        return Err(Error::Corruption("block spills its region"));
                    }
                    if !(*header).next.is_null() && block_end > (*header).next.cast::<u8>() {
                        return Err(Error::Corruption("block overlaps its successor"));
                    }

                    self.check_chain(header)?;

                    // Adjacent fully-free blocks must have been coalesced.
                    let is_free = !flags.intersects(BlockFlags::ALLOCATED | BlockFlags::CACHED);
                    if is_free && prev_was_free {
                        return Err(Error::Corruption("adjacent free blocks not coalesced"));
                    }
                    prev_was_free = is_free;

                    if flags.contains(BlockFlags::HAS_FOOTER) && !footer_ok(header) {
                        return Err(Error::Corruption("footer overwritten"));
                    }

                    // The fill pattern runs from just past the free links to
                    // the end of the recorded size.
                    if flags.contains(BlockFlags::FREE_PATTERN)
                        && (*header).size > FREE_LINKS_SIZE
                    {
                        let from = payload.add(FREE_LINKS_SIZE);
                        let len = (*header).size - FREE_LINKS_SIZE;
                        for offset in 0..len {
                            if from.add(offset).read() != FREE_FILL {
                                return Err(Error::Corruption("free pattern broken"));
                            }
                        }
                    }

                    header = (*header).next;
                }
            }

            // Free lists: membership and link symmetry.
            for class in LOG_MIN_BLOCK_SIZE..=LOG_MAX_BLOCK_SIZE {
                let mut cursor = self.free_lists[class];
                while !cursor.is_null() {
                    if self.regions.find(cursor.cast::<u8>().cast_const()).is_none() {
                        return Err(Error::Corruption("free entry outside all regions"));
                    }
                    if (*cursor).flags.intersects(BlockFlags::ALLOCATED | BlockFlags::CACHED) {
                        return Err(Error::Corruption("allocated block on a free list"));
                    }
                    let links = links_of(cursor);
                    let next = (*links).next;
                    if !next.is_null() && (*links_of(next)).prev != cursor {
                        return Err(Error::Corruption("free list links broken"));
                    }
                    cursor = next;
                }
            }

            // Cache lists: headers stay intact while parked.
            for slot in &self.cache.slots {
                let mut cursor = slot.head();
                while !cursor.is_null() {
                    if (*cursor).magic != HEADER_MAGIC {
                        return Err(Error::Corruption("cached block header magic"));
                    }
                    if !(*cursor).flags.contains(BlockFlags::CACHED) {
                        return Err(Error::Corruption("uncached block on the size cache"));
                    }
                    cursor = (*links_of(cursor)).next;
                }
            }
        }
        Ok(())
    }

    unsafe fn print_allocations(&self, flags: PrintFlags, out: &mut String) -> usize {
        struct SiteUse {
            site: AllocSite,
            blocks: usize,
            bytes: usize,
        }
        let start_len = out.len();
        let mut sites: Vec<SiteUse> = Vec::new();
        let mut record = |site: AllocSite, size: usize| {
            match sites.iter_mut().find(|s| s.site == site) {
                Some(entry) => {
                    entry.blocks += 1;
                    entry.bytes += size;
                }
                None => sites.push(SiteUse { site, blocks: 1, bytes: size }),
            }
        };

        unsafe {
            for region in self.regions.iter() {
                let mut header = first_block(region);
                while !header.is_null() {
                    let block_flags = (*header).flags;
                    let live = block_flags.contains(BlockFlags::ALLOCATED);
                    let suppressed = block_flags.contains(BlockFlags::LEAK_IGNORED);
                    if live && (!suppressed || flags.contains(PrintFlags::INCLUDE_SUPPRESSED)) {
                        record((*header).site, (*header).size);
                        if flags.contains(PrintFlags::VERBOSE) {
                            let _ = writeln!(
                                out,
                                "  block {:p} {} bytes ({}:{})",
                                payload_of(header),
                                (*header).size,
                                (*header).site.file,
                                (*header).site.line,
                            );
                        }
                    }
                    header = (*header).next;
                }
            }
        }
        for span in &self.page_spans {
            if !span.leak_ignored || flags.contains(PrintFlags::INCLUDE_SUPPRESSED) {
                record(span.site, span.bytes);
                if flags.contains(PrintFlags::VERBOSE) {
                    let _ = writeln!(
                        out,
                        "  pages {:p} {} bytes ({}:{})",
                        span.ptr.as_ptr(),
                        span.bytes,
                        span.site.file,
                        span.site.line,
                    );
                }
            }
        }

        sites.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        for entry in &sites {
            let _ = writeln!(
                out,
                "{}:{} - {} blocks, {} bytes",
                entry.site.file, entry.site.line, entry.blocks, entry.bytes
            );
        }
        out.len() - start_len
    }
}

// Keep the footer constant referenced from release builds too.
const _: () = assert!(FOOTER_MAGIC != HEADER_MAGIC);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_site;

    fn site() -> AllocSite {
        alloc_site!()
    }

    #[test]
    fn test_alloc_free_basics() {
        let heap = Heap::new();
        let ptr = heap.alloc(100, site()).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x42, 100);
            assert_eq!(ptr.as_ptr().add(99).read(), 0x42);
        }
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
        assert_eq!(heap.ptr_size(ptr.as_ptr()), 100);
        assert_eq!(heap.stats().live_blocks, 1);
        assert_eq!(heap.stats().live_bytes, 100);
        heap.check_ptr(ptr.as_ptr()).unwrap();
        heap.check_state().unwrap();

        heap.free(ptr.as_ptr());
        assert_eq!(heap.stats().live_blocks, 0);
        assert_eq!(heap.stats().live_bytes, 0);
        heap.check_state().unwrap();
    }

    #[test]
    fn test_zero_size_alloc() {
        let heap = Heap::new();
        let ptr = heap.alloc(0, site()).unwrap();
        assert_eq!(heap.ptr_size(ptr.as_ptr()), 0);
        heap.free(ptr.as_ptr());
        heap.check_state().unwrap();
    }

    #[test]
    fn test_cache_recycles_exact_size() {
        let heap = Heap::new();
        // Warm the slot so at least one entry fits.
        let a = heap.alloc(48, site()).unwrap();
        heap.free(a.as_ptr());
        let b = heap.alloc(48, site()).unwrap();
        // LIFO: the freed block comes straight back.
        assert_eq!(a, b);
        heap.free(b.as_ptr());
        heap.check_state().unwrap();
    }

    #[test]
    fn test_large_blocks_bypass_cache() {
        let heap = Heap::new();
        let a = heap.alloc(MAX_CACHEABLE_SIZE + 1, site()).unwrap();
        heap.free(a.as_ptr());
        heap.check_state().unwrap();
        assert_eq!(heap.stats().live_blocks, 0);
    }

    #[test]
    fn test_free_null_is_noop() {
        let heap = Heap::new();
        heap.free(std::ptr::null_mut());
        heap.check_state().unwrap();
    }

    #[test]
    fn test_free_rejects_foreign_pointer() {
        let heap = Heap::new();
        let keep = heap.alloc(64, site()).unwrap();
        let mut local = 0u128;
        heap.free((&raw mut local).cast());
        // Nothing was disturbed.
        assert_eq!(heap.stats().live_blocks, 1);
        heap.check_state().unwrap();
        heap.free(keep.as_ptr());
    }

    #[test]
    fn test_double_free_rejected() {
        let heap = Heap::new();
        // A large block lands on the free lists, not the cache, so the
        // second free sees an unallocated header.
        let ptr = heap.alloc(4096, site()).unwrap();
        heap.free(ptr.as_ptr());
        let before = heap.stats();
        heap.free(ptr.as_ptr());
        assert_eq!(heap.stats(), before);
        heap.check_state().unwrap();
    }

    #[test]
    fn test_calloc_zeroes() {
        let heap = Heap::new();
        let ptr = heap.calloc(256, site()).unwrap();
        unsafe {
            for offset in 0..256 {
                assert_eq!(ptr.as_ptr().add(offset).read(), 0);
            }
        }
        heap.free(ptr.as_ptr());
    }

    #[test]
    fn test_realloc_null_and_zero() {
        let heap = Heap::new();
        let ptr = heap.realloc(None, 80).unwrap().unwrap();
        assert_eq!(heap.ptr_size(ptr.as_ptr()), 80);
        assert_eq!(heap.realloc(Some(ptr), 0).unwrap(), None);
        assert_eq!(heap.stats().live_blocks, 0);
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let heap = Heap::new();
        let ptr = heap.alloc(1000, site()).unwrap();
        unsafe {
            for offset in 0..1000 {
                ptr.as_ptr().add(offset).write((offset % 251) as u8);
            }
        }
        let grown = heap.realloc(Some(ptr), 30_000).unwrap().unwrap();
        unsafe {
            for offset in 0..1000 {
                assert_eq!(grown.as_ptr().add(offset).read(), (offset % 251) as u8);
            }
        }
        let shrunk = heap.realloc(Some(grown), 500).unwrap().unwrap();
        assert_eq!(shrunk, grown);
        unsafe {
            for offset in 0..500 {
                assert_eq!(shrunk.as_ptr().add(offset).read(), (offset % 251) as u8);
            }
        }
        heap.check_state().unwrap();
        heap.free(shrunk.as_ptr());
    }

    #[test]
    fn test_alloc_pages_alignment() {
        let heap = Heap::new();
        let page = platform::page_size();
        let ptr = heap.alloc_pages(3, site()).unwrap();
        assert_eq!(ptr.as_ptr() as usize % page, 0);
        assert_eq!(heap.ptr_size(ptr.as_ptr()), 3 * page);
        assert_eq!(heap.stats().page_spans, 1);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 3 * page);
        }
        heap.check_ptr(ptr.as_ptr()).unwrap();
        heap.free(ptr.as_ptr());
        assert_eq!(heap.stats().page_spans, 0);
        assert_eq!(heap.stats().page_bytes, 0);
    }

    #[test]
    fn test_footer_detects_overrun() {
        if !debug_checks() {
            return;
        }
        let heap = Heap::new();
        let ptr = heap.alloc(40, site()).unwrap();
        unsafe {
            // Smash one byte past the reported size.
            ptr.as_ptr().add(40).write(0xFF);
        }
        assert_eq!(
            heap.check_ptr(ptr.as_ptr()),
            Err(Error::Corruption("footer overwritten"))
        );
    }

    #[test]
    fn test_leak_report() {
        let heap = Heap::new();
        let a = heap.alloc(64, site()).unwrap();
        let b = heap.alloc(128, site()).unwrap();
        heap.suppress_leak(b.as_ptr());

        let mut report = String::new();
        let written = heap.print_allocations(PrintFlags::empty(), &mut report);
        assert_eq!(written, report.len());
        assert!(report.contains("64 bytes"));
        assert!(!report.contains("128 bytes"));

        heap.mark_allocations();
        let mut report = String::new();
        heap.print_allocations(PrintFlags::empty(), &mut report);
        assert!(report.is_empty());

        heap.free(a.as_ptr());
        heap.free(b.as_ptr());
    }

    #[test]
    fn test_heap_grows_past_first_region() {
        let heap = Heap::new();
        let mut ptrs = Vec::new();
        // Far more than one grow quantum.
        for _ in 0..64 {
            ptrs.push(heap.alloc(8192, site()).unwrap());
        }
        heap.check_state().unwrap();
        assert!(heap.stats().total_region_bytes > 64 * 1024);
        for ptr in ptrs {
            heap.free(ptr.as_ptr());
        }
        heap.check_state().unwrap();
        assert_eq!(heap.stats().live_bytes, 0);
    }

    #[test]
    fn test_oversized_alloc_rejected() {
        let heap = Heap::new();
        assert_eq!(
            heap.alloc(MAX_BLOCK_SIZE + 1, site()),
            Err(Error::InvalidArgument)
        );
    }
}
