//! Block layout
//!
//! Every heap block is a header followed by the user payload. Headers thread
//! all blocks of a base region in address order through `prev`/`next`; the
//! payload of a free block doubles as its free-list links, which is what
//! pins the minimum block size at 16 bytes.
//!
//! Sizes follow one rule everywhere: `size` counts user payload bytes while
//! a block is allocated or cached, and grows to the full capacity (all bytes
//! up to the next header or the region end) when the block is fully freed.

use bitflags::bitflags;

/// Payload alignment, large enough for any primitive type.
pub(crate) const ALIGN: usize = 16;

/// Smallest payload the heap tracks; also the size of [`FreeLinks`].
pub(crate) const MIN_BLOCK_SIZE: usize = 16;
pub(crate) const LOG_MIN_BLOCK_SIZE: usize = 4;

/// Largest single block the heap will carve (implementation limit).
pub(crate) const MAX_BLOCK_SIZE: usize = 64 << 20;
pub(crate) const LOG_MAX_BLOCK_SIZE: usize = 26;

/// Exact user sizes up to this many bytes are eligible for the size cache.
pub(crate) const MAX_CACHEABLE_SIZE: usize = 256;

/// Base growth quantum for new regions; doubled until the request fits.
pub(crate) const REGION_GROW_SIZE: usize = 64 * 1024;

pub(crate) const HEADER_MAGIC: u32 = 0xB10C_4EAD;
pub(crate) const FOOTER_MAGIC: u32 = 0xB10C_F007;

/// Freshly allocated payload fill (debug builds).
pub(crate) const ALLOC_FILL: u8 = 0xCD;
/// Freed payload fill (debug builds).
pub(crate) const FREE_FILL: u8 = 0xDD;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BlockFlags: u32 {
        /// Block is handed out to a caller.
        const ALLOCATED = 1 << 0;
        /// Block sits on the size-class cache; excluded from coalescing.
        const CACHED = 1 << 1;
        /// A footer magic word trails the payload.
        const HAS_FOOTER = 1 << 2;
        /// Payload carries the free fill pattern (past the free links).
        const FREE_PATTERN = 1 << 3;
        /// Excluded from leak reports.
        const LEAK_IGNORED = 1 << 4;
    }
}

/// Where an allocation was made, for leak reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSite {
    pub file: &'static str,
    pub line: u32,
}

impl AllocSite {
    pub const UNKNOWN: AllocSite = AllocSite { file: "<unknown>", line: 0 };

    pub const fn new(file: &'static str, line: u32) -> AllocSite {
        AllocSite { file, line }
    }
}

/// Capture the current file/line as an [`AllocSite`].
#[macro_export]
macro_rules! alloc_site {
    () => {
        $crate::mem::AllocSite::new(file!(), line!())
    };
}

pub(crate) struct BlockHeader {
    pub magic: u32,
    pub flags: BlockFlags,
    pub size: usize,
    pub prev: *mut BlockHeader,
    pub next: *mut BlockHeader,
    pub site: AllocSite,
}

/// Header bytes as laid out in a region, rounded up to payload alignment.
pub(crate) const HEADER_SIZE: usize =
    (std::mem::size_of::<BlockHeader>() + ALIGN - 1) & !(ALIGN - 1);

/// Free-list links, overlaid on the first payload bytes of a free block.
#[repr(C)]
pub(crate) struct FreeLinks {
    pub next: *mut BlockHeader,
    pub prev: *mut BlockHeader,
}

pub(crate) const FREE_LINKS_SIZE: usize = std::mem::size_of::<FreeLinks>();

/// The payload pointer for a header.
///
/// # Safety
/// `header` must point at a live block header inside a heap region.
pub(crate) unsafe fn payload_of(header: *mut BlockHeader) -> *mut u8 {
    unsafe { header.cast::<u8>().add(HEADER_SIZE) }
}

/// The header for a payload pointer.
///
/// # Safety
/// `payload` must have been produced by [`payload_of`].
pub(crate) unsafe fn header_of(payload: *mut u8) -> *mut BlockHeader {
    unsafe { payload.sub(HEADER_SIZE).cast::<BlockHeader>() }
}

/// The free-list links of a free block.
///
/// # Safety
/// The block must be free or cached; the links alias the payload.
pub(crate) unsafe fn links_of(header: *mut BlockHeader) -> *mut FreeLinks {
    unsafe { payload_of(header).cast::<FreeLinks>() }
}

/// Round a payload size up to the allocation granule.
pub(crate) fn align_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// The power-of-two size class for a payload size: the smallest `c` with
/// `2^c >= bytes`, clamped to the minimum class.
pub(crate) fn size_class(bytes: usize) -> usize {
    let mut class = LOG_MIN_BLOCK_SIZE;
    let mut cap = MIN_BLOCK_SIZE;
    while cap < bytes {
        cap <<= 1;
        class += 1;
    }
    class
}

/// Write the footer magic just past the payload.
///
/// # Safety
/// The block's capacity must cover `size` plus the footer word.
pub(crate) unsafe fn write_footer(header: *mut BlockHeader) {
    unsafe {
        let at = payload_of(header).add((*header).size).cast::<u32>();
        at.write_unaligned(FOOTER_MAGIC);
    }
}

/// Whether the footer magic is intact.
///
/// # Safety
/// As [`write_footer`].
pub(crate) unsafe fn footer_ok(header: *mut BlockHeader) -> bool {
    unsafe {
        let at = payload_of(header).add((*header).size).cast::<u32>();
        at.read_unaligned() == FOOTER_MAGIC
    }
}
