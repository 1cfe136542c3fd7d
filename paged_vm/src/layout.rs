//! Address layout of the two-level paging scheme.
//!
//! A virtual address is split into `[23:18]` L1 slot, `[17:10]` L2 slot and
//! `[9:0]` page offset. Higher bits are outside of every address space.

pub type VirtualAddress = u32;
pub type ProcessId = usize;
pub type ClusterNo = u16;

pub const PAGE_BITS: u32 = 10;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
pub const CLUSTER_SIZE: usize = PAGE_SIZE;

pub const L1_ENTRIES: usize = 64;
pub const L2_ENTRIES: usize = 256;

/// Segment table slots that fit next to the L1 table in one frame.
pub const MAX_SEGMENTS: usize = 192;
pub const MAX_SEGMENT_PAGES: usize = 1 << 14;
pub const ADDRESS_SPACE_PAGES: usize = L1_ENTRIES * L2_ENTRIES;
pub const ADDRESS_SPACE_SIZE: usize = ADDRESS_SPACE_PAGES * PAGE_SIZE;

pub const MAX_SHARED_SEGMENTS: usize = 256;
/// Backing address spaces of shared segments get `SHARED_PID_BASE + id`.
pub const SHARED_PID_BASE: ProcessId = 60000;

/// Cluster numbers are stored in 16 bits and `0xFFFF` is never handed out.
pub const MAX_CLUSTERS: usize = 0xFFFF;
/// Frame ordinals are stored in 16 bits as well.
pub const MAX_FRAMES: usize = 1 << 16;

const L1_SHIFT: u32 = 18;
const L1_MASK: u32 = 0x3F;
const L2_SHIFT: u32 = PAGE_BITS;
const L2_MASK: u32 = 0xFF;
const OFFSET_MASK: u32 = (1 << PAGE_BITS) - 1;

static_assertions::const_assert_eq!(L1_ENTRIES as u32, L1_MASK + 1);
static_assertions::const_assert_eq!(L2_ENTRIES as u32, L2_MASK + 1);
static_assertions::const_assert_eq!(ADDRESS_SPACE_PAGES, MAX_SEGMENT_PAGES);

#[inline]
pub(crate) fn l1_index(addr: VirtualAddress) -> usize {
    ((addr >> L1_SHIFT) & L1_MASK) as usize
}

#[inline]
pub(crate) fn l2_index(addr: VirtualAddress) -> usize {
    ((addr >> L2_SHIFT) & L2_MASK) as usize
}

#[inline]
pub(crate) fn page_offset(addr: VirtualAddress) -> usize {
    (addr & OFFSET_MASK) as usize
}

#[inline]
pub(crate) fn page_address(page: usize) -> VirtualAddress {
    (page << PAGE_BITS) as VirtualAddress
}

#[inline]
pub(crate) fn in_address_space(addr: VirtualAddress) -> bool {
    (addr as usize) < ADDRESS_SPACE_SIZE
}

/// Address inside a shared segment's backing space that corresponds to
/// `addr` when `addr`'s page is unit `unit` of that segment.
#[inline]
pub(crate) fn shared_address(unit: u16, addr: VirtualAddress) -> VirtualAddress {
    page_address(unit as usize) | page_offset(addr) as VirtualAddress
}
