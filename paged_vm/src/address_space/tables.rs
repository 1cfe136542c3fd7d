//! Byte layouts of the master table (L1 table followed by the segment table)
//! and of the L2 page tables. Each table fills exactly one kernel frame.

use bitflags::bitflags;

use crate::{
    access_type::AccessType,
    frame_pool::{frame_table::FrameType, FramePool},
    layout::{ClusterNo, L1_ENTRIES, L2_ENTRIES, MAX_SEGMENTS, MAX_SEGMENT_PAGES, PAGE_SIZE},
};

const ENTRY_BYTES: usize = 4;
const SEGMENT_TABLE_OFFSET: usize = L1_ENTRIES * ENTRY_BYTES;

static_assertions::const_assert_eq!(SEGMENT_TABLE_OFFSET + MAX_SEGMENTS * ENTRY_BYTES, PAGE_SIZE);
static_assertions::const_assert_eq!(L2_ENTRIES * ENTRY_BYTES, PAGE_SIZE);
// length - 1 must fit into 14 bits
static_assertions::const_assert!(MAX_SEGMENT_PAGES - 1 < (1 << 14));

#[inline]
fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum L1Status {
    Unused = 0,
    PagedOut = 1,
    Present = 2,
}

/// `block` is the page table's frame ordinal if present, its cluster if paged out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageTableL1Entry {
    pub(crate) status: L1Status,
    pub(crate) block: u16,
}

impl PageTableL1Entry {
    pub(crate) const UNUSED: Self = Self {
        status: L1Status::Unused,
        block: 0,
    };

    pub(crate) fn present(frame: usize) -> Self {
        Self {
            status: L1Status::Present,
            block: frame as u16,
        }
    }

    pub(crate) fn paged_out(cluster: ClusterNo) -> Self {
        Self {
            status: L1Status::PagedOut,
            block: cluster,
        }
    }

    pub(crate) fn decode(table: &[u8], slot: usize) -> Self {
        let offset = slot * ENTRY_BYTES;
        let status = match table[offset] {
            0 => L1Status::Unused,
            1 => L1Status::PagedOut,
            _ => L1Status::Present,
        };
        Self {
            status,
            block: read_u16(table, offset + 2),
        }
    }

    pub(crate) fn encode(self, table: &mut [u8], slot: usize) {
        let offset = slot * ENTRY_BYTES;
        table[offset] = self.status as u8;
        table[offset + 1] = 0;
        write_u16(table, offset + 2, self.block);
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Free = 0,
    Occupied = 1,
    OccupiedShared = 2,
    /// being torn down, still blocks its range
    Releasing = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentTableEntry {
    pub(crate) start_page: usize,
    pub(crate) pages: usize,
    pub(crate) kind: SegmentKind,
}

impl SegmentTableEntry {
    pub(crate) const FREE: Self = Self {
        start_page: 0,
        pages: 0,
        kind: SegmentKind::Free,
    };

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.kind == SegmentKind::Free
    }

    /// Occupied by a segment that is not being torn down.
    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        matches!(self.kind, SegmentKind::Occupied | SegmentKind::OccupiedShared)
    }

    #[inline]
    pub(crate) fn end_page(&self) -> usize {
        self.start_page + self.pages
    }

    #[inline]
    pub(crate) fn overlaps(&self, start_page: usize, pages: usize) -> bool {
        !self.is_free() && self.start_page < start_page + pages && start_page < self.end_page()
    }

    pub(crate) fn decode(table: &[u8], index: usize) -> Self {
        let offset = SEGMENT_TABLE_OFFSET + index * ENTRY_BYTES;
        let len_kind = read_u16(table, offset);
        let kind = match len_kind & 0b11 {
            0 => return Self::FREE,
            1 => SegmentKind::Occupied,
            2 => SegmentKind::OccupiedShared,
            _ => SegmentKind::Releasing,
        };
        Self {
            start_page: read_u16(table, offset + 2) as usize,
            pages: (len_kind >> 2) as usize + 1,
            kind,
        }
    }

    pub(crate) fn encode(self, table: &mut [u8], index: usize) {
        let offset = SEGMENT_TABLE_OFFSET + index * ENTRY_BYTES;
        let len_kind = match self.kind {
            SegmentKind::Free => 0,
            kind => (((self.pages - 1) as u16) << 2) | kind as u16,
        };
        write_u16(table, offset, len_kind);
        write_u16(table, offset + 2, self.start_page as u16);
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct L2Flags: u8 {
        const VALID = 1 << 7;
        const DIRTY = 1 << 6;
        const IN_SEGMENT = 1 << 5;
        /// not materialized yet, zero-filled on first fault
        const TO_BE_CREATED = 1 << 4;
        const SHARED = 1 << 3;
        const ACCESS = 0b11;
    }
}

/// `block` is the user frame ordinal if valid, the page's cluster otherwise.
/// For shared pages it is the unit inside the shared segment and `shared_id`
/// names the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageTableL2Entry {
    pub(crate) block: u16,
    pub(crate) shared_id: u8,
    pub(crate) flags: L2Flags,
}

impl PageTableL2Entry {
    pub(crate) const EMPTY: Self = Self {
        block: 0,
        shared_id: 0,
        flags: L2Flags::empty(),
    };

    pub(crate) fn to_be_created(access: AccessType) -> Self {
        Self {
            block: 0,
            shared_id: 0,
            flags: L2Flags::IN_SEGMENT
                | L2Flags::TO_BE_CREATED
                | L2Flags::DIRTY
                | L2Flags::from_bits_retain(access.bits()),
        }
    }

    pub(crate) fn resident(frame: usize, access: AccessType) -> Self {
        Self {
            block: frame as u16,
            shared_id: 0,
            flags: L2Flags::IN_SEGMENT
                | L2Flags::VALID
                | L2Flags::DIRTY
                | L2Flags::from_bits_retain(access.bits()),
        }
    }

    pub(crate) fn shared(id: usize, unit: usize, access: AccessType) -> Self {
        Self {
            block: unit as u16,
            shared_id: id as u8,
            flags: L2Flags::IN_SEGMENT | L2Flags::SHARED | L2Flags::from_bits_retain(access.bits()),
        }
    }

    #[inline]
    pub(crate) fn access(&self) -> AccessType {
        AccessType::from_bits((self.flags & L2Flags::ACCESS).bits())
    }

    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.flags.contains(L2Flags::VALID)
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.flags.contains(L2Flags::DIRTY)
    }

    #[inline]
    pub(crate) fn in_segment(&self) -> bool {
        self.flags.contains(L2Flags::IN_SEGMENT)
    }

    #[inline]
    pub(crate) fn is_to_be_created(&self) -> bool {
        self.flags.contains(L2Flags::TO_BE_CREATED)
    }

    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        self.flags.contains(L2Flags::SHARED)
    }

    pub(crate) fn decode(table: &[u8], slot: usize) -> Self {
        let offset = slot * ENTRY_BYTES;
        Self {
            block: read_u16(table, offset),
            shared_id: table[offset + 2],
            flags: L2Flags::from_bits_retain(table[offset + 3]),
        }
    }

    pub(crate) fn encode(self, table: &mut [u8], slot: usize) {
        let offset = slot * ENTRY_BYTES;
        write_u16(table, offset, self.block);
        table[offset + 2] = self.shared_id;
        table[offset + 3] = self.flags.bits();
    }
}

/// Typed views into kernel frames. Each call checks that `ordinal` currently
/// holds the expected kind of table.
impl FramePool {
    pub(crate) fn l1_entry(&self, master: usize, slot: usize) -> PageTableL1Entry {
        self.frame(master, FrameType::SegmentTable, |table| {
            PageTableL1Entry::decode(table, slot)
        })
    }

    pub(crate) fn set_l1_entry(&self, master: usize, slot: usize, entry: PageTableL1Entry) {
        self.frame_mut(master, FrameType::SegmentTable, |table| {
            entry.encode(table, slot)
        })
    }

    pub(crate) fn segment_entry(&self, master: usize, index: usize) -> SegmentTableEntry {
        self.frame(master, FrameType::SegmentTable, |table| {
            SegmentTableEntry::decode(table, index)
        })
    }

    pub(crate) fn set_segment_entry(&self, master: usize, index: usize, entry: SegmentTableEntry) {
        self.frame_mut(master, FrameType::SegmentTable, |table| {
            entry.encode(table, index)
        })
    }

    pub(crate) fn l2_entry(&self, page_table: usize, slot: usize) -> PageTableL2Entry {
        self.frame(page_table, FrameType::PageTable, |table| {
            PageTableL2Entry::decode(table, slot)
        })
    }

    pub(crate) fn set_l2_entry(&self, page_table: usize, slot: usize, entry: PageTableL2Entry) {
        self.frame_mut(page_table, FrameType::PageTable, |table| {
            entry.encode(table, slot)
        })
    }
}
