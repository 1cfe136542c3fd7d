use std::sync::Weak;

use bitflags::bitflags;

use crate::{address_space::AddressSpace, layout::ClusterNo};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct FrameFlags: u8 {
        const DIRTY = 1 << 0;
        /// mirrors `pins > 0`
        const LOCKED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FrameType {
    #[default]
    Unused,
    UserPage,
    /// master table: L1 table plus segment table
    SegmentTable,
    PageTable,
    /// bookkeeping overhead, never handed out
    Reserved,
}

impl FrameType {
    #[inline]
    pub(crate) fn is_in_use(self) -> bool {
        !matches!(self, FrameType::Unused | FrameType::Reserved)
    }
}

/// Whatever points at a frame and has to be patched when it is evicted.
#[derive(Debug, Clone, Default)]
pub(crate) enum FrameOwner {
    #[default]
    None,
    /// Slot `slot` of the kernel frame `table`: an L1 entry for page tables,
    /// an L2 entry for user pages.
    Entry { table: usize, slot: usize },
    /// The address space whose master table lives in this frame.
    AddressSpace(Weak<AddressSpace>),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FrameTableEntry {
    pub(crate) flags: FrameFlags,
    pub(crate) frame_type: FrameType,
    pub(crate) owner: FrameOwner,
    pub(crate) pins: u16,
    /// Cluster the content was last read from and which still holds an
    /// identical copy unless the frame is dirty. Only user pages have one.
    pub(crate) origin: Option<ClusterNo>,
}

impl FrameTableEntry {
    pub(crate) fn reserved() -> Self {
        Self {
            frame_type: FrameType::Reserved,
            ..Default::default()
        }
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.pins > 0
    }

    #[inline]
    pub(crate) fn is_evictable(&self) -> bool {
        self.frame_type.is_in_use() && !self.is_locked()
    }

    pub(crate) fn as_victim(&self, ordinal: usize) -> Victim {
        Victim {
            ordinal,
            dirty: self.flags.contains(FrameFlags::DIRTY) || self.origin.is_none(),
            cluster: self.origin,
        }
    }
}

/// A frame chosen for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Victim {
    pub(crate) ordinal: usize,
    /// content differs from `cluster` (always true without a cluster)
    pub(crate) dirty: bool,
    pub(crate) cluster: Option<ClusterNo>,
}
