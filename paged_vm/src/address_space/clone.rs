use log::debug;

use super::{
    segments::page_table_chunks,
    tables::{L2Flags, SegmentKind, SegmentTableEntry},
    AddressSpace,
};
use crate::{
    frame_pool::{frame_table::FrameOwner, FramePin},
    layout::{l2_index, page_address, MAX_SEGMENTS},
    util::fatal,
    vm_system::VMSystem,
};

impl AddressSpace {
    /// Fills this (empty) address space with a copy of `source`.
    ///
    /// Private pages are copied eagerly. Pages that were never touched stay
    /// lazy in the copy and shared mappings get mapped again.
    pub(crate) fn copy_from_space(&self, sys: &VMSystem, source: &AddressSpace) {
        let source_master = source.master_table_lock(sys);
        let master = self.master_table_lock(sys);

        for index in 0..MAX_SEGMENTS {
            let segment = {
                let _guard = sys.kernel_pool.lock();
                sys.kernel_pool.segment_entry(source_master.ordinal(), index)
            };
            if segment.is_live() {
                self.clone_segment(sys, &master, source, &source_master, segment);
            }
        }
        debug!(
            "process {}: cloned from process {} ({} segments)",
            self.pid,
            source.pid,
            self.segment_count()
        );
    }

    fn clone_segment(
        &self,
        sys: &VMSystem,
        master: &FramePin<'_>,
        source: &AddressSpace,
        source_master: &FramePin<'_>,
        segment: SegmentTableEntry,
    ) {
        let index = match self.reserve_segment(sys, master, segment.start_page, segment.pages, segment.kind) {
            Ok(index) => index,
            Err(err) => fatal!(
                "process {}: cannot mirror segment of process {}: {}",
                self.pid,
                source.pid,
                err
            ),
        };

        let mut shared_id = None;
        for (first, end) in page_table_chunks(segment.start_page, segment.pages) {
            let table = self.ensure_page_table(sys, master, page_address(first));
            let Some(source_table) = source.page_table_lock(sys, source_master, page_address(first))
            else {
                fatal!("process {}: segment page {} has no page table", source.pid, first)
            };

            for page in first..end {
                let slot = l2_index(page_address(page));
                let _guard = sys.kernel_pool.lock();
                let mut entry = sys.kernel_pool.l2_entry(source_table.ordinal(), slot);
                let owner = FrameOwner::Entry {
                    table: table.ordinal(),
                    slot,
                };

                if segment.kind == SegmentKind::OccupiedShared {
                    shared_id.get_or_insert(entry.shared_id as usize);
                } else if entry.is_to_be_created() {
                    // stays lazy in the copy as well
                } else if entry.is_valid() {
                    entry.block = sys.clone_user_frame(entry.block as usize, owner) as u16;
                    entry.flags |= L2Flags::DIRTY;
                } else {
                    entry.block = sys.request_user_frame(owner, Some(entry.block), false) as u16;
                    entry.flags |= L2Flags::DIRTY | L2Flags::VALID;
                }
                sys.kernel_pool.set_l2_entry(table.ordinal(), slot, entry);
            }
        }

        if let Some(id) = shared_id {
            sys.shared.connect(self, id, index);
        }
    }
}
