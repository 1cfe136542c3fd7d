use core::sync::atomic::Ordering;

use log::debug;

use super::{
    tables::{L1Status, PageTableL1Entry, PageTableL2Entry, SegmentKind, SegmentTableEntry},
    AddressSpace,
};
use crate::{
    access_type::AccessType,
    frame_pool::{frame_table::FrameOwner, FramePin},
    layout::{
        l2_index, page_address, page_offset, VirtualAddress, ADDRESS_SPACE_PAGES, L1_ENTRIES,
        L2_ENTRIES, MAX_SEGMENTS, MAX_SEGMENT_PAGES, PAGE_BITS, PAGE_SIZE,
    },
    util::fatal,
    vm_error::{TrapCause, VMResult},
    vm_system::VMSystem,
};

/// Checks a segment request and returns its first page.
pub(super) fn validate_range(start: VirtualAddress, pages: usize) -> VMResult<usize> {
    if pages == 0 || pages > MAX_SEGMENT_PAGES {
        return Err(TrapCause::InvalidSize.into());
    }
    if page_offset(start) != 0 {
        return Err(TrapCause::Misaligned.into());
    }

    let start_page = (start >> PAGE_BITS) as usize;
    if start_page + pages > ADDRESS_SPACE_PAGES {
        return Err(TrapCause::OutOfAddressSpace.into());
    }
    Ok(start_page)
}

/// Splits `[start_page, start_page + pages)` at page table boundaries.
pub(super) fn page_table_chunks(start_page: usize, pages: usize) -> impl Iterator<Item = (usize, usize)> {
    let end = start_page + pages;
    let mut page = start_page;
    core::iter::from_fn(move || {
        if page >= end {
            return None;
        }
        let chunk_end = end.min((page / L2_ENTRIES + 1) * L2_ENTRIES);
        let chunk = (page, chunk_end);
        page = chunk_end;
        Some(chunk)
    })
}

impl AddressSpace {
    fn find_overlap(&self, sys: &VMSystem, master: &FramePin<'_>, start_page: usize, pages: usize) -> bool {
        (0..MAX_SEGMENTS).any(|index| {
            sys.kernel_pool
                .segment_entry(master.ordinal(), index)
                .overlaps(start_page, pages)
        })
    }

    /// Claims a free segment table slot for the range and returns its index.
    pub(super) fn reserve_segment(
        &self,
        sys: &VMSystem,
        master: &FramePin<'_>,
        start_page: usize,
        pages: usize,
        kind: SegmentKind,
    ) -> VMResult<usize> {
        let _guard = sys.kernel_pool.lock();
        if self.find_overlap(sys, master, start_page, pages) {
            return Err(TrapCause::Overlap.into());
        }

        let index = (0..MAX_SEGMENTS)
            .find(|index| sys.kernel_pool.segment_entry(master.ordinal(), *index).is_free())
            .ok_or(TrapCause::SegmentTableFull)?;

        sys.kernel_pool.set_segment_entry(
            master.ordinal(),
            index,
            SegmentTableEntry {
                start_page,
                pages,
                kind,
            },
        );
        self.segment_count.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    /// Frees a slot claimed by `reserve_segment` that never got populated.
    fn release_reservation(&self, sys: &VMSystem, master: &FramePin<'_>, index: usize) {
        let _guard = sys.kernel_pool.lock();
        sys.kernel_pool
            .set_segment_entry(master.ordinal(), index, SegmentTableEntry::FREE);
        self.segment_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Writes the L2 entry `make(page index, owner)` for every page of the range.
    pub(super) fn populate(
        &self,
        sys: &VMSystem,
        master: &FramePin<'_>,
        start_page: usize,
        pages: usize,
        mut make: impl FnMut(usize, FrameOwner) -> PageTableL2Entry,
    ) {
        for (first, end) in page_table_chunks(start_page, pages) {
            let table = self.ensure_page_table(sys, master, page_address(first));
            for page in first..end {
                let slot = l2_index(page_address(page));
                // owner patch and frame hand-out must look atomic to evictors
                let _guard = sys.kernel_pool.lock();
                let entry = make(
                    page - start_page,
                    FrameOwner::Entry {
                        table: table.ordinal(),
                        slot,
                    },
                );
                sys.kernel_pool.set_l2_entry(table.ordinal(), slot, entry);
            }
        }
    }

    /// Creates a segment whose pages are zero-filled on first access.
    pub(crate) fn create_segment(
        &self,
        sys: &VMSystem,
        start: VirtualAddress,
        pages: usize,
        access: AccessType,
    ) -> VMResult<()> {
        let start_page = validate_range(start, pages)?;
        let master = self.master_table_lock(sys);
        self.reserve_segment(sys, &master, start_page, pages, SegmentKind::Occupied)?;

        self.populate(sys, &master, start_page, pages, |_, _| {
            PageTableL2Entry::to_be_created(access)
        });
        debug!(
            "process {}: segment {:#x} with {} pages ({:?})",
            self.pid, start, pages, access
        );
        Ok(())
    }

    /// Creates a segment and copies `content` into it right away.
    pub(crate) fn load_segment(
        &self,
        sys: &VMSystem,
        start: VirtualAddress,
        pages: usize,
        access: AccessType,
        content: &[u8],
    ) -> VMResult<()> {
        let start_page = validate_range(start, pages)?;
        if content.len() < pages * PAGE_SIZE {
            return Err(TrapCause::ContentTooShort.into());
        }

        let master = self.master_table_lock(sys);
        self.reserve_segment(sys, &master, start_page, pages, SegmentKind::Occupied)?;

        self.populate(sys, &master, start_page, pages, |index, owner| {
            let page = &content[index * PAGE_SIZE..(index + 1) * PAGE_SIZE];
            PageTableL2Entry::resident(sys.load_user_frame(owner, page), access)
        });
        debug!(
            "process {}: loaded segment {:#x} with {} pages ({:?})",
            self.pid, start, pages, access
        );
        Ok(())
    }

    pub(crate) fn delete_segment(&self, sys: &VMSystem, start: VirtualAddress) -> VMResult<()> {
        if page_offset(start) != 0 {
            return Err(TrapCause::Misaligned.into());
        }

        let start_page = (start >> PAGE_BITS) as usize;
        let index = {
            let master = self.master_table_lock(sys);
            let _guard = sys.kernel_pool.lock();
            (0..MAX_SEGMENTS)
                .find(|index| {
                    let entry = sys.kernel_pool.segment_entry(master.ordinal(), *index);
                    entry.is_live() && entry.start_page == start_page
                })
                .ok_or(TrapCause::NoSuchSegment)?
        };

        self.delete_segment_at(sys, index, true);
        Ok(())
    }

    /// Tears down segment table slot `index` and everything its pages hold.
    ///
    /// With `release_shared` a shared mapping is also removed from the
    /// segment's subscriber list. The registry passes `false` when it tears
    /// the mapping down itself. The slot is marked as releasing first, so
    /// concurrent deleters of the same slot back off.
    pub(crate) fn delete_segment_at(&self, sys: &VMSystem, index: usize, release_shared: bool) {
        let master = self.master_table_lock(sys);
        let segment = {
            let _guard = sys.kernel_pool.lock();
            let segment = sys.kernel_pool.segment_entry(master.ordinal(), index);
            if !segment.is_live() {
                return;
            }
            sys.kernel_pool.set_segment_entry(
                master.ordinal(),
                index,
                SegmentTableEntry {
                    kind: SegmentKind::Releasing,
                    ..segment
                },
            );
            segment
        };

        let mut shared_id = None;
        for (first, end) in page_table_chunks(segment.start_page, segment.pages) {
            let Some(table) = self.page_table_lock(sys, &master, page_address(first)) else {
                fatal!(
                    "process {}: segment page {} has no page table",
                    self.pid,
                    first
                )
            };

            for page in first..end {
                let slot = l2_index(page_address(page));
                let _guard = sys.kernel_pool.lock();
                let entry = sys.kernel_pool.l2_entry(table.ordinal(), slot);
                if !entry.in_segment() {
                    fatal!("process {}: page {} is not part of its segment", self.pid, page);
                }

                if entry.is_shared() {
                    shared_id.get_or_insert(entry.shared_id as usize);
                } else if entry.is_valid() {
                    sys.relinquish_user_frame(entry.block as usize);
                } else if !entry.is_to_be_created() {
                    sys.swap.release(entry.block);
                }
                sys.kernel_pool
                    .set_l2_entry(table.ordinal(), slot, PageTableL2Entry::EMPTY);
            }
        }

        {
            let _guard = sys.kernel_pool.lock();
            sys.kernel_pool
                .set_segment_entry(master.ordinal(), index, SegmentTableEntry::FREE);
            self.segment_count.fetch_sub(1, Ordering::Relaxed);
        }
        debug!(
            "process {}: deleted segment {:#x}",
            self.pid,
            page_address(segment.start_page)
        );

        if let (true, Some(id)) = (release_shared, shared_id) {
            // gone already if the registry deletes the segment right now
            sys.shared.disconnect(self, id, index);
        }
    }

    /// Maps shared segment `name` at `start`, creating the segment if it
    /// does not exist yet.
    pub(crate) fn create_shared_segment(
        &self,
        sys: &VMSystem,
        start: VirtualAddress,
        pages: usize,
        name: &str,
        access: AccessType,
    ) -> VMResult<()> {
        let start_page = validate_range(start, pages)?;
        let master = self.master_table_lock(sys);
        // the local slot is claimed first so a full table creates nothing
        let index = self.reserve_segment(sys, &master, start_page, pages, SegmentKind::OccupiedShared)?;

        let id = match sys.shared.find_or_create(sys, name, pages, access) {
            Ok(id) if pages <= sys.shared.pages(id) => id,
            Ok(_) => {
                self.release_reservation(sys, &master, index);
                return Err(TrapCause::InvalidSize.into());
            }
            Err(err) => {
                self.release_reservation(sys, &master, index);
                return Err(err);
            }
        };

        self.populate(sys, &master, start_page, pages, |unit, _| {
            PageTableL2Entry::shared(id, unit, access)
        });
        sys.shared.connect(self, id, index);
        debug!(
            "process {}: mapped shared segment {:?} at {:#x}",
            self.pid, name, start
        );
        Ok(())
    }

    pub(crate) fn disconnect_shared_segment(&self, sys: &VMSystem, name: &str) -> VMResult<()> {
        let id = sys
            .shared
            .find(name)
            .ok_or(TrapCause::UnknownSharedSegment)?;
        let index = sys
            .shared
            .subscription(self, id)
            .ok_or(TrapCause::NotConnected)?;

        self.delete_segment_at(sys, index, true);
        Ok(())
    }

    /// Releases every frame and cluster held by this address space.
    pub(crate) fn destroy(&self, sys: &VMSystem) {
        let master = self.master_table_lock(sys);
        for index in 0..MAX_SEGMENTS {
            self.delete_segment_at(sys, index, true);
        }

        let _guard = sys.kernel_pool.lock();
        for slot in 0..L1_ENTRIES {
            let entry = sys.kernel_pool.l1_entry(master.ordinal(), slot);
            match entry.status {
                L1Status::Unused => continue,
                L1Status::Present => {
                    sys.kernel_pool.release(entry.block as usize);
                }
                L1Status::PagedOut => sys.swap.release(entry.block),
            }
            sys.kernel_pool
                .set_l1_entry(master.ordinal(), slot, PageTableL1Entry::UNUSED);
        }

        let frame = master.ordinal();
        drop(master);
        sys.kernel_pool.release(frame);
        *self.master.lock() = super::MasterTable::Absent;
        debug!("process {}: destroyed", self.pid);
    }
}
