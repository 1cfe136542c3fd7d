/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

pub(crate) mod tables;
mod clone;
mod segments;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    access_type::AccessType,
    frame_pool::{
        frame_table::{FrameOwner, FrameType},
        FramePin,
    },
    layout::{
        in_address_space, l1_index, l2_index, page_offset, shared_address, ClusterNo, ProcessId,
        VirtualAddress,
    },
    util::fatal,
    vm_error::{TrapCause, VMError, VMResult},
    vm_system::VMSystem,
};

use tables::{L1Status, L2Flags, PageTableL1Entry};

/// Where the master table of an address space currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MasterTable {
    /// not created yet or already torn down
    Absent,
    Resident(usize),
    SwappedOut(ClusterNo),
}

/// An access that has to be continued inside a shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SharedRoute {
    pub(crate) id: usize,
    pub(crate) addr: VirtualAddress,
}

/// Where a virtual address currently resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Translation {
    Resident { frame: usize, offset: usize },
    Shared(SharedRoute),
}

/// One process' (or one shared segment's) view of memory.
///
/// All table memory lives in kernel frames. This struct only remembers where
/// the master table is, which the kernel pool patches when it evicts it.
pub(crate) struct AddressSpace {
    pid: ProcessId,
    master: Mutex<MasterTable>,
    segment_count: AtomicUsize,
    self_ref: Weak<AddressSpace>,
}

impl AddressSpace {
    /// The master table is created separately by `create_master_table`.
    pub(crate) fn new(pid: ProcessId) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            pid,
            master: Mutex::new(MasterTable::Absent),
            segment_count: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        })
    }

    #[inline]
    pub(crate) fn pid(&self) -> ProcessId {
        self.pid
    }

    #[inline]
    pub(crate) fn segment_count(&self) -> usize {
        self.segment_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn master_state(&self) -> MasterTable {
        *self.master.lock()
    }

    #[inline]
    pub(crate) fn is(&self, other: &Weak<AddressSpace>) -> bool {
        Weak::ptr_eq(&self.self_ref, other)
    }

    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<AddressSpace> {
        self.self_ref.clone()
    }

    /// Allocates a zeroed master table.
    pub(crate) fn create_master_table(&self, sys: &VMSystem) {
        let _guard = sys.kernel_pool.lock();
        let frame = sys.request_kernel_frame(
            FrameType::SegmentTable,
            FrameOwner::AddressSpace(self.downgrade()),
            None,
            false,
        );
        *self.master.lock() = MasterTable::Resident(frame);
        debug!("process {}: master table in kernel frame {}", self.pid, frame);
    }

    /// Called by the eviction path after the master table was written out.
    pub(crate) fn master_swapped_out(&self, cluster: ClusterNo) {
        *self.master.lock() = MasterTable::SwappedOut(cluster);
        trace!("process {}: master table swapped out to {}", self.pid, cluster);
    }

    /// Pins the master table, swapping it in first if necessary.
    pub(crate) fn master_table_lock<'a>(&self, sys: &'a VMSystem) -> FramePin<'a> {
        loop {
            match self.master_state() {
                MasterTable::Resident(frame) => {
                    if let Some(pin) = sys.kernel_pool.pin(frame) {
                        if self.master_state() == MasterTable::Resident(frame) {
                            return pin;
                        }
                    }
                    // evicted in between, try again
                }
                MasterTable::SwappedOut(_) => {
                    let _guard = sys.kernel_pool.lock();
                    let MasterTable::SwappedOut(cluster) = self.master_state() else {
                        continue;
                    };

                    let frame = sys.request_kernel_frame(
                        FrameType::SegmentTable,
                        FrameOwner::AddressSpace(self.downgrade()),
                        Some(cluster),
                        true,
                    );
                    *self.master.lock() = MasterTable::Resident(frame);
                    trace!("process {}: master table swapped in to {}", self.pid, frame);
                    return sys.kernel_pool.adopt_pin(frame);
                }
                MasterTable::Absent => {
                    fatal!("process {} has no master table", self.pid)
                }
            }
        }
    }

    /// Pins the page table that covers `addr`, swapping it in if necessary.
    /// Returns `None` if that part of the address space has no page table.
    pub(crate) fn page_table_lock<'a>(
        &self,
        sys: &'a VMSystem,
        master: &FramePin<'_>,
        addr: VirtualAddress,
    ) -> Option<FramePin<'a>> {
        let master = master.ordinal();
        let slot = l1_index(addr);
        loop {
            let entry = sys.kernel_pool.l1_entry(master, slot);
            match entry.status {
                L1Status::Unused => return None,
                L1Status::Present => {
                    let frame = entry.block as usize;
                    if let Some(pin) = sys.kernel_pool.pin(frame) {
                        if sys.kernel_pool.l1_entry(master, slot) == entry {
                            return Some(pin);
                        }
                    }
                }
                L1Status::PagedOut => {
                    let _guard = sys.kernel_pool.lock();
                    let entry = sys.kernel_pool.l1_entry(master, slot);
                    if entry.status != L1Status::PagedOut {
                        continue;
                    }

                    let frame = sys.request_kernel_frame(
                        FrameType::PageTable,
                        FrameOwner::Entry {
                            table: master,
                            slot,
                        },
                        Some(entry.block),
                        true,
                    );
                    sys.kernel_pool
                        .set_l1_entry(master, slot, PageTableL1Entry::present(frame));
                    return Some(sys.kernel_pool.adopt_pin(frame));
                }
            }
        }
    }

    /// Like `page_table_lock`, but creates an empty page table if there is none.
    pub(crate) fn ensure_page_table<'a>(
        &self,
        sys: &'a VMSystem,
        master: &FramePin<'_>,
        addr: VirtualAddress,
    ) -> FramePin<'a> {
        loop {
            if let Some(pin) = self.page_table_lock(sys, master, addr) {
                return pin;
            }

            let _guard = sys.kernel_pool.lock();
            let slot = l1_index(addr);
            if sys.kernel_pool.l1_entry(master.ordinal(), slot).status != L1Status::Unused {
                continue;
            }

            let frame = sys.request_kernel_frame(
                FrameType::PageTable,
                FrameOwner::Entry {
                    table: master.ordinal(),
                    slot,
                },
                None,
                true,
            );
            sys.kernel_pool
                .set_l1_entry(master.ordinal(), slot, PageTableL1Entry::present(frame));
            return sys.kernel_pool.adopt_pin(frame);
        }
    }

    /// Checks whether `addr` may be accessed with `mode` right now.
    ///
    /// A write marks the page dirty. Shared pages are only checked against the
    /// rights of this mapping and the caller continues in the shared segment.
    pub(crate) fn access(
        &self,
        sys: &VMSystem,
        addr: VirtualAddress,
        mode: AccessType,
        check_access: bool,
    ) -> VMResult<Option<SharedRoute>> {
        if !in_address_space(addr) {
            return Err(TrapCause::OutOfAddressSpace.into());
        }

        let master = self.master_table_lock(sys);
        let _guard = sys.kernel_pool.lock();

        let l1 = sys.kernel_pool.l1_entry(master.ordinal(), l1_index(addr));
        match l1.status {
            L1Status::Unused => return Err(TrapCause::NotInSegment.into()),
            L1Status::PagedOut => return Err(VMError::PageFault),
            L1Status::Present => {}
        }

        let table = l1.block as usize;
        let slot = l2_index(addr);
        let mut entry = sys.kernel_pool.l2_entry(table, slot);
        if !entry.in_segment() {
            return Err(TrapCause::NotInSegment.into());
        }
        if check_access && !entry.access().permits(mode) {
            return Err(TrapCause::AccessViolation.into());
        }
        if entry.is_shared() {
            return Ok(Some(SharedRoute {
                id: entry.shared_id as usize,
                addr: shared_address(entry.block, addr),
            }));
        }
        if !entry.is_valid() {
            return Err(VMError::PageFault);
        }

        if mode.writes() && !entry.is_dirty() {
            entry.flags |= L2Flags::DIRTY;
            sys.kernel_pool.set_l2_entry(table, slot, entry);
        }
        if mode.writes() {
            sys.user_pool.mark_dirty(entry.block as usize);
        }
        Ok(None)
    }

    /// Makes the page behind `addr` resident.
    ///
    /// Swaps in the page table and the page if needed and materializes pages
    /// that were never touched as zero-filled frames.
    pub(crate) fn page_fault(&self, sys: &VMSystem, addr: VirtualAddress) -> VMResult<Option<SharedRoute>> {
        if !in_address_space(addr) {
            return Err(TrapCause::OutOfAddressSpace.into());
        }

        let master = self.master_table_lock(sys);
        let Some(table) = self.page_table_lock(sys, &master, addr) else {
            fatal!(
                "process {}: page fault at {:#x} outside of every page table",
                self.pid,
                addr
            )
        };

        let _guard = sys.kernel_pool.lock();
        let slot = l2_index(addr);
        let mut entry = sys.kernel_pool.l2_entry(table.ordinal(), slot);
        if !entry.in_segment() {
            return Err(TrapCause::NotInSegment.into());
        }
        if entry.is_shared() {
            return Ok(Some(SharedRoute {
                id: entry.shared_id as usize,
                addr: shared_address(entry.block, addr),
            }));
        }
        if entry.is_valid() {
            return Ok(None);
        }

        let owner = FrameOwner::Entry {
            table: table.ordinal(),
            slot,
        };
        let frame = if entry.is_to_be_created() {
            sys.request_user_frame(owner, None, true)
        } else {
            sys.request_user_frame(owner, Some(entry.block), true)
        };

        entry.block = frame as u16;
        entry.flags.remove(L2Flags::TO_BE_CREATED | L2Flags::DIRTY);
        entry.flags |= L2Flags::VALID;
        sys.kernel_pool.set_l2_entry(table.ordinal(), slot, entry);
        trace!("process {}: {:#x} now in user frame {}", self.pid, addr, frame);
        Ok(None)
    }

    /// Resolves `addr` without swapping anything in.
    pub(crate) fn translate(&self, sys: &VMSystem, addr: VirtualAddress) -> Option<Translation> {
        if !in_address_space(addr) {
            return None;
        }

        let _guard = sys.kernel_pool.lock();
        let MasterTable::Resident(master) = self.master_state() else {
            return None;
        };

        let l1 = sys.kernel_pool.l1_entry(master, l1_index(addr));
        if l1.status != L1Status::Present {
            return None;
        }

        let entry = sys.kernel_pool.l2_entry(l1.block as usize, l2_index(addr));
        if !entry.in_segment() {
            None
        } else if entry.is_shared() {
            Some(Translation::Shared(SharedRoute {
                id: entry.shared_id as usize,
                addr: shared_address(entry.block, addr),
            }))
        } else if entry.is_valid() {
            Some(Translation::Resident {
                frame: entry.block as usize,
                offset: page_offset(addr),
            })
        } else {
            None
        }
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .field("master", &self.master_state())
            .field("segments", &self.segment_count())
            .finish()
    }
}

#[cfg(test)]
impl AddressSpace {
    /// Number of swap clusters this space holds on to: swapped out tables,
    /// swapped out pages and the origin clusters of resident pages.
    /// Expects the kernel pool lock to be held so nothing moves meanwhile.
    pub(crate) fn referenced_clusters(&self, sys: &VMSystem) -> usize {
        use crate::layout::{L1_ENTRIES, L2_ENTRIES, PAGE_SIZE};
        use tables::PageTableL2Entry;

        let mut master = [0u8; PAGE_SIZE];
        let mut count = match self.master_state() {
            MasterTable::Absent => return 0,
            MasterTable::Resident(frame) => {
                sys.kernel_pool
                    .frame(frame, FrameType::SegmentTable, |bytes| master.copy_from_slice(bytes));
                0
            }
            MasterTable::SwappedOut(cluster) => {
                sys.swap.read(cluster, &mut master);
                1
            }
        };

        let mut table = [0u8; PAGE_SIZE];
        for slot in 0..L1_ENTRIES {
            let l1 = PageTableL1Entry::decode(&master, slot);
            match l1.status {
                L1Status::Unused => continue,
                L1Status::Present => sys.kernel_pool.frame(l1.block as usize, FrameType::PageTable, |bytes| {
                    table.copy_from_slice(bytes)
                }),
                L1Status::PagedOut => {
                    count += 1;
                    sys.swap.read(l1.block, &mut table);
                }
            }

            for l2 in 0..L2_ENTRIES {
                let entry = PageTableL2Entry::decode(&table, l2);
                if !entry.in_segment() || entry.is_shared() || entry.is_to_be_created() {
                    continue;
                }
                if !entry.is_valid() || sys.user_pool.entry(entry.block as usize).origin.is_some() {
                    count += 1;
                }
            }
        }
        count
    }
}
