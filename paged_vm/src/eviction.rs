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

//! Handing out frames and evicting them when a pool runs dry.
//!
//! Callers that need to patch the new frame's owner hold the kernel pool
//! lock across the hand-out, so no evictor ever sees a frame whose owner
//! does not point back at it yet. Evictions of user frames take the kernel
//! lock before the user lock.

use crate::{
    address_space::tables::{L1Status, L2Flags, PageTableL1Entry},
    frame_pool::frame_table::{FrameOwner, FrameType, Victim},
    layout::{ClusterNo, L1_ENTRIES, L2_ENTRIES, PAGE_SIZE},
    util::fatal,
    vm_system::VMSystem,
};

impl VMSystem {
    pub(crate) fn acquire_kernel_frame(&self, frame_type: FrameType, owner: FrameOwner, pinned: bool) -> usize {
        loop {
            if let Some(ordinal) = self.kernel_pool.pop_free() {
                self.kernel_pool.assign(ordinal, frame_type, owner, pinned);
                return ordinal;
            }

            let _guard = self.kernel_pool.lock();
            let victim = self.kernel_pool.select_victim(None);
            self.swap_out_kernel(victim);
        }
    }

    /// Hands out a kernel frame filled from `cluster` (which is freed
    /// afterwards) or zeroed if there is none.
    pub(crate) fn request_kernel_frame(
        &self,
        frame_type: FrameType,
        owner: FrameOwner,
        cluster: Option<ClusterNo>,
        pinned: bool,
    ) -> usize {
        let ordinal = self.acquire_kernel_frame(frame_type, owner, pinned);
        match cluster {
            Some(cluster) => {
                self.kernel_pool
                    .frame_mut(ordinal, frame_type, |bytes| self.swap.read(cluster, bytes));
                self.swap.release(cluster);
            }
            None => self
                .kernel_pool
                .frame_mut(ordinal, frame_type, |bytes| bytes.fill(0)),
        }
        ordinal
    }

    /// Hands out a user frame, never evicting `exclude` to make room.
    pub(crate) fn acquire_user_frame(&self, owner: FrameOwner, exclude: Option<usize>) -> usize {
        loop {
            if let Some(ordinal) = self.user_pool.pop_free() {
                self.user_pool.assign(ordinal, FrameType::UserPage, owner, false);
                return ordinal;
            }

            let _kernel = self.kernel_pool.lock();
            let _user = self.user_pool.lock();
            let victim = self.user_pool.select_victim(exclude);
            self.swap_out_user(victim);
        }
    }

    /// Hands out a user frame filled from `cluster` or zeroed if there is none.
    ///
    /// With `keep_origin` the cluster stays allocated and the frame remembers
    /// it, so a clean eviction does not have to write. Otherwise the cluster
    /// belongs to someone else and is only read.
    pub(crate) fn request_user_frame(&self, owner: FrameOwner, cluster: Option<ClusterNo>, keep_origin: bool) -> usize {
        let ordinal = self.acquire_user_frame(owner, None);
        match cluster {
            Some(cluster) => {
                self.user_pool
                    .frame_mut(ordinal, FrameType::UserPage, |bytes| self.swap.read(cluster, bytes));
                if keep_origin {
                    self.user_pool.set_origin(ordinal, Some(cluster));
                }
            }
            None => self
                .user_pool
                .frame_mut(ordinal, FrameType::UserPage, |bytes| bytes.fill(0)),
        }
        ordinal
    }

    pub(crate) fn load_user_frame(&self, owner: FrameOwner, content: &[u8]) -> usize {
        debug_assert_eq!(content.len(), PAGE_SIZE);
        let ordinal = self.acquire_user_frame(owner, None);
        self.user_pool
            .frame_mut(ordinal, FrameType::UserPage, |bytes| bytes.copy_from_slice(content));
        ordinal
    }

    pub(crate) fn clone_user_frame(&self, source: usize, owner: FrameOwner) -> usize {
        let ordinal = self.acquire_user_frame(owner, Some(source));
        self.user_pool.copy_frame(source, ordinal);
        ordinal
    }

    /// Frees a user frame together with the cluster it was loaded from.
    pub(crate) fn relinquish_user_frame(&self, ordinal: usize) {
        if let Some(cluster) = self.user_pool.release(ordinal) {
            self.swap.release(cluster);
        }
    }

    /// Writes a master table or page table to swap and frees its frame.
    ///
    /// Everything the table points at is evicted first: a page table takes
    /// its private resident pages along, a master table all of its resident
    /// page tables.
    fn swap_out_kernel(&self, victim: Victim) {
        let _guard = self.kernel_pool.lock();
        let frame = self.kernel_pool.entry(victim.ordinal);
        let cluster = victim.cluster.unwrap_or_else(|| self.swap.acquire());

        match (frame.frame_type, frame.owner) {
            (FrameType::PageTable, FrameOwner::Entry { table, slot }) => {
                self.evict_page_table_children(victim.ordinal);
                self.kernel_pool
                    .set_l1_entry(table, slot, PageTableL1Entry::paged_out(cluster));
            }
            (FrameType::SegmentTable, FrameOwner::AddressSpace(space)) => {
                let Some(space) = space.upgrade() else {
                    fatal!("master table in kernel frame {} has no address space", victim.ordinal)
                };
                self.evict_master_table_children(victim.ordinal);
                space.master_swapped_out(cluster);
            }
            (frame_type, owner) => fatal!(
                "cannot swap out kernel frame {} ({:?} owned by {:?})",
                victim.ordinal,
                frame_type,
                owner
            ),
        }

        self.kernel_pool
            .frame(victim.ordinal, frame.frame_type, |bytes| self.swap.write(cluster, bytes));
        self.kernel_pool.release(victim.ordinal);
    }

    fn evict_page_table_children(&self, table: usize) {
        for slot in 0..L2_ENTRIES {
            let entry = self.kernel_pool.l2_entry(table, slot);
            if entry.is_valid() && !entry.is_shared() {
                let ordinal = entry.block as usize;
                self.swap_out_user(self.user_pool.entry(ordinal).as_victim(ordinal));
            }
        }
    }

    fn evict_master_table_children(&self, master: usize) {
        for slot in 0..L1_ENTRIES {
            let entry = self.kernel_pool.l1_entry(master, slot);
            if entry.status != L1Status::Present {
                continue;
            }

            let child = entry.block as usize;
            let child_entry = self.kernel_pool.entry(child);
            if child_entry.is_locked() {
                fatal!(
                    "page table {} is pinned while its master table {} is evicted",
                    child,
                    master
                );
            }
            self.swap_out_kernel(child_entry.as_victim(child));
        }
    }

    /// Writes a user page to swap (unless the swap copy is still current),
    /// points its L2 entry at the cluster and frees the frame.
    fn swap_out_user(&self, victim: Victim) {
        let _kernel = self.kernel_pool.lock();
        let _user = self.user_pool.lock();

        let FrameOwner::Entry { table, slot } = self.user_pool.entry(victim.ordinal).owner else {
            fatal!("user frame {} has no page table entry", victim.ordinal)
        };
        let mut entry = self.kernel_pool.l2_entry(table, slot);
        if !entry.is_valid() || entry.block as usize != victim.ordinal {
            fatal!(
                "page table {} slot {} does not map user frame {}",
                table,
                slot,
                victim.ordinal
            );
        }

        let (cluster, write) = match victim.cluster {
            Some(cluster) => (cluster, victim.dirty || entry.is_dirty()),
            None => (self.swap.acquire(), true),
        };
        if write {
            self.user_pool
                .frame(victim.ordinal, FrameType::UserPage, |bytes| self.swap.write(cluster, bytes));
        }

        entry.block = cluster;
        entry.flags.remove(L2Flags::VALID | L2Flags::DIRTY);
        self.kernel_pool.set_l2_entry(table, slot, entry);

        // the cluster now belongs to the L2 entry, not to the frame
        self.user_pool.release(victim.ordinal);
    }
}
