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

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, ReentrantMutex};

use crate::{
    access_type::AccessType,
    address_space::{AddressSpace, MasterTable, Translation},
    frame_pool::{frame_table::FrameType, FramePool, PhysicalAddress, PoolKind, Transfer},
    layout::{page_offset, ProcessId, VirtualAddress, PAGE_SIZE},
    modules::{
        block_device::BlockDeviceModule,
        victim_selection::{RandomVictimSelectionModule, VictimSelectionModule},
    },
    shared_segment::{SharedSegmentInfo, SharedSegmentRegistry},
    swap_space::SwapSpace,
    util::slot_vec::SlotVec,
    vm_config::VMConfig,
    vm_error::{ConfigError, TrapCause, VMError, VMResult},
};

/// Snapshot of the system's resource usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VMStats {
    pub user_frames: usize,
    pub free_user_frames: usize,
    pub kernel_frames: usize,
    pub reserved_kernel_frames: usize,
    pub free_kernel_frames: usize,
    pub master_tables: usize,
    pub page_tables: usize,
    pub swap_clusters: usize,
    pub free_clusters: usize,
    pub processes: usize,
    pub shared_segments: usize,
}

/// A software virtual memory system: two frame pools, a swap device and the
/// address spaces of all processes.
///
/// All operations take `&self` and may be called from any number of threads.
/// Operations on an address space must not race with its destruction.
pub struct VMSystem {
    pub(crate) kernel_pool: FramePool,
    pub(crate) user_pool: FramePool,
    pub(crate) swap: SwapSpace,
    pub(crate) shared: SharedSegmentRegistry,
    processes: Mutex<SlotVec<Arc<AddressSpace>>>,
    /// serializes `access` calls
    access_lock: ReentrantMutex<()>,
}

impl VMSystem {
    /// Creates a system whose pools pick victims at random, seeded by the config.
    pub fn new<S: BlockDeviceModule + 'static>(config: VMConfig, device: S) -> Result<Self, ConfigError> {
        Self::with_victim_selection(
            config,
            device,
            RandomVictimSelectionModule::new(config.victim_seed),
            RandomVictimSelectionModule::new(config.victim_seed.wrapping_add(1)),
        )
    }

    pub fn with_victim_selection<S, K, U>(
        config: VMConfig,
        device: S,
        kernel_selection: K,
        user_selection: U,
    ) -> Result<Self, ConfigError>
    where
        S: BlockDeviceModule + 'static,
        K: VictimSelectionModule + 'static,
        U: VictimSelectionModule + 'static,
    {
        let clusters = SwapSpace::capacity_of(&device);
        let reserved = config.validate(clusters)?;
        info!(
            "vm system: {} user frames, {} kernel frames ({} reserved), {} swap clusters",
            config.user_frames, config.kernel_frames, reserved, clusters
        );

        Ok(Self {
            kernel_pool: FramePool::new(
                PoolKind::Kernel,
                config.kernel_frames,
                reserved,
                Box::new(kernel_selection),
            ),
            user_pool: FramePool::new(PoolKind::User, config.user_frames, 0, Box::new(user_selection)),
            swap: SwapSpace::new(Box::new(device)),
            shared: SharedSegmentRegistry::new(),
            processes: Mutex::new(SlotVec::new()),
            access_lock: ReentrantMutex::new(()),
        })
    }

    pub(crate) fn process(&self, pid: ProcessId) -> VMResult<Arc<AddressSpace>> {
        self.processes
            .lock()
            .get(pid)
            .cloned()
            .ok_or(TrapCause::NoSuchProcess.into())
    }

    fn insert_process(&self) -> Arc<AddressSpace> {
        let space = {
            let mut processes = self.processes.lock();
            let pid = processes.insert_with(AddressSpace::new);
            processes[pid].clone()
        };
        space.create_master_table(self);
        space
    }

    /// Creates an empty address space and returns its process id.
    pub fn create_process(&self) -> ProcessId {
        let space = self.insert_process();
        info!("process {} created", space.pid());
        space.pid()
    }

    /// Frees everything the process holds. Its id may be reused afterwards.
    pub fn destroy_process(&self, pid: ProcessId) -> VMResult<()> {
        let space = self
            .processes
            .lock()
            .mark_empty(pid)
            .ok_or(TrapCause::NoSuchProcess)?;
        space.destroy(self);
        info!("process {} destroyed", pid);
        Ok(())
    }

    /// Creates a new process whose address space is a copy of `pid`'s.
    pub fn clone_process(&self, pid: ProcessId) -> VMResult<ProcessId> {
        let source = self.process(pid)?;
        let space = self.insert_process();
        space.copy_from_space(self, &source);
        info!("process {} cloned into {}", pid, space.pid());
        Ok(space.pid())
    }

    /// Checks whether `addr` may be accessed with `mode`.
    ///
    /// Returns `PageFault` if the page is not resident; resolve it with
    /// `page_fault` and retry. A write access marks the page dirty.
    pub fn access(&self, pid: ProcessId, addr: VirtualAddress, mode: AccessType) -> VMResult<()> {
        let _databus = self.access_lock.lock();
        let space = self.process(pid)?;
        self.access_space(&space, addr, mode, true)
    }

    /// Makes the page behind `addr` resident.
    pub fn page_fault(&self, pid: ProcessId, addr: VirtualAddress) -> VMResult<()> {
        let space = self.process(pid)?;
        self.fault_space(&space, addr)
    }

    pub(crate) fn access_space(
        &self,
        space: &AddressSpace,
        addr: VirtualAddress,
        mode: AccessType,
        check_access: bool,
    ) -> VMResult<()> {
        match space.access(self, addr, mode, check_access)? {
            None => Ok(()),
            Some(route) => self.shared.access(self, route, mode),
        }
    }

    pub(crate) fn fault_space(&self, space: &AddressSpace, addr: VirtualAddress) -> VMResult<()> {
        match space.page_fault(self, addr)? {
            None => Ok(()),
            Some(route) => self.shared.page_fault(self, route),
        }
    }

    /// Physical location of `addr` if its page is resident right now.
    pub fn physical_address(&self, pid: ProcessId, addr: VirtualAddress) -> Option<PhysicalAddress> {
        let space = self.process(pid).ok()?;
        self.resolve_physical(&space, addr)
    }

    pub(crate) fn resolve_physical(&self, space: &AddressSpace, addr: VirtualAddress) -> Option<PhysicalAddress> {
        match space.translate(self, addr)? {
            Translation::Resident { frame, offset } => {
                Some(PhysicalAddress::new(PoolKind::User, frame, offset))
            }
            Translation::Shared(route) => self.shared.physical_address(self, route),
        }
    }

    fn pool(&self, kind: PoolKind) -> &FramePool {
        match kind {
            PoolKind::User => &self.user_pool,
            PoolKind::Kernel => &self.kernel_pool,
        }
    }

    /// Copies bytes out of a frame. Panics if the range leaves the frame.
    pub fn read_physical(&self, addr: PhysicalAddress, dest: &mut [u8]) {
        self.pool(addr.pool())
            .transfer(addr.offset(), &mut Transfer::Read(dest));
    }

    /// Copies bytes into a frame. Panics if the range leaves the frame.
    pub fn write_physical(&self, addr: PhysicalAddress, src: &[u8]) {
        self.pool(addr.pool())
            .transfer(addr.offset(), &mut Transfer::Write(src));
    }

    /// Reads `dest.len()` bytes at `addr`, faulting the page in as needed.
    /// The range has to stay inside of one page.
    pub fn read_virtual(&self, pid: ProcessId, addr: VirtualAddress, dest: &mut [u8]) -> VMResult<()> {
        if page_offset(addr) + dest.len() > PAGE_SIZE {
            return Err(TrapCause::PageBoundary.into());
        }
        let space = self.process(pid)?;
        self.transfer_virtual(&space, addr, AccessType::Read, &mut Transfer::Read(dest))
    }

    /// Writes `src` at `addr`, faulting the page in as needed.
    /// The range has to stay inside of one page.
    pub fn write_virtual(&self, pid: ProcessId, addr: VirtualAddress, src: &[u8]) -> VMResult<()> {
        if page_offset(addr) + src.len() > PAGE_SIZE {
            return Err(TrapCause::PageBoundary.into());
        }
        let space = self.process(pid)?;
        self.transfer_virtual(&space, addr, AccessType::Write, &mut Transfer::Write(src))
    }

    fn transfer_virtual(
        &self,
        space: &AddressSpace,
        addr: VirtualAddress,
        mode: AccessType,
        op: &mut Transfer<'_>,
    ) -> VMResult<()> {
        loop {
            let databus = self.access_lock.lock();
            match self.access_space(space, addr, mode, true) {
                Ok(()) => {}
                Err(VMError::PageFault) => {
                    drop(databus);
                    self.fault_space(space, addr)?;
                    continue;
                }
                Err(err) => return Err(err),
            }

            if self.copy_resident(space, addr, op) {
                return Ok(());
            }
            // evicted between the check and the copy
        }
    }

    fn copy_resident(&self, space: &AddressSpace, addr: VirtualAddress, op: &mut Transfer<'_>) -> bool {
        let route = {
            let _guard = self.kernel_pool.lock();
            match space.translate(self, addr) {
                Some(Translation::Resident { frame, offset }) => {
                    self.user_pool.transfer(frame * PAGE_SIZE + offset, op);
                    return true;
                }
                Some(Translation::Shared(route)) => route,
                None => return false,
            }
        };

        self.shared
            .with_backing(route.id, |backing| self.copy_resident(backing, route.addr, op))
    }

    /// Creates a segment of `pages` pages at the page aligned address `start`.
    /// Pages are zero-filled on their first fault.
    pub fn create_segment(
        &self,
        pid: ProcessId,
        start: VirtualAddress,
        pages: usize,
        access: AccessType,
    ) -> VMResult<()> {
        self.process(pid)?.create_segment(self, start, pages, access)
    }

    /// Creates a segment and fills it with the first `pages` pages of `content`.
    pub fn load_segment(
        &self,
        pid: ProcessId,
        start: VirtualAddress,
        pages: usize,
        access: AccessType,
        content: &[u8],
    ) -> VMResult<()> {
        self.process(pid)?
            .load_segment(self, start, pages, access, content)
    }

    /// Deletes the segment starting at `start`.
    pub fn delete_segment(&self, pid: ProcessId, start: VirtualAddress) -> VMResult<()> {
        self.process(pid)?.delete_segment(self, start)
    }

    /// Maps the shared segment `name` at `start`.
    ///
    /// The first mapping creates the segment with `pages` pages and rights
    /// `access`. Later mappings may be smaller but not larger, and their
    /// accesses are checked against their own `access`.
    pub fn create_shared_segment(
        &self,
        pid: ProcessId,
        start: VirtualAddress,
        pages: usize,
        name: &str,
        access: AccessType,
    ) -> VMResult<()> {
        self.process(pid)?
            .create_shared_segment(self, start, pages, name, access)
    }

    /// Removes `pid`'s mapping of shared segment `name`. The segment survives.
    pub fn disconnect_shared_segment(&self, pid: ProcessId, name: &str) -> VMResult<()> {
        self.process(pid)?.disconnect_shared_segment(self, name)
    }

    /// Unmaps shared segment `name` from every process and frees it.
    pub fn delete_shared_segment(&self, pid: ProcessId, name: &str) -> VMResult<()> {
        self.process(pid)?;
        self.shared.delete(self, name)
    }

    pub fn segment_count(&self, pid: ProcessId) -> VMResult<usize> {
        Ok(self.process(pid)?.segment_count())
    }

    pub fn shared_segments(&self) -> Vec<SharedSegmentInfo> {
        self.shared.infos()
    }

    pub fn free_frame_count(&self, pool: PoolKind) -> usize {
        self.pool(pool).free_frames()
    }

    pub fn reserved_kernel_frames(&self) -> usize {
        self.kernel_pool.reserved_frames()
    }

    pub fn free_cluster_count(&self) -> usize {
        self.swap.free_clusters()
    }

    pub fn swap_capacity(&self) -> usize {
        self.swap.capacity()
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn shared_segment_count(&self) -> usize {
        self.shared.count()
    }

    /// Clusters referenced by any process or shared segment right now.
    #[cfg(test)]
    pub(crate) fn referenced_clusters(&self) -> usize {
        let mut spaces: Vec<_> = self
            .processes
            .lock()
            .iter()
            .map(|(_, space)| space.clone())
            .collect();
        spaces.extend(self.shared.backings());

        let _guard = self.kernel_pool.lock();
        spaces
            .iter()
            .map(|space| space.referenced_clusters(self))
            .sum()
    }

    pub fn stats(&self) -> VMStats {
        VMStats {
            user_frames: self.user_pool.frame_count(),
            free_user_frames: self.free_frame_count(PoolKind::User),
            kernel_frames: self.kernel_pool.frame_count(),
            reserved_kernel_frames: self.reserved_kernel_frames(),
            free_kernel_frames: self.free_frame_count(PoolKind::Kernel),
            master_tables: self.kernel_pool.count_of(FrameType::SegmentTable),
            page_tables: self.kernel_pool.count_of(FrameType::PageTable),
            swap_clusters: self.swap_capacity(),
            free_clusters: self.free_cluster_count(),
            processes: self.process_count(),
            shared_segments: self.shared_segment_count(),
        }
    }

    /// Logs the resource usage and every address space.
    pub fn diag(&self) {
        let stats = self.stats();
        info!(
            "user pool: {}/{} frames free",
            stats.free_user_frames, stats.user_frames
        );
        info!(
            "kernel pool: {}/{} frames free, {} reserved, {} master tables, {} page tables",
            stats.free_kernel_frames,
            stats.kernel_frames,
            stats.reserved_kernel_frames,
            stats.master_tables,
            stats.page_tables
        );
        info!(
            "swap: {}/{} clusters free",
            stats.free_clusters, stats.swap_clusters
        );

        let spaces: Vec<_> = self
            .processes
            .lock()
            .iter()
            .map(|(_, space)| space.clone())
            .collect();
        for space in spaces {
            let master = match space.master_state() {
                MasterTable::Resident(frame) => format!("resident in frame {}", frame),
                MasterTable::SwappedOut(cluster) => format!("swapped out to cluster {}", cluster),
                MasterTable::Absent => "absent".to_owned(),
            };
            info!(
                "process {}: {} segments, master table {}",
                space.pid(),
                space.segment_count(),
                master
            );
        }

        for segment in self.shared.infos() {
            info!(
                "shared segment {:?}: {} pages, {:?}, {} subscribers",
                segment.name, segment.pages, segment.access, segment.subscribers
            );
        }
    }
}

impl Drop for VMSystem {
    fn drop(&mut self) {
        let shared = self.shared.count();
        if shared > 0 {
            warn!("vm system dropped with {} shared segments left", shared);
        }
        debug!("vm system dropped");
    }
}
