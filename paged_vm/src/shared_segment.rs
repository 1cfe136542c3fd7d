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

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{Arc, Weak},
};

use log::info;
use parking_lot::ReentrantMutex;

use crate::{
    access_type::AccessType,
    address_space::{AddressSpace, SharedRoute},
    frame_pool::PhysicalAddress,
    layout::{MAX_SEGMENT_PAGES, MAX_SHARED_SEGMENTS, SHARED_PID_BASE},
    util::{fatal, slot_vec::SlotVec},
    vm_error::{TrapCause, VMResult},
    vm_system::VMSystem,
};

struct Subscriber {
    space: Weak<AddressSpace>,
    /// segment table slot of the mapping inside the subscriber
    local_index: usize,
}

struct SharedSegmentControlBlock {
    name: String,
    /// holds the segment's pages as its only segment, starting at address 0
    backing: Arc<AddressSpace>,
    pages: usize,
    access: AccessType,
    subscribers: Vec<Subscriber>,
}

struct RegistryInner {
    names: HashMap<String, usize>,
    blocks: SlotVec<SharedSegmentControlBlock>,
}

/// Summary of one shared segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSegmentInfo {
    pub name: String,
    pub pages: usize,
    pub access: AccessType,
    pub subscribers: usize,
}

/// Named shared segments.
///
/// Every shared segment is backed by an address space of its own. Mappings
/// in process address spaces only record the segment id and the page's unit,
/// faults and accesses are forwarded to the backing space.
///
/// Lock order: the registry lock is taken before the kernel pool lock and
/// is held while forwarding, so a segment cannot vanish mid-access.
pub(crate) struct SharedSegmentRegistry {
    inner: ReentrantMutex<RefCell<RegistryInner>>,
}

impl SharedSegmentRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(RegistryInner {
                names: HashMap::new(),
                blocks: SlotVec::new(),
            })),
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<usize> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.names.get(name).copied()
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.lock().borrow().blocks.len()
    }

    pub(crate) fn pages(&self, id: usize) -> usize {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        match inner.blocks.get(id) {
            Some(block) => block.pages,
            None => fatal!("shared segment {} does not exist", id),
        }
    }

    /// Returns the id of segment `name`, creating it with `pages` pages and
    /// rights `access` if it does not exist yet.
    pub(crate) fn find_or_create(
        &self,
        sys: &VMSystem,
        name: &str,
        pages: usize,
        access: AccessType,
    ) -> VMResult<usize> {
        let guard = self.inner.lock();
        if let Some(id) = self.find(name) {
            return Ok(id);
        }
        if pages == 0 || pages > MAX_SEGMENT_PAGES {
            return Err(TrapCause::InvalidSize.into());
        }

        let (id, backing) = {
            let mut inner = guard.borrow_mut();
            if inner.blocks.len() >= MAX_SHARED_SEGMENTS {
                return Err(TrapCause::SharedSegmentLimit.into());
            }

            let id = inner.blocks.insert_with(|id| SharedSegmentControlBlock {
                name: name.to_owned(),
                backing: AddressSpace::new(SHARED_PID_BASE + id),
                pages,
                access,
                subscribers: Vec::new(),
            });
            inner.names.insert(name.to_owned(), id);
            (id, inner.blocks[id].backing.clone())
        };

        backing.create_master_table(sys);
        if let Err(err) = backing.create_segment(sys, 0, pages, access) {
            backing.destroy(sys);
            let mut inner = guard.borrow_mut();
            inner.names.remove(name);
            inner.blocks.mark_empty(id);
            return Err(err);
        }

        info!(
            "shared segment {:?} created: id {}, {} pages, {:?}",
            name, id, pages, access
        );
        Ok(id)
    }

    pub(crate) fn connect(&self, space: &AddressSpace, id: usize, local_index: usize) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        match inner.blocks.get_mut(id) {
            Some(block) => block.subscribers.push(Subscriber {
                space: space.downgrade(),
                local_index,
            }),
            None => fatal!("process {} connects to missing shared segment {}", space.pid(), id),
        }
    }

    /// Segment table slot of the first mapping of segment `id` in `space`.
    pub(crate) fn subscription(&self, space: &AddressSpace, id: usize) -> Option<usize> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .blocks
            .get(id)?
            .subscribers
            .iter()
            .find(|subscriber| space.is(&subscriber.space))
            .map(|subscriber| subscriber.local_index)
    }

    /// Removes the mapping of `id` held in segment table slot `local_index`
    /// of `space`. Returns false if there is no such subscription.
    ///
    /// A process may map one segment several times, so the slot identifies
    /// the mapping.
    pub(crate) fn disconnect(&self, space: &AddressSpace, id: usize, local_index: usize) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let Some(block) = inner.blocks.get_mut(id) else {
            return false;
        };
        match block.subscribers.iter().position(|subscriber| {
            subscriber.local_index == local_index && space.is(&subscriber.space)
        }) {
            Some(position) => {
                block.subscribers.swap_remove(position);
                true
            }
            None => false,
        }
    }

    /// Unmaps the segment from every subscriber and frees it.
    pub(crate) fn delete(&self, sys: &VMSystem, name: &str) -> VMResult<()> {
        let guard = self.inner.lock();
        let (id, subscribers) = {
            let mut inner = guard.borrow_mut();
            let id = *inner
                .names
                .get(name)
                .ok_or(TrapCause::UnknownSharedSegment)?;
            match inner.blocks.get_mut(id) {
                Some(block) => (id, core::mem::take(&mut block.subscribers)),
                None => fatal!("shared segment {:?} has a name but no control block", name),
            }
        };

        for subscriber in subscribers {
            if let Some(space) = subscriber.space.upgrade() {
                space.delete_segment_at(sys, subscriber.local_index, false);
            }
        }

        let block = {
            let mut inner = guard.borrow_mut();
            inner.names.remove(name);
            inner.blocks.mark_empty(id)
        };
        if let Some(block) = block {
            block.backing.destroy(sys);
        }

        info!("shared segment {:?} deleted", name);
        Ok(())
    }

    /// Runs `f` on the backing space of segment `id` with the registry locked.
    pub(crate) fn with_backing<R>(&self, id: usize, f: impl FnOnce(&Arc<AddressSpace>) -> R) -> R {
        let guard = self.inner.lock();
        let backing = match guard.borrow().blocks.get(id) {
            Some(block) => block.backing.clone(),
            None => fatal!("access to missing shared segment {}", id),
        };
        f(&backing)
    }

    /// Access checks already happened against the mapping's own rights.
    pub(crate) fn access(&self, sys: &VMSystem, route: SharedRoute, mode: AccessType) -> VMResult<()> {
        self.with_backing(route.id, |backing| {
            sys.access_space(backing, route.addr, mode, false)
        })
    }

    pub(crate) fn page_fault(&self, sys: &VMSystem, route: SharedRoute) -> VMResult<()> {
        self.with_backing(route.id, |backing| sys.fault_space(backing, route.addr))
    }

    pub(crate) fn physical_address(&self, sys: &VMSystem, route: SharedRoute) -> Option<PhysicalAddress> {
        self.with_backing(route.id, |backing| sys.resolve_physical(backing, route.addr))
    }

    #[cfg(test)]
    pub(crate) fn backings(&self) -> Vec<Arc<AddressSpace>> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .blocks
            .iter()
            .map(|(_, block)| block.backing.clone())
            .collect()
    }

    pub(crate) fn infos(&self) -> Vec<SharedSegmentInfo> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .blocks
            .iter()
            .map(|(_, block)| SharedSegmentInfo {
                name: block.name.clone(),
                pages: block.pages,
                access: block.access,
                subscribers: block.subscribers.len(),
            })
            .collect()
    }
}
