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

pub(crate) mod frame_table;

use std::{cell::RefCell, collections::VecDeque};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::{
    address_space::tables::{L1Status, PageTableL1Entry},
    layout::{ClusterNo, L1_ENTRIES, PAGE_SIZE},
    modules::victim_selection::VictimSelectionModule,
    util::fatal,
};

use frame_table::{FrameFlags, FrameOwner, FrameTableEntry, FrameType, Victim};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// frames backing user pages
    User,
    /// frames holding master tables, page tables and bookkeeping
    Kernel,
}

/// Byte position inside one of the two frame pools.
///
/// Stays meaningful only as long as the page it was resolved from is not
/// evicted. Use it right away or go through the virtual accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalAddress {
    pool: PoolKind,
    offset: usize,
}

impl PhysicalAddress {
    pub(crate) fn new(pool: PoolKind, frame: usize, offset_in_frame: usize) -> Self {
        debug_assert!(offset_in_frame < PAGE_SIZE);
        Self {
            pool,
            offset: frame * PAGE_SIZE + offset_in_frame,
        }
    }

    pub fn pool(&self) -> PoolKind {
        self.pool
    }

    /// offset from the start of the pool in bytes
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn frame(&self) -> usize {
        self.offset / PAGE_SIZE
    }

    pub fn offset_in_frame(&self) -> usize {
        self.offset % PAGE_SIZE
    }
}

/// Direction and buffer of a byte copy into or out of a pool.
pub(crate) enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(dest) => dest.len(),
            Transfer::Write(src) => src.len(),
        }
    }
}

pub(crate) struct FrameArena {
    table: Vec<FrameTableEntry>,
    memory: Box<[u8]>,
}

impl FrameArena {
    #[inline]
    fn bytes(&self, ordinal: usize) -> &[u8] {
        &self.memory[ordinal * PAGE_SIZE..(ordinal + 1) * PAGE_SIZE]
    }

    #[inline]
    fn bytes_mut(&mut self, ordinal: usize) -> &mut [u8] {
        &mut self.memory[ordinal * PAGE_SIZE..(ordinal + 1) * PAGE_SIZE]
    }

    /// First present page table of master table `master` that is not pinned.
    fn first_unpinned_child(&self, master: usize) -> Option<usize> {
        let table = self.bytes(master);
        (0..L1_ENTRIES)
            .map(|slot| PageTableL1Entry::decode(table, slot))
            .filter(|entry| entry.status == L1Status::Present)
            .map(|entry| entry.block as usize)
            .find(|child| self.table.get(*child).is_some_and(|entry| entry.is_evictable()))
    }
}

/// Held while a sequence of table updates has to look atomic to evictors.
pub(crate) type TableGuard<'a> = ReentrantMutexGuard<'a, RefCell<FrameArena>>;

/// A pool of equally sized frames plus the frame table describing them.
///
/// The frame table and the frame memory share one reentrant lock. Every
/// access borrows the cell only for the duration of a leaf operation and
/// never calls out while borrowed, so a thread that already holds the lock
/// can freely nest operations.
pub(crate) struct FramePool {
    kind: PoolKind,
    frame_count: usize,
    reserved: usize,
    arena: ReentrantMutex<RefCell<FrameArena>>,
    free_list: Mutex<VecDeque<usize>>,
    victim_selection: Mutex<Box<dyn VictimSelectionModule>>,
}

impl FramePool {
    /// Creates a pool of `frame_count` zeroed frames of which the first
    /// `reserved` ones are never handed out.
    pub(crate) fn new(
        kind: PoolKind,
        frame_count: usize,
        reserved: usize,
        victim_selection: Box<dyn VictimSelectionModule>,
    ) -> Self {
        debug_assert!(reserved < frame_count);

        let mut table = vec![FrameTableEntry::default(); frame_count];
        for entry in table.iter_mut().take(reserved) {
            *entry = FrameTableEntry::reserved();
        }

        Self {
            kind,
            frame_count,
            reserved,
            arena: ReentrantMutex::new(RefCell::new(FrameArena {
                table,
                memory: vec![0u8; frame_count * PAGE_SIZE].into_boxed_slice(),
            })),
            free_list: Mutex::new((reserved..frame_count).collect()),
            victim_selection: Mutex::new(victim_selection),
        }
    }

    #[inline]
    pub(crate) fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    pub(crate) fn reserved_frames(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub(crate) fn lock(&self) -> TableGuard<'_> {
        self.arena.lock()
    }

    pub(crate) fn free_frames(&self) -> usize {
        self.free_list.lock().len()
    }

    pub(crate) fn pop_free(&self) -> Option<usize> {
        self.free_list.lock().pop_front()
    }

    /// Number of frames that currently have type `frame_type`.
    pub(crate) fn count_of(&self, frame_type: FrameType) -> usize {
        let guard = self.arena.lock();
        let arena = guard.borrow();
        arena
            .table
            .iter()
            .filter(|entry| entry.frame_type == frame_type)
            .count()
    }

    /// Takes ownership of a frame obtained from `pop_free`.
    pub(crate) fn assign(&self, ordinal: usize, frame_type: FrameType, owner: FrameOwner, pinned: bool) {
        let guard = self.arena.lock();
        let mut arena = guard.borrow_mut();
        let entry = &mut arena.table[ordinal];
        if entry.frame_type != FrameType::Unused {
            fatal!(
                "{:?} frame {} handed out twice (currently {:?})",
                self.kind,
                ordinal,
                entry.frame_type
            );
        }

        *entry = FrameTableEntry {
            flags: if pinned {
                FrameFlags::LOCKED
            } else {
                FrameFlags::empty()
            },
            frame_type,
            owner,
            pins: pinned as u16,
            origin: None,
        };

        #[cfg(feature = "trace_frames")]
        log::trace!("{:?} frame {} -> {:?}", self.kind, ordinal, frame_type);
    }

    /// Returns the frame to the free list and hands back its origin cluster.
    pub(crate) fn release(&self, ordinal: usize) -> Option<ClusterNo> {
        let origin = {
            let guard = self.arena.lock();
            let mut arena = guard.borrow_mut();
            let entry = &mut arena.table[ordinal];
            if !entry.frame_type.is_in_use() || entry.is_locked() {
                fatal!(
                    "cannot release {:?} frame {} ({:?}, {} pins)",
                    self.kind,
                    ordinal,
                    entry.frame_type,
                    entry.pins
                );
            }
            core::mem::take(entry).origin
        };

        self.free_list.lock().push_back(ordinal);
        origin
    }

    pub(crate) fn entry(&self, ordinal: usize) -> FrameTableEntry {
        let guard = self.arena.lock();
        let arena = guard.borrow();
        arena.table[ordinal].clone()
    }

    pub(crate) fn set_origin(&self, ordinal: usize, origin: Option<ClusterNo>) {
        let guard = self.arena.lock();
        guard.borrow_mut().table[ordinal].origin = origin;
    }

    pub(crate) fn mark_dirty(&self, ordinal: usize) {
        let guard = self.arena.lock();
        guard.borrow_mut().table[ordinal].flags |= FrameFlags::DIRTY;
    }

    /// Pins the frame unless it is free. Pinned frames are never evicted.
    pub(crate) fn pin(&self, ordinal: usize) -> Option<FramePin<'_>> {
        let guard = self.arena.lock();
        let mut arena = guard.borrow_mut();
        let entry = &mut arena.table[ordinal];
        if !entry.frame_type.is_in_use() {
            return None;
        }

        entry.pins += 1;
        entry.flags |= FrameFlags::LOCKED;
        Some(FramePin {
            pool: self,
            ordinal,
        })
    }

    /// Wraps the pin taken by `assign(.., pinned = true)`.
    pub(crate) fn adopt_pin(&self, ordinal: usize) -> FramePin<'_> {
        debug_assert!(self.entry(ordinal).is_locked());
        FramePin {
            pool: self,
            ordinal,
        }
    }

    fn unpin(&self, ordinal: usize) {
        let guard = self.arena.lock();
        let mut arena = guard.borrow_mut();
        let entry = &mut arena.table[ordinal];
        if entry.pins == 0 {
            fatal!("{:?} frame {} unpinned more often than pinned", self.kind, ordinal);
        }

        entry.pins -= 1;
        if entry.pins == 0 {
            entry.flags.remove(FrameFlags::LOCKED);
        }
    }

    fn check_type(&self, arena: &FrameArena, ordinal: usize, expected: FrameType) {
        match arena.table.get(ordinal) {
            Some(entry) if entry.frame_type == expected => {}
            Some(entry) => fatal!(
                "{:?} frame {} holds {:?}, expected {:?}",
                self.kind,
                ordinal,
                entry.frame_type,
                expected
            ),
            None => fatal!("{:?} frame {} is out of bounds", self.kind, ordinal),
        }
    }

    /// Read view of a frame that must currently hold `expected`.
    pub(crate) fn frame<R>(&self, ordinal: usize, expected: FrameType, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.arena.lock();
        let arena = guard.borrow();
        self.check_type(&arena, ordinal, expected);
        f(arena.bytes(ordinal))
    }

    /// Write view of a frame that must currently hold `expected`.
    pub(crate) fn frame_mut<R>(
        &self,
        ordinal: usize,
        expected: FrameType,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let guard = self.arena.lock();
        let mut arena = guard.borrow_mut();
        self.check_type(&arena, ordinal, expected);
        f(arena.bytes_mut(ordinal))
    }

    pub(crate) fn copy_frame(&self, from: usize, to: usize) {
        let guard = self.arena.lock();
        let mut arena = guard.borrow_mut();
        let start = from * PAGE_SIZE;
        arena.memory.copy_within(start..start + PAGE_SIZE, to * PAGE_SIZE);
    }

    /// Copies between `op`'s buffer and the pool starting at byte `offset`.
    /// The copy has to stay inside of a single frame.
    pub(crate) fn transfer(&self, offset: usize, op: &mut Transfer<'_>) {
        let len = op.len();
        if offset / PAGE_SIZE >= self.frame_count || offset % PAGE_SIZE + len > PAGE_SIZE {
            fatal!(
                "{} bytes at {:?} pool offset {} leave the frame",
                len,
                self.kind,
                offset
            );
        }

        let guard = self.arena.lock();
        let mut arena = guard.borrow_mut();
        match op {
            Transfer::Read(dest) => dest.copy_from_slice(&arena.memory[offset..offset + len]),
            Transfer::Write(src) => arena.memory[offset..offset + len].copy_from_slice(src),
        }
    }

    /// Picks a frame to evict.
    ///
    /// The search starts at the module's draw and walks forward (wrapping
    /// around) until it finds an unpinned, used frame that is not `exclude`.
    /// A master table redirects the search to its first unpinned page table,
    /// so masters are only evicted once all their page tables are gone or
    /// pinned. Panics if every usable frame is pinned.
    pub(crate) fn select_victim(&self, exclude: Option<usize>) -> Victim {
        let guard = self.arena.lock();
        let arena = guard.borrow();
        let usable = self.reserved..self.frame_count;
        let mut place = self.victim_selection.lock().draw(usable.clone());

        for _ in 0..2 * usable.len() {
            if arena.table[place].frame_type == FrameType::SegmentTable {
                if let Some(child) = arena.first_unpinned_child(place) {
                    place = child;
                }
            }

            let entry = &arena.table[place];
            if entry.is_evictable() && Some(place) != exclude {
                #[cfg(feature = "trace_frames")]
                log::trace!("{:?} victim {} ({:?})", self.kind, place, entry.frame_type);

                return entry.as_victim(place);
            }

            place += 1;
            if place == self.frame_count {
                place = self.reserved;
            }
        }

        fatal!("every {:?} frame is pinned, nothing to evict", self.kind)
    }
}

/// Keeps a frame resident until dropped. Pins nest.
pub(crate) struct FramePin<'a> {
    pool: &'a FramePool,
    ordinal: usize,
}

impl FramePin<'_> {
    #[inline]
    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl Drop for FramePin<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.ordinal);
    }
}

#[cfg(test)]
mod test {
    use super::{
        frame_table::{FrameOwner, FrameType},
        FramePool, PoolKind, Transfer,
    };
    use crate::{
        address_space::tables::PageTableL1Entry,
        layout::PAGE_SIZE,
        modules::victim_selection::{FixedVictimSelectionModule, RandomVictimSelectionModule},
    };

    fn fixed_pool(kind: PoolKind, frames: usize, reserved: usize, start: usize) -> FramePool {
        FramePool::new(
            kind,
            frames,
            reserved,
            Box::new(FixedVictimSelectionModule::new(start)),
        )
    }

    fn take(pool: &FramePool, frame_type: FrameType) -> usize {
        let ordinal = pool.pop_free().unwrap();
        pool.assign(ordinal, frame_type, FrameOwner::None, false);
        ordinal
    }

    #[test]
    fn test_free_list() {
        let pool = fixed_pool(PoolKind::User, 4, 1, 0);
        assert_eq!(pool.free_frames(), 3);
        assert_eq!(pool.count_of(FrameType::Reserved), 1);

        let a = take(&pool, FrameType::UserPage);
        let b = take(&pool, FrameType::UserPage);
        let c = take(&pool, FrameType::UserPage);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(pool.pop_free(), None);

        pool.set_origin(b, Some(17));
        assert_eq!(pool.release(b), Some(17));
        assert_eq!(pool.release(a), None);
        assert_eq!(pool.free_frames(), 2);
        assert_eq!(pool.entry(b).frame_type, FrameType::Unused);
        assert_eq!(pool.entry(b).origin, None);
    }

    #[test]
    fn test_pins_nest() {
        let pool = fixed_pool(PoolKind::User, 2, 0, 0);
        let frame = take(&pool, FrameType::UserPage);

        let outer = pool.pin(frame).unwrap();
        {
            let _inner = pool.pin(frame).unwrap();
            assert_eq!(pool.entry(frame).pins, 2);
        }
        assert!(pool.entry(frame).is_locked());
        drop(outer);
        assert!(!pool.entry(frame).is_locked());

        // free frames cannot be pinned
        let free = pool.pop_free().unwrap();
        assert!(pool.pin(free).is_none());
    }

    #[test]
    fn test_victim_skips_pinned_unused_and_excluded() {
        let pool = fixed_pool(PoolKind::User, 6, 1, 2);
        for _ in 1..6 {
            take(&pool, FrameType::UserPage);
        }
        pool.release(4);

        assert_eq!(pool.select_victim(None).ordinal, 2);
        assert_eq!(pool.select_victim(Some(2)).ordinal, 3);

        let _pin2 = pool.pin(2).unwrap();
        let _pin3 = pool.pin(3).unwrap();
        let victim = pool.select_victim(None);
        assert_eq!(victim.ordinal, 5);
        assert!(victim.dirty);
        assert_eq!(victim.cluster, None);

        let _pin5 = pool.pin(5).unwrap();
        // wraps around behind the reserved frame
        assert_eq!(pool.select_victim(None).ordinal, 1);
    }

    #[test]
    fn test_victim_clean_with_origin() {
        let pool = fixed_pool(PoolKind::User, 2, 0, 0);
        let frame = take(&pool, FrameType::UserPage);
        pool.set_origin(frame, Some(3));

        let victim = pool.select_victim(None);
        assert_eq!((victim.ordinal, victim.dirty, victim.cluster), (frame, false, Some(3)));

        pool.mark_dirty(frame);
        assert!(pool.select_victim(None).dirty);
    }

    #[test]
    fn test_master_redirects_to_page_table() {
        let pool = fixed_pool(PoolKind::Kernel, 6, 2, 2);
        let master = take(&pool, FrameType::SegmentTable);
        take(&pool, FrameType::PageTable);
        let child = take(&pool, FrameType::PageTable);
        assert_eq!((master, child), (2, 4));
        pool.set_l1_entry(master, 7, PageTableL1Entry::present(child));

        assert_eq!(pool.select_victim(None).ordinal, child);

        // a pinned page table keeps the master from being redirected
        let _child_pin = pool.pin(child).unwrap();
        assert_eq!(pool.select_victim(None).ordinal, master);
    }

    #[test]
    #[should_panic(expected = "nothing to evict")]
    fn test_all_pinned_panics() {
        let pool = FramePool::new(
            PoolKind::User,
            3,
            0,
            Box::new(RandomVictimSelectionModule::new(1)),
        );
        let mut pins = Vec::new();
        for _ in 0..3 {
            let frame = take(&pool, FrameType::UserPage);
            pins.push(pool.pin(frame).unwrap());
        }
        pool.select_victim(None);
    }

    #[test]
    fn test_transfer_and_copy() {
        let pool = fixed_pool(PoolKind::User, 3, 0, 0);
        let a = take(&pool, FrameType::UserPage);
        let b = take(&pool, FrameType::UserPage);

        pool.transfer(a * PAGE_SIZE + 1000, &mut Transfer::Write(&[1, 2, 3, 4]));
        pool.copy_frame(a, b);

        let mut buffer = [0u8; 4];
        pool.transfer(b * PAGE_SIZE + 1000, &mut Transfer::Read(&mut buffer));
        assert_eq!(buffer, [1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "leave the frame")]
    fn test_transfer_crossing_frames_panics() {
        let pool = fixed_pool(PoolKind::User, 3, 0, 0);
        pool.transfer(PAGE_SIZE - 2, &mut Transfer::Write(&[1, 2, 3, 4]));
    }

    #[test]
    #[should_panic(expected = "expected PageTable")]
    fn test_typed_view_checks_type() {
        let pool = fixed_pool(PoolKind::Kernel, 2, 0, 0);
        let frame = take(&pool, FrameType::SegmentTable);
        pool.l2_entry(frame, 0);
    }
}
