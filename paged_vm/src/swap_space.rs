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

use log::debug;
use parking_lot::Mutex;

use crate::{
    layout::{ClusterNo, CLUSTER_SIZE, MAX_CLUSTERS},
    modules::block_device::BlockDeviceModule,
    util::{ceil_div, fatal},
};

const WORD_BITS: usize = u32::BITS as usize;

/// Bitmap of free swap clusters, one bit per cluster and `1` meaning free.
///
/// Cluster `c` lives in word `c / 32` at bit `31 - c % 32`, so the lowest
/// free cluster of a word is its leading set bit.
pub(crate) struct DiskVacancyTable {
    words: Vec<u32>,
    capacity: usize,
    free: usize,
}

impl DiskVacancyTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut words = vec![u32::MAX; ceil_div(capacity, WORD_BITS)];

        // clusters past the capacity must never be handed out
        let tail = capacity % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = u32::MAX << (WORD_BITS - tail);
            }
        }

        Self {
            words,
            capacity,
            free: capacity,
        }
    }

    #[inline]
    fn position(cluster: ClusterNo) -> (usize, u32) {
        let cluster = cluster as usize;
        (cluster / WORD_BITS, 1 << (WORD_BITS - 1 - cluster % WORD_BITS))
    }

    /// Takes the lowest free cluster.
    pub(crate) fn acquire(&mut self) -> Option<ClusterNo> {
        let (index, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != 0)?;

        let bit = word.leading_zeros() as usize;
        *word &= !(1 << (WORD_BITS - 1 - bit));
        self.free -= 1;
        Some((index * WORD_BITS + bit) as ClusterNo)
    }

    pub(crate) fn release(&mut self, cluster: ClusterNo) {
        if cluster as usize >= self.capacity {
            fatal!("released cluster {} is out of range", cluster);
        }

        if self.is_free(cluster) {
            fatal!("cluster {} released twice", cluster);
        }
        let (index, mask) = Self::position(cluster);
        self.words[index] |= mask;
        self.free += 1;
    }

    pub(crate) fn is_free(&self, cluster: ClusterNo) -> bool {
        let (index, mask) = Self::position(cluster);
        (cluster as usize) < self.capacity && self.words[index] & mask != 0
    }

    #[inline]
    pub(crate) fn free_clusters(&self) -> usize {
        self.free
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Swap device plus its vacancy table.
///
/// Both sit behind their own leaf locks: nothing else is locked while either
/// one is held. Running out of clusters and failed transfers are fatal.
pub(crate) struct SwapSpace {
    vacancy: Mutex<DiskVacancyTable>,
    device: Mutex<Box<dyn BlockDeviceModule>>,
}

impl SwapSpace {
    /// Uses at most `MAX_CLUSTERS` clusters of the device.
    pub(crate) fn new(device: Box<dyn BlockDeviceModule>) -> Self {
        let capacity = device.cluster_count().min(MAX_CLUSTERS);
        debug!(
            "swap space: {} clusters ({} bytes)",
            capacity,
            capacity * CLUSTER_SIZE
        );

        Self {
            vacancy: Mutex::new(DiskVacancyTable::new(capacity)),
            device: Mutex::new(device),
        }
    }

    /// Number of clusters of `device` the swap space would manage.
    pub(crate) fn capacity_of(device: &dyn BlockDeviceModule) -> usize {
        device.cluster_count().min(MAX_CLUSTERS)
    }

    pub(crate) fn acquire(&self) -> ClusterNo {
        match self.vacancy.lock().acquire() {
            Some(cluster) => cluster,
            None => fatal!("swap space exhausted"),
        }
    }

    pub(crate) fn release(&self, cluster: ClusterNo) {
        self.vacancy.lock().release(cluster);
    }

    pub(crate) fn read(&self, cluster: ClusterNo, dest: &mut [u8]) {
        if self.device.lock().read_cluster(cluster, dest).is_err() {
            fatal!("could not read cluster {} from the swap device", cluster);
        }

        #[cfg(feature = "trace_frames")]
        log::trace!("swap in from cluster {}", cluster);
    }

    pub(crate) fn write(&self, cluster: ClusterNo, src: &[u8]) {
        if self.device.lock().write_cluster(cluster, src).is_err() {
            fatal!("could not write cluster {} to the swap device", cluster);
        }

        #[cfg(feature = "trace_frames")]
        log::trace!("swap out to cluster {}", cluster);
    }

    pub(crate) fn free_clusters(&self) -> usize {
        self.vacancy.lock().free_clusters()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.vacancy.lock().capacity()
    }

    #[cfg(test)]
    pub(crate) fn is_free(&self, cluster: ClusterNo) -> bool {
        self.vacancy.lock().is_free(cluster)
    }
}
