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
    fs::{remove_file, File},
    io::{Read, Seek, SeekFrom, Write},
    mem::ManuallyDrop,
    path::Path,
};

use super::BlockDeviceModule;
use crate::layout::{ClusterNo, CLUSTER_SIZE};

/// Swap device backed by a regular file that is deleted again on drop.
pub struct FileBlockDeviceModule {
    /// underlying swap file
    file: ManuallyDrop<File>,

    /// path of file, save for deleting file later
    file_path: String,

    /// cached cluster count, so no `metadata` call necessary
    clusters: usize,
}

impl FileBlockDeviceModule {
    /// Creates (or truncates) the file at `filepath` and sizes it to `clusters` clusters.
    pub fn new(filepath: String, clusters: usize) -> std::io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .truncate(true)
            .create(true)
            .open(filepath.clone())?;

        file.set_len((clusters * CLUSTER_SIZE) as u64)?;

        Ok(Self {
            file: ManuallyDrop::new(file),
            file_path: filepath,
            clusters,
        })
    }

    fn seek_cluster(&mut self, cluster: ClusterNo, len: usize) -> Result<(), ()> {
        if cluster as usize >= self.clusters || len != CLUSTER_SIZE {
            return Err(());
        }

        self.file
            .seek(SeekFrom::Start((cluster as usize * CLUSTER_SIZE) as u64))
            .map_err(|_| ())?;
        Ok(())
    }
}

impl BlockDeviceModule for FileBlockDeviceModule {
    fn read_cluster(&mut self, cluster: ClusterNo, dest: &mut [u8]) -> Result<(), ()> {
        self.seek_cluster(cluster, dest.len())?;
        self.file.read_exact(dest).map_err(|_| ())?;

        Ok(())
    }

    fn write_cluster(&mut self, cluster: ClusterNo, src: &[u8]) -> Result<(), ()> {
        self.seek_cluster(cluster, src.len())?;
        self.file.write_all(src).map_err(|_| ())?;

        Ok(())
    }

    fn cluster_count(&self) -> usize {
        self.clusters
    }
}

impl Drop for FileBlockDeviceModule {
    fn drop(&mut self) {
        // close the file before removing it, it is never accessed again afterwards
        unsafe {
            ManuallyDrop::drop(&mut self.file);
        }

        if Path::new(self.file_path.as_str()).exists() {
            let _ = remove_file(self.file_path.as_str());
        }
    }
}
