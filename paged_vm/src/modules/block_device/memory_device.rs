use super::BlockDeviceModule;
use crate::layout::{ClusterNo, CLUSTER_SIZE};

/// Swap device that keeps all clusters in a heap buffer.
pub struct MemoryBlockDeviceModule {
    data: Vec<u8>,
}

impl MemoryBlockDeviceModule {
    pub fn new(clusters: usize) -> Self {
        Self {
            data: vec![0u8; clusters * CLUSTER_SIZE],
        }
    }

    fn cluster_range(&self, cluster: ClusterNo, len: usize) -> Result<std::ops::Range<usize>, ()> {
        let start = cluster as usize * CLUSTER_SIZE;
        if len != CLUSTER_SIZE || start + CLUSTER_SIZE > self.data.len() {
            return Err(());
        }
        Ok(start..start + CLUSTER_SIZE)
    }
}

impl BlockDeviceModule for MemoryBlockDeviceModule {
    fn read_cluster(&mut self, cluster: ClusterNo, dest: &mut [u8]) -> Result<(), ()> {
        let range = self.cluster_range(cluster, dest.len())?;
        dest.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_cluster(&mut self, cluster: ClusterNo, src: &[u8]) -> Result<(), ()> {
        let range = self.cluster_range(cluster, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    fn cluster_count(&self) -> usize {
        self.data.len() / CLUSTER_SIZE
    }
}
