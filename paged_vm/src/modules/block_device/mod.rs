mod file_device;
mod memory_device;

pub use file_device::FileBlockDeviceModule;
pub use memory_device::MemoryBlockDeviceModule;

use crate::layout::ClusterNo;

/// Swap device that stores fixed-size clusters of `CLUSTER_SIZE` bytes.
///
/// Errors carry no detail. The system treats any failed transfer as fatal,
/// so there is nothing a caller could do with one.
pub trait BlockDeviceModule: Send {
    /// Reads cluster `cluster` into `dest`, which is exactly one cluster long.
    fn read_cluster(&mut self, cluster: ClusterNo, dest: &mut [u8]) -> Result<(), ()>;

    /// Writes `src`, which is exactly one cluster long, to cluster `cluster`.
    fn write_cluster(&mut self, cluster: ClusterNo, src: &[u8]) -> Result<(), ()>;

    /// Number of clusters this device holds.
    fn cluster_count(&self) -> usize;
}

impl<T: BlockDeviceModule + ?Sized> BlockDeviceModule for Box<T> {
    fn read_cluster(&mut self, cluster: ClusterNo, dest: &mut [u8]) -> Result<(), ()> {
        (**self).read_cluster(cluster, dest)
    }

    fn write_cluster(&mut self, cluster: ClusterNo, src: &[u8]) -> Result<(), ()> {
        (**self).write_cluster(cluster, src)
    }

    fn cluster_count(&self) -> usize {
        (**self).cluster_count()
    }
}
