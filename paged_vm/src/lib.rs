mod access_type;
mod address_space;
mod eviction;
mod frame_pool;
mod layout;
mod shared_segment;
mod swap_space;
mod util;
mod vm_config;
mod vm_error;
mod vm_system;

#[cfg(test)]
mod test;

pub mod modules;

pub use access_type::AccessType;
pub use frame_pool::{PhysicalAddress, PoolKind};
pub use layout::{
    ClusterNo, ProcessId, VirtualAddress, ADDRESS_SPACE_SIZE, CLUSTER_SIZE, L1_ENTRIES,
    L2_ENTRIES, MAX_SEGMENTS, MAX_SEGMENT_PAGES, MAX_SHARED_SEGMENTS, PAGE_SIZE,
};
pub use shared_segment::SharedSegmentInfo;
pub use vm_config::VMConfig;
pub use vm_error::{ConfigError, Status, TrapCause, VMError, VMResult};
pub use vm_system::{VMStats, VMSystem};
