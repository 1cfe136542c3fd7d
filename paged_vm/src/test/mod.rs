use crate::{
    modules::block_device::FileBlockDeviceModule, AccessType, ProcessId, VMConfig, VMError,
    VMResult, VMSystem, VirtualAddress, PAGE_SIZE,
};

mod eviction;
mod shared;

pub(crate) const SEED: u64 = 5446535461589659585;
pub(crate) const TEST_CLUSTERS: usize = 1024;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn get_test_system(
    test_name: &str,
    user_frames: usize,
    kernel_frames: usize,
    clusters: usize,
) -> VMSystem {
    init_logger();
    let device = FileBlockDeviceModule::new(format!("/tmp/{}.tmp", test_name), clusters).unwrap();

    VMSystem::new(
        VMConfig {
            user_frames,
            kernel_frames,
            victim_seed: SEED,
        },
        device,
    )
    .unwrap()
}

/// System whose kernel pool has exactly `usable` frames besides the reserved ones.
pub(crate) fn get_tight_test_system(test_name: &str, user_frames: usize, usable: usize) -> VMSystem {
    let mut config = VMConfig {
        user_frames,
        kernel_frames: usable,
        victim_seed: SEED,
    };
    // the reservation grows with the kernel pool itself
    while config.kernel_frames != config.reserved_kernel_frames(TEST_CLUSTERS) + usable {
        config.kernel_frames = config.reserved_kernel_frames(TEST_CLUSTERS) + usable;
    }
    get_test_system(test_name, user_frames, config.kernel_frames, TEST_CLUSTERS)
}

#[inline]
pub(crate) fn page(number: usize) -> VirtualAddress {
    (number * PAGE_SIZE) as VirtualAddress
}

/// Accesses `addr` like a cpu would: page faults are resolved and retried.
pub(crate) fn touch(system: &VMSystem, pid: ProcessId, addr: VirtualAddress, mode: AccessType) -> VMResult<()> {
    loop {
        match system.access(pid, addr, mode) {
            Err(VMError::PageFault) => system.page_fault(pid, addr)?,
            other => return other,
        }
    }
}

pub(crate) fn write_u32(system: &VMSystem, pid: ProcessId, addr: VirtualAddress, value: u32) {
    system.write_virtual(pid, addr, &value.to_le_bytes()).unwrap();
}

pub(crate) fn read_u32(system: &VMSystem, pid: ProcessId, addr: VirtualAddress) -> u32 {
    let mut buffer = [0u8; 4];
    system.read_virtual(pid, addr, &mut buffer).unwrap();
    u32::from_le_bytes(buffer)
}
