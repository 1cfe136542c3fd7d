use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{
    get_test_system, get_tight_test_system, page, read_u32, touch, write_u32, SEED, TEST_CLUSTERS,
};
use crate::{AccessType, VMConfig, VMError, VMSystem, PAGE_SIZE};

fn pattern(pid: usize, page: usize) -> u32 {
    (pid as u32) << 24 | (page as u32 * 7919) & 0xFF_FFFF
}

#[test]
fn test_minimal_kernel_pool_round_trip() {
    let system = get_tight_test_system("test_minimal_kernel_pool_round_trip", 8, 2);
    assert_eq!(system.stats().kernel_frames, 6);
    assert_eq!(system.stats().reserved_kernel_frames, 4);

    let pid = system.create_process();
    system
        .create_segment(pid, 0, 40, AccessType::ReadWrite)
        .unwrap();

    for i in 0..40 {
        write_u32(&system, pid, page(i) + (i * 4) as u32, pattern(pid, i));
    }

    let mut rand = SmallRng::seed_from_u64(SEED);
    for _ in 0..400 {
        let i = rand.gen_range(0..40);
        assert_eq!(read_u32(&system, pid, page(i) + (i * 4) as u32), pattern(pid, i));
    }
    // only the written word is set
    assert_eq!(read_u32(&system, pid, page(3)), 0);

    let stats = system.stats();
    assert_eq!(stats.free_user_frames, 0);
    assert_eq!((stats.master_tables, stats.page_tables), (1, 1));
}

#[test]
fn test_clusters_never_exceed_pages() {
    let system = get_test_system("test_clusters_never_exceed_pages", 2, 16, TEST_CLUSTERS);
    let pid = system.create_process();
    system
        .create_segment(pid, page(64), 6, AccessType::ReadWrite)
        .unwrap();

    let mut rand = SmallRng::seed_from_u64(SEED);
    let mut shadow = [0u32; 6];
    for round in 0..300 {
        let i = rand.gen_range(0..6);
        if round % 3 == 0 {
            shadow[i] = rand.gen();
            write_u32(&system, pid, page(64 + i) + 512, shadow[i]);
        } else {
            assert_eq!(read_u32(&system, pid, page(64 + i) + 512), shadow[i]);
        }

        // every page holds at most one cluster, resident or not
        let stats = system.stats();
        assert!(stats.swap_clusters - stats.free_clusters <= 6);
    }
}

#[test]
fn test_master_tables_swap_out() {
    // three usable kernel frames for four processes
    let system = get_tight_test_system("test_master_tables_swap_out", 8, 3);
    let pids: Vec<_> = (0..4).map(|_| system.create_process()).collect();
    for pid in &pids {
        // two page tables per process
        system
            .create_segment(*pid, page(250), 12, AccessType::ReadWrite)
            .unwrap();
    }

    for round in 0..3 {
        for pid in &pids {
            for i in 0..12 {
                write_u32(&system, *pid, page(250 + i) + 64, pattern(*pid, i) + round);
            }
        }
        for pid in pids.iter().rev() {
            for i in (0..12).rev() {
                assert_eq!(
                    read_u32(&system, *pid, page(250 + i) + 64),
                    pattern(*pid, i) + round
                );
            }
        }
    }

    let stats = system.stats();
    assert!(stats.master_tables + stats.page_tables <= 3);
    assert!(stats.master_tables < 4);
}

#[test]
fn test_destroy_releases_everything() {
    let system = get_tight_test_system("test_destroy_releases_everything", 4, 3);
    let initial = system.stats();

    let first = system.create_process();
    let second = system.create_process();
    for pid in [first, second] {
        system
            .create_segment(pid, page(200), 100, AccessType::ReadWrite)
            .unwrap();
        for i in (0..100).step_by(3) {
            touch(&system, pid, page(200 + i), AccessType::Write).unwrap();
        }
    }
    // forces the first process' tables out again
    for i in 0..20 {
        touch(&system, second, page(200 + i), AccessType::Read).unwrap();
    }

    system.destroy_process(first).unwrap();
    system.destroy_process(second).unwrap();
    assert_eq!(system.stats(), initial);
}

#[test]
fn test_access_reports_faults_after_eviction() {
    let system = get_test_system("test_access_reports_faults_after_eviction", 1, 16, TEST_CLUSTERS);
    let pid = system.create_process();
    system
        .create_segment(pid, 0, 2, AccessType::ReadWrite)
        .unwrap();

    write_u32(&system, pid, 0, 1);
    assert_eq!(system.access(pid, 0, AccessType::Read), Ok(()));

    // the only frame moves to the second page
    write_u32(&system, pid, page(1), 2);
    assert_eq!(system.access(pid, 0, AccessType::Read), Err(VMError::PageFault));
    assert_eq!(system.physical_address(pid, 0), None);
    assert_eq!(read_u32(&system, pid, 0), 1);
    assert_eq!(read_u32(&system, pid, page(1)), 2);
}

#[test]
#[should_panic(expected = "swap space exhausted")]
fn test_swap_exhaustion_is_fatal() {
    let system = get_test_system("test_swap_exhaustion_is_fatal", 1, 8, 2);
    let pid = system.create_process();
    system
        .create_segment(pid, 0, 4, AccessType::ReadWrite)
        .unwrap();
    for i in 0..4 {
        write_u32(&system, pid, page(i), i as u32);
    }
}

#[test]
fn test_memory_device() {
    use crate::modules::block_device::MemoryBlockDeviceModule;

    super::init_logger();
    let system = VMSystem::new(
        VMConfig {
            user_frames: 2,
            kernel_frames: 8,
            victim_seed: SEED,
        },
        MemoryBlockDeviceModule::new(64),
    )
    .unwrap();
    let pid = system.create_process();
    system
        .create_segment(pid, 0, 5, AccessType::ReadWrite)
        .unwrap();

    let mut data = [0u8; PAGE_SIZE];
    for i in 0..5 {
        data.fill(i as u8 + 1);
        system.write_virtual(pid, page(i), &data).unwrap();
    }
    for i in 0..5 {
        system.read_virtual(pid, page(i), &mut data).unwrap();
        assert!(data.iter().all(|x| *x == i as u8 + 1));
    }
}

#[test]
fn test_fixed_victim_selection() {
    use crate::{
        modules::{
            block_device::MemoryBlockDeviceModule, victim_selection::FixedVictimSelectionModule,
        },
        PoolKind,
    };

    super::init_logger();
    let system = VMSystem::with_victim_selection(
        VMConfig {
            user_frames: 2,
            kernel_frames: 8,
            victim_seed: SEED,
        },
        MemoryBlockDeviceModule::new(32),
        FixedVictimSelectionModule::new(0),
        FixedVictimSelectionModule::new(0),
    )
    .unwrap();
    assert_eq!(system.swap_capacity(), 32);
    assert_eq!(system.reserved_kernel_frames(), 4);
    assert_eq!(system.free_frame_count(PoolKind::User), 2);

    let pid = system.create_process();
    assert_eq!(system.process_count(), 1);
    system
        .create_segment(pid, 0, 3, AccessType::ReadWrite)
        .unwrap();
    for i in 0..3 {
        write_u32(&system, pid, page(i), 10 + i as u32);
    }

    // frame 0 is always the victim, so the second page never leaves frame 1
    let second = system.physical_address(pid, page(1)).unwrap();
    assert_eq!(second.frame(), 1);
    for _ in 0..5 {
        for i in [0, 2] {
            assert_eq!(read_u32(&system, pid, page(i)), 10 + i as u32);
            assert_eq!(system.physical_address(pid, page(i)).unwrap().frame(), 0);
        }
        assert_eq!(system.physical_address(pid, page(1)), Some(second));
    }
    assert_eq!(system.free_frame_count(PoolKind::User), 0);
    assert_eq!(system.free_cluster_count(), 30);
    assert_eq!(system.shared_segment_count(), 0);
}

#[test]
fn test_cluster_conservation() {
    let system = get_tight_test_system("test_cluster_conservation", 3, 6);
    let capacity = system.swap_capacity();
    let check = |step: &str| {
        assert_eq!(
            system.free_cluster_count() + system.referenced_clusters(),
            capacity,
            "after {}",
            step
        );
    };
    check("start");

    let pids: Vec<_> = (0..3).map(|_| system.create_process()).collect();
    for (n, pid) in pids.iter().enumerate() {
        system
            .create_segment(*pid, page(250), 10, AccessType::ReadWrite)
            .unwrap();
        system
            .create_shared_segment(*pid, page(1000 + n * 300), 6, "conserved", AccessType::ReadWrite)
            .unwrap();
    }
    check("create");

    let mut rand = SmallRng::seed_from_u64(SEED);
    for round in 0..300 {
        let n = rand.gen_range(0..pids.len());
        let pid = pids[n];
        let addr = if rand.gen_bool(0.3) {
            page(1000 + n * 300 + rand.gen_range(0..6))
        } else {
            page(250 + rand.gen_range(0..10))
        };
        if rand.gen_bool(0.5) {
            write_u32(&system, pid, addr, round);
        } else {
            read_u32(&system, pid, addr);
        }
        check("an access");
    }
    assert!(system.free_cluster_count() < capacity);

    system.delete_segment(pids[0], page(250)).unwrap();
    check("delete");
    system.disconnect_shared_segment(pids[1], "conserved").unwrap();
    check("disconnect");
    let clone = system.clone_process(pids[2]).unwrap();
    check("clone");
    system.destroy_process(pids[2]).unwrap();
    check("destroy");
    system.delete_shared_segment(pids[0], "conserved").unwrap();
    check("shared delete");

    for pid in [pids[0], pids[1], clone] {
        system.destroy_process(pid).unwrap();
    }
    assert_eq!(system.free_cluster_count(), capacity);
}
