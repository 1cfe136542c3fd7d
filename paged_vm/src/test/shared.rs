use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{get_test_system, page, read_u32, touch, write_u32, SEED, TEST_CLUSTERS};
use crate::{AccessType, TrapCause, VMError, PAGE_SIZE};

#[test]
fn test_shared_data_is_visible() {
    let system = get_test_system("test_shared_data_is_visible", 16, 32, TEST_CLUSTERS);
    let first = system.create_process();
    let second = system.create_process();

    system
        .create_shared_segment(first, page(10), 4, "buffer", AccessType::ReadWrite)
        .unwrap();
    system
        .create_shared_segment(second, page(300), 4, "buffer", AccessType::ReadWrite)
        .unwrap();

    write_u32(&system, first, page(12) + 8, 0xC0FFEE);
    assert_eq!(read_u32(&system, second, page(302) + 8), 0xC0FFEE);
    write_u32(&system, second, page(303), 17);
    assert_eq!(read_u32(&system, first, page(13)), 17);

    assert_eq!(
        system.physical_address(first, page(12) + 8),
        system.physical_address(second, page(302) + 8)
    );
    assert!(system.physical_address(first, page(12)).is_some());

    let infos = system.shared_segments();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "buffer");
    assert_eq!((infos[0].pages, infos[0].subscribers), (4, 2));
    assert_eq!(infos[0].access, AccessType::ReadWrite);
    assert_eq!(system.segment_count(first), Ok(1));
}

#[test]
fn test_shared_rights_per_mapping() {
    let system = get_test_system("test_shared_rights_per_mapping", 16, 32, TEST_CLUSTERS);
    let writer = system.create_process();
    let reader = system.create_process();

    system
        .create_shared_segment(writer, 0, 2, "ro", AccessType::ReadWrite)
        .unwrap();
    system
        .create_shared_segment(reader, 0, 2, "ro", AccessType::Read)
        .unwrap();

    write_u32(&system, writer, 4, 99);
    assert_eq!(read_u32(&system, reader, 4), 99);
    assert_eq!(
        system.write_virtual(reader, 4, &[1]),
        Err(VMError::Trap(TrapCause::AccessViolation))
    );
    assert_eq!(
        touch(&system, reader, page(1), AccessType::Execute),
        Err(VMError::Trap(TrapCause::AccessViolation))
    );
    assert_eq!(read_u32(&system, writer, 4), 99);
}

#[test]
fn test_shared_segment_errors() {
    let system = get_test_system("test_shared_segment_errors", 16, 32, TEST_CLUSTERS);
    let first = system.create_process();
    let second = system.create_process();

    system
        .create_shared_segment(first, page(4), 3, "errors", AccessType::ReadWrite)
        .unwrap();
    // a smaller mapping is fine, a larger one is not
    assert_eq!(
        system.create_shared_segment(second, 0, 4, "errors", AccessType::Read),
        Err(VMError::Trap(TrapCause::InvalidSize))
    );
    system
        .create_shared_segment(second, 0, 2, "errors", AccessType::Read)
        .unwrap();

    system
        .create_segment(first, page(20), 2, AccessType::Read)
        .unwrap();
    assert_eq!(
        system.create_shared_segment(first, page(21), 1, "other", AccessType::Read),
        Err(VMError::Trap(TrapCause::Overlap))
    );
    // the overlap is detected before the segment gets created
    assert_eq!(system.shared_segments().len(), 1);

    assert_eq!(
        system.create_shared_segment(first, page(40), 0, "empty", AccessType::Read),
        Err(VMError::Trap(TrapCause::InvalidSize))
    );
    assert_eq!(
        system.create_shared_segment(first, 12, 1, "odd", AccessType::Read),
        Err(VMError::Trap(TrapCause::Misaligned))
    );
    assert_eq!(
        system.disconnect_shared_segment(first, "missing"),
        Err(VMError::Trap(TrapCause::UnknownSharedSegment))
    );
    assert_eq!(
        system.delete_shared_segment(first, "missing"),
        Err(VMError::Trap(TrapCause::UnknownSharedSegment))
    );

    let third = system.create_process();
    assert_eq!(
        system.disconnect_shared_segment(third, "errors"),
        Err(VMError::Trap(TrapCause::NotConnected))
    );
    assert_eq!(
        system.create_shared_segment(12345, 0, 1, "errors", AccessType::Read),
        Err(VMError::Trap(TrapCause::NoSuchProcess))
    );
}

#[test]
fn test_disconnect_keeps_segment() {
    let system = get_test_system("test_disconnect_keeps_segment", 16, 32, TEST_CLUSTERS);
    let pid = system.create_process();

    system
        .create_shared_segment(pid, page(8), 2, "kept", AccessType::ReadWrite)
        .unwrap();
    write_u32(&system, pid, page(9) + 100, 4242);
    system.disconnect_shared_segment(pid, "kept").unwrap();

    assert_eq!(system.segment_count(pid), Ok(0));
    assert_eq!(
        system.access(pid, page(9), AccessType::Read),
        Err(VMError::Trap(TrapCause::NotInSegment))
    );
    assert_eq!(system.shared_segments()[0].subscribers, 0);

    // mapped elsewhere, the data is still there
    system
        .create_shared_segment(pid, page(1000), 2, "kept", AccessType::Read)
        .unwrap();
    assert_eq!(read_u32(&system, pid, page(1001) + 100), 4242);
}

#[test]
fn test_delete_unmaps_everywhere() {
    let system = get_test_system("test_delete_unmaps_everywhere", 16, 32, TEST_CLUSTERS);
    let initial = system.stats();
    let pids: Vec<_> = (0..3).map(|_| system.create_process()).collect();

    for (i, pid) in pids.iter().enumerate() {
        system
            .create_segment(*pid, page(500), 1, AccessType::ReadWrite)
            .unwrap();
        system
            .create_shared_segment(*pid, page(i * 8), 5, "doomed", AccessType::ReadWrite)
            .unwrap();
        write_u32(&system, *pid, page(i * 8 + i), i as u32 + 1);
    }
    assert_eq!(system.shared_segments()[0].subscribers, 3);

    system.delete_shared_segment(pids[1], "doomed").unwrap();
    assert!(system.shared_segments().is_empty());
    for (i, pid) in pids.iter().enumerate() {
        assert_eq!(system.segment_count(*pid), Ok(1));
        assert_eq!(
            system.access(*pid, page(i * 8), AccessType::Read),
            Err(VMError::Trap(TrapCause::NotInSegment))
        );
    }
    assert_eq!(
        system.delete_shared_segment(pids[0], "doomed"),
        Err(VMError::Trap(TrapCause::UnknownSharedSegment))
    );

    // the name can be used again and starts out zeroed
    system
        .create_shared_segment(pids[0], 0, 1, "doomed", AccessType::ReadWrite)
        .unwrap();
    assert_eq!(read_u32(&system, pids[0], 0), 0);
    system.delete_shared_segment(pids[0], "doomed").unwrap();

    for pid in pids {
        system.destroy_process(pid).unwrap();
    }
    assert_eq!(system.stats(), initial);
}

#[test]
fn test_destroy_drops_subscription() {
    let system = get_test_system("test_destroy_drops_subscription", 16, 32, TEST_CLUSTERS);
    let first = system.create_process();
    let second = system.create_process();

    for pid in [first, second] {
        system
            .create_shared_segment(pid, 0, 1, "survivor", AccessType::ReadWrite)
            .unwrap();
    }
    write_u32(&system, first, 0, 7);
    system.destroy_process(first).unwrap();

    let infos = system.shared_segments();
    assert_eq!(infos[0].subscribers, 1);
    assert_eq!(read_u32(&system, second, 0), 7);
    assert_eq!(system.stats().shared_segments, 1);
}

#[test]
fn test_shared_pages_under_pressure() {
    let system = get_test_system("test_shared_pages_under_pressure", 3, 32, TEST_CLUSTERS);
    let first = system.create_process();
    let second = system.create_process();

    system
        .create_shared_segment(first, page(100), 12, "pressure", AccessType::ReadWrite)
        .unwrap();
    system
        .create_shared_segment(second, page(600), 12, "pressure", AccessType::ReadWrite)
        .unwrap();
    for pid in [first, second] {
        system
            .create_segment(pid, page(2000), 6, AccessType::ReadWrite)
            .unwrap();
    }

    let mut rand = SmallRng::seed_from_u64(SEED);
    let mut shared = [0u32; 12];
    let mut private = [[0u32; 6]; 2];
    for _ in 0..500 {
        let (pid, index, base) = if rand.gen_bool(0.5) {
            (first, 0, 100)
        } else {
            (second, 1, 600)
        };

        if rand.gen_bool(0.5) {
            let i = rand.gen_range(0..12);
            if rand.gen_bool(0.4) {
                shared[i] = rand.gen();
                write_u32(&system, pid, page(base + i) + 20, shared[i]);
            } else {
                assert_eq!(read_u32(&system, pid, page(base + i) + 20), shared[i]);
            }
        } else {
            let i = rand.gen_range(0..6);
            if rand.gen_bool(0.4) {
                private[index][i] = rand.gen();
                write_u32(&system, pid, page(2000 + i) + 20, private[index][i]);
            } else {
                assert_eq!(read_u32(&system, pid, page(2000 + i) + 20), private[index][i]);
            }
        }
    }
}

#[test]
fn test_whole_page_through_both_mappings() {
    let system = get_test_system("test_whole_page_through_both_mappings", 2, 32, TEST_CLUSTERS);
    let first = system.create_process();
    let second = system.create_process();
    for pid in [first, second] {
        system
            .create_shared_segment(pid, page(pid * 3), 3, "pages", AccessType::ReadWrite)
            .unwrap();
    }

    let mut data = [0u8; PAGE_SIZE];
    for i in 0..3 {
        data.iter_mut()
            .enumerate()
            .for_each(|(n, byte)| *byte = (n + i) as u8);
        system.write_virtual(first, page(first * 3 + i), &data).unwrap();
    }
    for i in 0..3 {
        system
            .read_virtual(second, page(second * 3 + i), &mut data)
            .unwrap();
        assert!(data.iter().enumerate().all(|(n, byte)| *byte == (n + i) as u8));
    }
}

#[test]
fn test_one_process_maps_segment_twice() {
    let system = get_test_system("test_one_process_maps_segment_twice", 16, 32, TEST_CLUSTERS);
    let pid = system.create_process();

    system
        .create_shared_segment(pid, 0, 2, "twice", AccessType::ReadWrite)
        .unwrap();
    system
        .create_shared_segment(pid, page(10), 2, "twice", AccessType::Read)
        .unwrap();
    assert_eq!(system.shared_segments()[0].subscribers, 2);

    write_u32(&system, pid, page(1), 31);
    assert_eq!(read_u32(&system, pid, page(11)), 31);

    // dropping the second mapping keeps the first one subscribed
    system.delete_segment(pid, page(10)).unwrap();
    assert_eq!(system.shared_segments()[0].subscribers, 1);
    assert_eq!(read_u32(&system, pid, page(1)), 31);

    // takes over the segment table slot of the second mapping
    system
        .create_segment(pid, page(20), 1, AccessType::ReadWrite)
        .unwrap();
    write_u32(&system, pid, page(20), 77);

    system.delete_shared_segment(pid, "twice").unwrap();
    assert_eq!(system.segment_count(pid), Ok(1));
    assert_eq!(read_u32(&system, pid, page(20)), 77);
    assert_eq!(
        system.access(pid, page(1), AccessType::Read),
        Err(VMError::Trap(TrapCause::NotInSegment))
    );
}

#[test]
fn test_failed_mapping_creates_nothing() {
    let system = get_test_system("test_failed_mapping_creates_nothing", 16, 32, TEST_CLUSTERS);
    let pid = system.create_process();
    for i in 0..crate::MAX_SEGMENTS {
        system
            .create_segment(pid, page(i), 1, AccessType::Read)
            .unwrap();
    }

    let before = system.stats();
    assert_eq!(
        system.create_shared_segment(pid, page(300), 2, "unmapped", AccessType::ReadWrite),
        Err(VMError::Trap(TrapCause::SegmentTableFull))
    );
    assert!(system.shared_segments().is_empty());
    assert_eq!(system.stats(), before);
    assert_eq!(system.segment_count(pid), Ok(crate::MAX_SEGMENTS));

    // a rejected size gives the reserved slot back
    system.delete_segment(pid, page(5)).unwrap();
    let other = system.create_process();
    system
        .create_shared_segment(other, 0, 1, "small", AccessType::Read)
        .unwrap();
    assert_eq!(
        system.create_shared_segment(pid, page(300), 2, "small", AccessType::Read),
        Err(VMError::Trap(TrapCause::InvalidSize))
    );
    assert_eq!(system.segment_count(pid), Ok(crate::MAX_SEGMENTS - 1));
    system
        .create_shared_segment(pid, page(300), 1, "small", AccessType::Read)
        .unwrap();
    assert_eq!(system.segment_count(pid), Ok(crate::MAX_SEGMENTS));
    assert_eq!(system.shared_segments()[0].subscribers, 2);
}
