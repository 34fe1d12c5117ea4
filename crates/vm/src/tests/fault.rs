extern crate std;

use alloc::sync::Arc;
use std::thread;

use super::*;
use crate::page_table::{PageTableOps, UniversalPTEFlag};
use crate::vm_page::{PageFlags, PageKind};
use crate::{AreaFlags, CacheKey, FaultType, VmError};

fn rw_demand() -> AreaFlags {
    AreaFlags::READ | AreaFlags::WRITE | AreaFlags::USER | AreaFlags::FAULT
}

#[test]
fn test_fault_outside_any_area_is_bad_address() {
    let mem = TestMemory::new(1);
    let ctx = mem.context();
    let space = new_space(&ctx);
    space.map_fixed(va(16), PS, rw_demand()).unwrap();

    assert_eq!(
        space.handle_page_fault(va(17), FaultType::Read),
        Err(VmError::BadAddress)
    );
    assert_eq!(
        space.handle_page_fault(va(15) + 8, FaultType::Write),
        Err(VmError::BadAddress)
    );
    assert_eq!(mem.allocated(), 0);
    assert_eq!(ctx.stats().snapshot().failures, 2);
}

#[test]
fn test_anonymous_fault_zero_fills() {
    let mem = TestMemory::new(2);
    let ctx = mem.context();
    let space = new_space(&ctx);
    let area = space.map_fixed(va(16), 2 * PS, rw_demand()).unwrap();

    space
        .handle_page_fault(va(17) + 123, FaultType::Write)
        .unwrap();

    let page = area.page_at(vpn(17)).unwrap();
    assert_eq!(page.kind(), PageKind::Private { owner: area.id() });
    assert_eq!(page.vaddr(), Some(va(17)));
    let (ppn, flags) = space.page_table().translate(vpn(17)).unwrap();
    assert_eq!(Some(ppn), page.ppn());
    assert!(flags.contains(UniversalPTEFlag::WRITEABLE | UniversalPTEFlag::USER_ACCESSIBLE));
    assert!(read_page(&space, va(17)).iter().all(|&b| b == 0));

    let stats = ctx.stats().snapshot();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.zero_fill, 1);
}

#[test]
fn test_access_outside_area_permissions_is_bad_address() {
    let mem = TestMemory::new(2);
    let ctx = mem.context();
    let space = new_space(&ctx);
    space
        .map_fixed(va(16), PS, AreaFlags::READ | AreaFlags::FAULT)
        .unwrap();
    space
        .map_fixed(va(20), PS, AreaFlags::READ | AreaFlags::EXECUTE | AreaFlags::FAULT)
        .unwrap();

    assert_eq!(
        space.handle_page_fault(va(16), FaultType::Write),
        Err(VmError::BadAddress)
    );
    assert_eq!(
        space.handle_page_fault(va(16), FaultType::Execute),
        Err(VmError::BadAddress)
    );
    space.handle_page_fault(va(20), FaultType::Execute).unwrap();
    assert_eq!(mem.allocated(), 1);
}

#[test]
fn test_fault_in_non_demand_area_is_fatal() {
    let mem = TestMemory::new(1);
    let ctx = mem.context();
    let space = new_space(&ctx);
    space
        .map_fixed(va(16), PS, AreaFlags::READ | AreaFlags::WRITE | AreaFlags::KERNEL)
        .unwrap();

    let err = space.handle_page_fault(va(16), FaultType::Read).unwrap_err();
    assert_eq!(err, VmError::InvariantViolation);
    assert!(err.is_fatal());
}

#[test]
fn test_shared_file_page_is_read_once() {
    let mem = TestMemory::new(4);
    let ctx = mem.context();
    let first = new_space(&ctx);
    let second = new_space(&ctx);
    let file = pattern_file(1, 4 * PS);
    let flags = AreaFlags::READ | AreaFlags::USER;

    let a = first
        .map_file(va(16), 4 * PS, file.clone(), 0, 4 * PS, flags)
        .unwrap();
    let b = second
        .map_file(va(64), 4 * PS, file.clone(), 0, 4 * PS, flags)
        .unwrap();

    first.handle_page_fault(va(18), FaultType::Read).unwrap();
    second.handle_page_fault(va(66), FaultType::Read).unwrap();

    assert_eq!(file.reads(), 1);
    let pa = a.page_at(vpn(18)).unwrap();
    let pb = b.page_at(vpn(66)).unwrap();
    assert!(Arc::ptr_eq(&pa, &pb));
    assert_eq!(pa.ref_count(), 2);
    assert_eq!(
        pa.key(),
        Some(CacheKey {
            file: FileId(1),
            offset: 2 * PS
        })
    );
    assert_eq!(
        first.page_table().translate(vpn(18)).unwrap().0,
        second.page_table().translate(vpn(66)).unwrap().0
    );
    assert_eq!(mem.allocated(), 1);
    assert_eq!(read_page(&second, va(66))[7], pattern_byte(2 * PS + 7));

    let stats = ctx.stats().snapshot();
    assert_eq!(stats.page_in, 1);
    assert_eq!(stats.reuse, 2);

    // 只有最后一个映射消失时帧才被释放
    first.unmap(&a).unwrap();
    assert_eq!(pb.ref_count(), 1);
    assert_eq!(mem.allocated(), 1);
    second.unmap(&b).unwrap();
    assert_eq!(pb.ref_count(), 0);
    assert_eq!(mem.allocated(), 0);
    assert!(ctx.cache().is_empty());
}

#[test]
fn test_concurrent_faults_share_one_read() {
    let mem = TestMemory::new(4);
    let ctx = mem.context();
    let spaces: Vec<TestSpace> = (0..4).map(|_| new_space(&ctx)).collect();
    let file = pattern_file(2, PS);
    for space in spaces.iter() {
        space
            .map_file(va(16), PS, file.clone(), 0, PS, AreaFlags::READ)
            .unwrap();
    }

    thread::scope(|s| {
        for space in spaces.iter() {
            s.spawn(move || space.handle_page_fault(va(16), FaultType::Read).unwrap());
        }
    });

    assert_eq!(file.reads(), 1);
    assert_eq!(mem.allocated(), 1);
    let page = spaces[0].find_area(va(16)).unwrap().page_at(vpn(16)).unwrap();
    assert_eq!(page.ref_count(), 4);
}

#[test]
fn test_concurrent_writes_to_one_slot_resolve_once() {
    let mem = TestMemory::new(4);
    let ctx = mem.context();
    let space = new_space(&ctx);
    space.map_fixed(va(16), PS, rw_demand()).unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| space.handle_page_fault(va(16), FaultType::Write).unwrap());
        }
    });

    assert_eq!(mem.allocated(), 1);
    assert_eq!(ctx.stats().snapshot().zero_fill, 1);
}

#[test]
fn test_private_mapping_copies_file_page() {
    let mem = TestMemory::new(4);
    let ctx = mem.context();
    let space = new_space(&ctx);
    let file = pattern_file(3, 2 * PS);
    let area = space
        .map_file(
            va(16),
            2 * PS,
            file,
            0,
            2 * PS,
            AreaFlags::READ | AreaFlags::WRITE | AreaFlags::PRIVATE,
        )
        .unwrap();

    space.handle_page_fault(va(17), FaultType::Read).unwrap();

    let page = area.page_at(vpn(17)).unwrap();
    assert!(page.is_private());
    // 缓存页的引用已放弃，只剩私有副本
    assert!(ctx.cache().is_empty());
    assert_eq!(mem.allocated(), 1);
    let data = read_page(&space, va(17));
    assert_eq!(data[0], pattern_byte(PS));
    assert_eq!(data[PS - 1], pattern_byte(2 * PS - 1));

    // 私有页直接可写
    space.handle_page_fault(va(17), FaultType::Write).unwrap();
    assert_eq!(mem.allocated(), 1);
}

#[test]
fn test_partially_backed_page_zero_fills_tail() {
    let mem = TestMemory::new(4);
    let ctx = mem.context();
    let space = new_space(&ctx);
    let file = pattern_file(4, 4 * PS);
    space
        .map_file(va(16), 4 * PS, file.clone(), 0, PS + 10, AreaFlags::READ)
        .unwrap();

    let data = read_page(&space, va(17));
    for (i, byte) in data.iter().enumerate() {
        let expected = if i < 10 { pattern_byte(PS + i) } else { 0 };
        assert_eq!(*byte, expected);
    }
    assert!(space.find_area(va(17)).unwrap().page_at(vpn(17)).unwrap().is_private());

    // 后备窗口之外不读文件
    let reads = file.reads();
    assert!(read_page(&space, va(18)).iter().all(|&b| b == 0));
    assert_eq!(file.reads(), reads);
}

#[test]
fn test_cow_break_is_idempotent() {
    let mem = TestMemory::new(4);
    let ctx = mem.context();
    let space = new_space(&ctx);
    let file = pattern_file(5, 2 * PS);
    let area = space
        .map_file(va(16), 2 * PS, file, 0, 2 * PS, AreaFlags::READ | AreaFlags::WRITE)
        .unwrap();

    space.handle_page_fault(va(16), FaultType::Read).unwrap();
    let shared = area.page_at(vpn(16)).unwrap();
    assert!(shared.is_shared());
    assert!(shared.flags().contains(PageFlags::COW));
    let (_, flags) = space.page_table().translate(vpn(16)).unwrap();
    assert!(!flags.contains(UniversalPTEFlag::WRITEABLE));

    space.handle_page_fault(va(16), FaultType::Write).unwrap();
    let private = area.page_at(vpn(16)).unwrap();
    assert!(private.is_private());
    let (ppn, flags) = space.page_table().translate(vpn(16)).unwrap();
    assert_eq!(Some(ppn), private.ppn());
    assert!(flags.contains(UniversalPTEFlag::WRITEABLE));
    assert_eq!(read_page(&space, va(16))[100], pattern_byte(100));

    // 共享页的最后一个引用随之释放
    assert_eq!(shared.ref_count(), 0);
    assert!(ctx.cache().is_empty());
    assert_eq!(mem.allocated(), 1);

    // 第二次写同一个槽位不再分配
    space.handle_page_fault(va(16), FaultType::Write).unwrap();
    assert!(Arc::ptr_eq(&area.page_at(vpn(16)).unwrap(), &private));
    assert_eq!(mem.allocated(), 1);
    assert_eq!(ctx.stats().snapshot().cow, 1);

    // 已解析槽位上的读缺页不合法
    assert_eq!(
        space.handle_page_fault(va(16), FaultType::Read),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_write_bytes_breaks_cow() {
    let mem = TestMemory::new(4);
    let ctx = mem.context();
    let space = new_space(&ctx);
    let file = pattern_file(6, 2 * PS);
    space
        .map_file(va(16), 2 * PS, file.clone(), 0, 2 * PS, AreaFlags::READ | AreaFlags::WRITE)
        .unwrap();

    // 跨页写入
    space.write_bytes_at(Vaddr(17 * PS - 2), &[0xAA; 4]).unwrap();

    let mut buf = [0u8; 6];
    space.read_bytes_at(Vaddr(17 * PS - 3), &mut buf).unwrap();
    assert_eq!(
        buf,
        [pattern_byte(PS - 3), 0xAA, 0xAA, 0xAA, 0xAA, pattern_byte(PS + 2)]
    );
    // 文件内容不受影响
    assert_eq!(file.data()[PS - 1], pattern_byte(PS - 1));
}

#[test]
fn test_read_error_fails_fault_without_cache_entry() {
    let mem = TestMemory::new(2);
    let ctx = mem.context();
    let space = new_space(&ctx);
    let file = pattern_file(7, PS);
    let area = space
        .map_file(va(16), PS, file.clone(), 0, PS, AreaFlags::READ)
        .unwrap();

    file.set_fail_reads(true);
    assert_eq!(
        space.handle_page_fault(va(16), FaultType::Read),
        Err(VmError::Io(test_support::mock::fs::EIO))
    );
    assert!(ctx.cache().is_empty());
    assert_eq!(area.resolved_count(), 0);
    assert_eq!(mem.allocated(), 0);

    file.set_fail_reads(false);
    space.handle_page_fault(va(16), FaultType::Read).unwrap();
    assert_eq!(area.resolved_count(), 1);
}

#[test]
fn test_short_read_is_io_error() {
    let mem = TestMemory::new(2);
    let ctx = mem.context();
    let space = new_space(&ctx);
    let file = pattern_file(8, 4 * PS);
    space
        .map_file(va(16), 4 * PS, file.clone(), 0, 4 * PS, AreaFlags::READ)
        .unwrap();

    file.set_truncated(true);
    let err = space.handle_page_fault(va(19), FaultType::Read).unwrap_err();
    assert!(matches!(err, VmError::Io(_)));
    assert!(!err.is_fatal());
    assert_eq!(mem.allocated(), 0);
}

#[test]
fn test_exhausted_frames_report_resource_exhaustion() {
    let mem = TestMemory::new(1);
    let ctx = mem.context();
    let space = new_space(&ctx);
    space.map_fixed(va(16), 2 * PS, rw_demand()).unwrap();

    space.handle_page_fault(va(16), FaultType::Write).unwrap();
    assert_eq!(
        space.handle_page_fault(va(17), FaultType::Write),
        Err(VmError::ResourceExhausted)
    );
}

#[test]
#[should_panic(expected = "during bootstrap")]
fn test_bootstrap_fault_failure_halts() {
    let mem = TestMemory::new(1);
    let ctx = mem.context();
    let space = new_space(&ctx);
    space.map_fixed(va(16), 2 * PS, rw_demand()).unwrap();
    space.handle_page_fault(va(16), FaultType::Write).unwrap();

    ctx.set_bootstrap(true);
    let _ = space.handle_page_fault(va(17), FaultType::Write);
}
