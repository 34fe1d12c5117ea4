//! 虚拟内存核心的宿主机测试
//!
//! 物理帧来自宿主机上泄漏的一块页对齐内存，MockMmOps 的恒等映射让
//! 帧内容可以直接访问；页表后端使用 SoftPageTable。

extern crate std;

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;
use test_support::mock::fs::MockFile;
use test_support::mock::mm::{MOCK_MM_CONFIG, MOCK_MM_OPS, MockMmConfig, MockMmOps};

use crate::address::{Ppn, Vaddr, Vpn};
use crate::frame_allocator::BitmapFrameAllocator;
use crate::page_table::{PageTableOps, PagingError, PagingResult, SoftPageTable, UniversalPTEFlag};
use crate::{
    ArchMmOps, FileId, MmConfig, VmContext, VmFile, VmSpace, register_arch_ops, register_config,
};

mod fault;

pub(crate) const PS: usize = 4096;

pub(crate) type TestSpace = VmSpace<SoftPageTable>;

impl MmConfig for MockMmConfig {
    fn page_size(&self) -> usize {
        MockMmConfig::page_size(self)
    }

    fn mmap_base(&self) -> usize {
        MockMmConfig::mmap_base(self)
    }
}

impl ArchMmOps for MockMmOps {
    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MockMmOps::paddr_to_vaddr(self, paddr)
    }
}

impl VmFile for MockFile {
    fn id(&self) -> FileId {
        FileId(MockFile::id(self))
    }

    fn size(&self) -> usize {
        MockFile::size(self)
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        MockFile::read_at(self, offset, buf)
    }
}

struct DummyArchOps;

impl sync::ArchOps for DummyArchOps {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        0
    }

    unsafe fn restore_interrupts(&self, _flags: usize) {}
}

static DUMMY_ARCH_OPS: DummyArchOps = DummyArchOps;
// 0 = uninit, 1 = initializing, 2 = ready
static INIT: AtomicUsize = AtomicUsize::new(0);

/// 注册锁、配置与帧映射的实现；可被多个测试线程重复调用
pub(crate) fn init_test_env() {
    match INIT.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            // Safety: tests use single global mock instances.
            unsafe {
                sync::register_arch_ops(&DUMMY_ARCH_OPS);
                register_config(&MOCK_MM_CONFIG);
                register_arch_ops(&MOCK_MM_OPS);
            }
            INIT.store(2, Ordering::Release);
        }
        Err(_) => {
            while INIT.load(Ordering::Acquire) != 2 {
                core::hint::spin_loop();
            }
        }
    }
}

/// 一块充当物理内存的宿主机内存
pub(crate) struct TestMemory {
    allocator: Arc<BitmapFrameAllocator>,
}

impl TestMemory {
    pub(crate) fn new(frames: usize) -> Self {
        init_test_env();
        let buf: &'static mut [u8] = Vec::leak(alloc::vec![0u8; (frames + 1) * PS]);
        let start = (buf.as_ptr() as usize + PS - 1) & !(PS - 1);
        TestMemory {
            allocator: Arc::new(BitmapFrameAllocator::new(start, start + frames * PS)),
        }
    }

    pub(crate) fn allocator(&self) -> Arc<BitmapFrameAllocator> {
        self.allocator.clone()
    }

    pub(crate) fn context(&self) -> Arc<VmContext> {
        VmContext::new(self.allocator.clone())
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocator.allocated_frames()
    }
}

/// 可以让占位预留失败的页表后端，其余操作交给 [`SoftPageTable`]
pub(crate) struct FlakyPageTable {
    inner: SoftPageTable,
    fail_reserve: bool,
}

impl FlakyPageTable {
    /// 之后的占位预留是否返回 [`PagingError::OutOfMemory`]
    pub(crate) fn set_fail_reserve(&mut self, fail: bool) {
        self.fail_reserve = fail;
    }

    pub(crate) fn soft(&self) -> &SoftPageTable {
        &self.inner
    }
}

impl PageTableOps for FlakyPageTable {
    fn new() -> PagingResult<Self> {
        Ok(FlakyPageTable {
            inner: SoftPageTable::new()?,
            fail_reserve: false,
        })
    }

    fn root_ppn(&self) -> Ppn {
        self.inner.root_ppn()
    }

    fn map_pages(
        &mut self,
        vpn: Vpn,
        ppn: Option<Ppn>,
        count: usize,
        flags: UniversalPTEFlag,
    ) -> PagingResult<()> {
        if ppn.is_none() && self.fail_reserve {
            return Err(PagingError::OutOfMemory);
        }
        self.inner.map_pages(vpn, ppn, count, flags)
    }

    fn unmap_pages(&mut self, vpn: Vpn, count: usize) -> PagingResult<()> {
        self.inner.unmap_pages(vpn, count)
    }

    fn translate(&self, vpn: Vpn) -> Option<(Ppn, UniversalPTEFlag)> {
        self.inner.translate(vpn)
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }
}

/// 新地址空间
pub(crate) fn new_space(ctx: &Arc<VmContext>) -> TestSpace {
    VmSpace::new(ctx.clone()).unwrap()
}

/// 第 `page` 页的起始地址
pub(crate) fn va(page: usize) -> Vaddr {
    Vaddr(page * PS)
}

pub(crate) fn vpn(page: usize) -> Vpn {
    Vpn(page)
}

/// `pages` 页内容按 `MockFile::with_pattern` 生成的文件
pub(crate) fn pattern_file(id: u64, len: usize) -> Arc<MockFile> {
    Arc::new(MockFile::with_pattern(id, len))
}

/// 文件第 `offset` 字节的内容
pub(crate) fn pattern_byte(offset: usize) -> u8 {
    (offset % 251) as u8
}

/// 读出地址空间中一整页
pub(crate) fn read_page(space: &TestSpace, addr: Vaddr) -> Vec<u8> {
    let mut buf = alloc::vec![0u8; PS];
    space.read_bytes_at(addr, &mut buf).unwrap();
    buf
}
