//! 映射区域
//!
//! [`VmArea`] 是地址空间中的一段连续虚拟范围。区域的起始地址与长度
//! 总是页对齐的；区域只会被头部重叠的新映射收缩，从不增长。
//!
//! 区域内部由一把自旋锁（槽位锁）保护布局与已解析的槽位。正在解析的
//! 槽位记录在 `in_flight` 中，使同一槽位上的缺页串行，而不同槽位互不阻塞。

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use sync::{SpinLock, SpinLockGuard};

use crate::address::{PageNum, UsizeConvert, Vaddr, Vpn, VpnRange, page_size};
use crate::file::VmFile;
use crate::page_table::UniversalPTEFlag;
use crate::vm_page::VmPage;

bitflags! {
    /// 区域标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AreaFlags: u32 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可执行
        const EXECUTE = 1 << 2;
        /// 内核区域
        const KERNEL = 1 << 3;
        /// 用户区域
        const USER = 1 << 4;
        /// 私有文件映射：文件页总是复制，不复用缓存页
        const PRIVATE = 1 << 5;
        /// 克隆时不复制，也不被释放
        const NO_CLONE = 1 << 6;
        /// 机器相关区域，仅在 exec 替换时复制
        const MD = 1 << 7;
        /// 按需缺页
        const FAULT = 1 << 8;
    }
}

impl AreaFlags {
    /// 转换为页表项标志
    pub fn to_pte_flags(self) -> UniversalPTEFlag {
        let mut flags = UniversalPTEFlag::VALID;
        if self.contains(AreaFlags::READ) {
            flags |= UniversalPTEFlag::READABLE;
        }
        if self.contains(AreaFlags::WRITE) {
            flags |= UniversalPTEFlag::WRITEABLE;
        }
        if self.contains(AreaFlags::EXECUTE) {
            flags |= UniversalPTEFlag::EXECUTABLE;
        }
        if self.contains(AreaFlags::USER) {
            flags |= UniversalPTEFlag::USER_ACCESSIBLE;
        }
        if self.contains(AreaFlags::KERNEL) {
            flags |= UniversalPTEFlag::GLOBAL;
        }
        flags
    }
}

impl fmt::Display for AreaFlags {
    /// 以 `rwxkupnmf` 顺序输出，缺失的标志用 `-` 表示
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [(AreaFlags, char); 9] = [
            (AreaFlags::READ, 'r'),
            (AreaFlags::WRITE, 'w'),
            (AreaFlags::EXECUTE, 'x'),
            (AreaFlags::KERNEL, 'k'),
            (AreaFlags::USER, 'u'),
            (AreaFlags::PRIVATE, 'p'),
            (AreaFlags::NO_CLONE, 'n'),
            (AreaFlags::MD, 'm'),
            (AreaFlags::FAULT, 'f'),
        ];
        for (flag, letter) in LETTERS {
            let c = if self.contains(flag) { letter } else { '-' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// 区域标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(pub usize);

static NEXT_AREA_ID: AtomicUsize = AtomicUsize::new(1);

/// 文件后备窗口
///
/// `len` 从区域偏移 0 开始计数：区域的前 `len` 字节来自文件
/// `[offset, offset + len)`，其余部分按零填充。
#[derive(Clone)]
pub struct Backing {
    /// 后备文件
    pub file: Arc<dyn VmFile>,
    /// 页对齐的文件内偏移
    pub offset: usize,
    /// 有后备的字节数
    pub len: usize,
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("file", &self.file.id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

pub(crate) struct AreaInner {
    pub(crate) base: Vaddr,
    pub(crate) len: usize,
    pub(crate) backing: Option<Backing>,
    pub(crate) resolved: BTreeMap<Vpn, Arc<VmPage>>,
    pub(crate) in_flight: BTreeSet<Vpn>,
    /// 区域已从地址空间中移除，不再接受新的槽位
    pub(crate) detached: bool,
}

impl AreaInner {
    pub(crate) fn end(&self) -> Vaddr {
        self.base + self.len
    }

    pub(crate) fn vpn_range(&self) -> VpnRange {
        VpnRange::from_start_len(Vpn::from_addr_floor(self.base), self.len / page_size())
    }

    pub(crate) fn contains_vpn(&self, vpn: Vpn) -> bool {
        !self.detached && self.vpn_range().contains(vpn)
    }

    /// 移除 `range` 内已解析的槽位
    pub(crate) fn take_slots(&mut self, range: VpnRange) -> Vec<(Vpn, Arc<VmPage>)> {
        let keys: Vec<Vpn> = self
            .resolved
            .range(range.start()..range.end())
            .map(|(vpn, _)| *vpn)
            .collect();
        keys.into_iter()
            .filter_map(|vpn| self.resolved.remove(&vpn).map(|page| (vpn, page)))
            .collect()
    }
}

/// 地址空间中的一个映射区域
pub struct VmArea {
    id: AreaId,
    flags: AreaFlags,
    inner: SpinLock<AreaInner>,
}

impl VmArea {
    pub(crate) fn new(base: Vaddr, len: usize, flags: AreaFlags, backing: Option<Backing>) -> Self {
        VmArea {
            id: AreaId(NEXT_AREA_ID.fetch_add(1, Ordering::Relaxed)),
            flags,
            inner: SpinLock::new(AreaInner {
                base,
                len,
                backing,
                resolved: BTreeMap::new(),
                in_flight: BTreeSet::new(),
                detached: false,
            }),
        }
    }

    /// 区域标识
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// 区域标志
    pub fn flags(&self) -> AreaFlags {
        self.flags
    }

    /// 是否为按需缺页区域
    pub fn is_demand(&self) -> bool {
        self.flags.contains(AreaFlags::FAULT)
    }

    /// 起始地址
    pub fn base(&self) -> Vaddr {
        self.inner.lock().base
    }

    /// 长度（字节）
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// 结束地址（不包含）
    pub fn end(&self) -> Vaddr {
        self.inner.lock().end()
    }

    /// 虚拟页号范围
    pub fn vpn_range(&self) -> VpnRange {
        self.inner.lock().vpn_range()
    }

    /// 是否包含某个地址
    pub fn contains(&self, vaddr: Vaddr) -> bool {
        let inner = self.inner.lock();
        vaddr >= inner.base && vaddr < inner.end()
    }

    /// 文件后备窗口
    pub fn backing(&self) -> Option<Backing> {
        self.inner.lock().backing.clone()
    }

    /// 已解析的槽位数
    pub fn resolved_count(&self) -> usize {
        self.inner.lock().resolved.len()
    }

    /// 某个槽位上的页面
    pub fn page_at(&self, vpn: Vpn) -> Option<Arc<VmPage>> {
        self.inner.lock().resolved.get(&vpn).cloned()
    }

    /// 是否已从地址空间中移除
    pub fn is_detached(&self) -> bool {
        self.inner.lock().detached
    }

    /// 已解析槽位的快照
    pub fn slots(&self) -> Vec<(Vpn, Arc<VmPage>)> {
        self.inner
            .lock()
            .resolved
            .iter()
            .map(|(vpn, page)| (*vpn, page.clone()))
            .collect()
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_, AreaInner> {
        self.inner.lock()
    }

    /// 区域是否允许这种访问
    pub(crate) fn permits(&self, write: bool, execute: bool) -> bool {
        (!write || self.flags.contains(AreaFlags::WRITE))
            && (!execute || self.flags.contains(AreaFlags::EXECUTE))
    }

    /// 与 `[start, end)` 是否重叠
    pub(crate) fn overlaps(&self, start: Vaddr, end: Vaddr) -> bool {
        let inner = self.inner.lock();
        start < inner.end() && inner.base < end
    }
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VmArea")
            .field("id", &self.id)
            .field("base", &inner.base)
            .field("len", &inner.len)
            .field("flags", &self.flags)
            .field("backing", &inner.backing)
            .field("resolved", &inner.resolved.len())
            .finish()
    }
}

impl fmt::Display for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 页锁排在槽位锁之前，先取快照再逐页输出
        let (base, end, backing, slots) = {
            let inner = self.inner.lock();
            let slots: Vec<(Vpn, Arc<VmPage>)> = inner
                .resolved
                .iter()
                .map(|(vpn, page)| (*vpn, page.clone()))
                .collect();
            (inner.base, inner.end(), inner.backing.clone(), slots)
        };
        write!(f, "{:#x}-{:#x} {}", base.as_usize(), end.as_usize(), self.flags)?;
        if let Some(backing) = backing {
            write!(
                f,
                " file={} off={:#x} len={:#x}",
                backing.file.id().0,
                backing.offset,
                backing.len
            )?;
        }
        for (vpn, page) in slots {
            write!(f, "\n    {:#x}: {}", vpn.start_addr().as_usize(), page)?;
        }
        Ok(())
    }
}
