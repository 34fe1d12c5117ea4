//! 地址空间核心实现
//!
//! [`VmSpace`] 持有一组互不重叠的区域、下一个自动放置映射的提示地址，
//! 以及该地址空间的页表后端实例。
//!
//! 锁顺序：结构锁（区域集合）→ 区域槽位锁 → 页锁 → 页缓存锁 → 页表锁。
//! 页锁之后可以重新获取槽位锁，前提是此前已经释放了它。页表锁总是最内层。

use core::fmt;

use alloc::sync::Arc;
use alloc::vec::Vec;
use sync::{SpinLock, SpinLockGuard};

use crate::address::{
    Address, PageNum, Ppn, UsizeConvert, Vaddr, Vpn, VpnRange, checked_round_up, is_page_aligned,
    page_size, round_up,
};
use crate::context::VmContext;
use crate::error::{VmError, VmResult};
use crate::file::VmFile;
use crate::frame_allocator::FrameTracker;
use crate::memory_space::FaultType;
use crate::memory_space::area::{AreaFlags, Backing, VmArea};
use crate::mm_config;
use crate::page_table::{PageTableOps, UniversalPTEFlag};
use crate::vm_page::VmPage;

pub(crate) struct AreaSet {
    pub(crate) areas: Vec<Arc<VmArea>>,
    pub(crate) next_free: usize,
}

/// 新映射与一个已有区域的重叠关系
enum Overlap {
    /// 范围完全相同：已有区域被取代
    Exact,
    /// 新映射覆盖已有区域的头部：已有区域收缩
    Head,
    /// 新映射越过已有区域的某一侧
    Beyond,
    /// 新映射落在已有区域的中部或尾部
    Inner,
}

fn classify(start: usize, end: usize, base: usize, area_end: usize) -> Overlap {
    if start == base && end == area_end {
        Overlap::Exact
    } else if start == base && end < area_end {
        Overlap::Head
    } else if start < base || end > area_end {
        Overlap::Beyond
    } else {
        Overlap::Inner
    }
}

/// 一个地址空间
pub struct VmSpace<PT: PageTableOps> {
    ctx: Arc<VmContext>,
    page_table: SpinLock<PT>,
    areas: SpinLock<AreaSet>,
}

impl<PT: PageTableOps> VmSpace<PT> {
    /// 创建一个新的空地址空间，页表中已包含内核映射
    pub fn new(ctx: Arc<VmContext>) -> VmResult<Self> {
        let page_table = PT::new()?;
        log::trace!("vm: new space, root ppn {}", page_table.root_ppn());
        Ok(VmSpace {
            ctx,
            page_table: SpinLock::new(page_table),
            areas: SpinLock::new(AreaSet {
                areas: Vec::new(),
                next_free: mm_config().mmap_base(),
            }),
        })
    }

    /// 共享的虚拟内存上下文
    pub fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    /// 页表根的物理页号
    pub fn root_ppn(&self) -> Ppn {
        self.page_table.lock().root_ppn()
    }

    /// 锁住页表后端
    pub fn page_table(&self) -> SpinLockGuard<'_, PT> {
        self.page_table.lock()
    }

    /// 下一个自动放置映射的提示地址
    pub fn next_free(&self) -> Vaddr {
        Vaddr(self.areas.lock().next_free)
    }

    /// 区域快照，按创建顺序排列
    pub fn areas(&self) -> Vec<Arc<VmArea>> {
        self.areas.lock().areas.clone()
    }

    /// 区域数量
    pub fn area_count(&self) -> usize {
        self.areas.lock().areas.len()
    }

    /// 查找包含 `vaddr` 的区域（线性扫描）
    pub fn find_area(&self, vaddr: Vaddr) -> Option<Arc<VmArea>> {
        let set = self.areas.lock();
        set.areas.iter().find(|area| area.contains(vaddr)).cloned()
    }

    /// 在固定地址建立映射
    ///
    /// 长度向上取整到页大小。与已有区域的重叠按以下规则处理：
    ///
    /// - 范围完全相同：已有区域被释放
    /// - 覆盖已有区域头部：已有区域收缩，头部的页面被释放
    /// - 其它重叠：返回 [`VmError::NoSpace`]
    ///
    /// 非按需缺页区域会在页表中预留占位翻译。
    pub fn map_fixed(&self, virt: Vaddr, len: usize, flags: AreaFlags) -> VmResult<Arc<VmArea>> {
        self.map_area(virt, len, flags, None)
    }

    /// 建立以文件为后备的映射
    ///
    /// 可见长度被截断到文件末尾；区域总是按需缺页。`backed_len` 从区域
    /// 偏移 0 开始计数，超出部分按零填充。
    pub fn map_file(
        &self,
        virt: Vaddr,
        visible_len: usize,
        file: Arc<dyn VmFile>,
        offset: usize,
        backed_len: usize,
        flags: AreaFlags,
    ) -> VmResult<Arc<VmArea>> {
        if !is_page_aligned(offset) {
            return Err(VmError::BadAlignment);
        }
        let size = file.size();
        if offset >= size {
            log::warn!(
                "vm: map_file offset {:#x} beyond end of file {:?} ({:#x})",
                offset,
                file.id(),
                size
            );
            return Err(VmError::BadLength);
        }
        let visible = visible_len.min(size - offset);
        let backing = Backing {
            file,
            offset,
            len: backed_len.min(visible),
        };
        self.map_area(virt, visible, flags | AreaFlags::FAULT, Some(backing))
    }

    /// 在提示地址处建立映射，并把提示地址推进到映射之后
    ///
    /// 提示地址处若已有区域，则跳到与之不重叠的第一个位置。
    pub fn map(&self, len: usize, flags: AreaFlags) -> VmResult<Arc<VmArea>> {
        let len = match checked_round_up(len) {
            Some(len) if len > 0 => len,
            _ => return Err(VmError::BadLength),
        };
        let mut set = self.areas.lock();
        let mut virt = set.next_free;
        while let Some(end) = set
            .areas
            .iter()
            .filter(|area| area.overlaps(Vaddr(virt), Vaddr(virt.saturating_add(len))))
            .map(|area| area.end().as_usize())
            .max()
        {
            virt = round_up(end);
        }
        let (area, released) = self.map_area_locked(&mut set, Vaddr(virt), len, flags, None)?;
        set.next_free = round_up(virt + len);
        drop(set);
        self.release_pages(released);
        Ok(area)
    }

    pub(crate) fn map_area(
        &self,
        virt: Vaddr,
        len: usize,
        flags: AreaFlags,
        backing: Option<Backing>,
    ) -> VmResult<Arc<VmArea>> {
        let mut set = self.areas.lock();
        let (area, released) = self.map_area_locked(&mut set, virt, len, flags, backing)?;
        drop(set);
        self.release_pages(released);
        Ok(area)
    }

    fn map_area_locked(
        &self,
        set: &mut AreaSet,
        virt: Vaddr,
        len: usize,
        flags: AreaFlags,
        backing: Option<Backing>,
    ) -> VmResult<(Arc<VmArea>, Vec<(Vpn, Arc<VmPage>)>)> {
        if len == 0 {
            return Err(VmError::BadLength);
        }
        if !virt.is_page_aligned() {
            return Err(VmError::BadAlignment);
        }
        let end = checked_round_up(len)
            .and_then(|len| virt.as_usize().checked_add(len))
            .ok_or(VmError::BadLength)?;
        let len = end - virt.as_usize();

        let plan = self.plan_reconcile(set, virt.as_usize(), end)?;

        // 占位翻译覆盖被取代的那部分翻译，失败时区域集合尚未改动
        let area = Arc::new(VmArea::new(virt, len, flags, backing));
        let placeholders = !area.is_demand();
        if placeholders {
            let range = area.vpn_range();
            if let Err(err) = self.page_table.lock().map_pages(
                range.start(),
                None,
                range.len(),
                UniversalPTEFlag::empty(),
            ) {
                log::warn!(
                    "vm: failed to reserve {:#x}-{:#x}: {:?}",
                    virt.as_usize(),
                    end,
                    err
                );
                if plan.is_empty() {
                    if let Err(err) = self.page_table.lock().unmap_pages(range.start(), range.len()) {
                        log::warn!("vm: failed to clear partial reservation: {:?}", err);
                    }
                }
                for &(idx, _) in &plan {
                    self.restore_translations(&set.areas[idx], range);
                }
                return Err(err.into());
            }
        }
        let released = self.apply_reconcile(set, plan, virt.as_usize(), end, !placeholders);
        set.areas.push(area.clone());
        log::trace!(
            "vm: mapped {:#x}-{:#x} {}",
            virt.as_usize(),
            end,
            flags
        );
        Ok((area, released))
    }

    /// 判定新范围 `[start, end)` 与已有区域的重叠关系，不修改任何区域
    ///
    /// 返回受影响区域的下标，以及该区域是被整个取代（`true`）还是收缩头部。
    fn plan_reconcile(
        &self,
        set: &AreaSet,
        start: usize,
        end: usize,
    ) -> VmResult<Vec<(usize, bool)>> {
        let overlapping: Vec<usize> = set
            .areas
            .iter()
            .enumerate()
            .filter(|(_, area)| area.overlaps(Vaddr(start), Vaddr(end)))
            .map(|(idx, _)| idx)
            .collect();

        let mut plan = Vec::with_capacity(overlapping.len());
        for idx in overlapping {
            let area = &set.areas[idx];
            let (base, area_end) = (area.base().as_usize(), area.end().as_usize());
            match classify(start, end, base, area_end) {
                Overlap::Beyond => {
                    log::warn!(
                        "vm: mapping {:#x}-{:#x} extends beyond area {:#x}-{:#x}",
                        start,
                        end,
                        base,
                        area_end
                    );
                    return Err(VmError::NoSpace);
                }
                Overlap::Inner => {
                    log::error!(
                        "vm: mapping {:#x}-{:#x} falls inside area {:#x}-{:#x}, cannot split",
                        start,
                        end,
                        base,
                        area_end
                    );
                    return Err(VmError::NoSpace);
                }
                Overlap::Exact => plan.push((idx, true)),
                Overlap::Head => plan.push((idx, false)),
            }
        }
        Ok(plan)
    }

    /// 执行 [`Self::plan_reconcile`] 的结果，返回需要释放的页面
    ///
    /// `unmap` 为假时被取代范围内的翻译已被新区域的占位翻译覆盖。
    fn apply_reconcile(
        &self,
        set: &mut AreaSet,
        plan: Vec<(usize, bool)>,
        start: usize,
        end: usize,
        unmap: bool,
    ) -> Vec<(Vpn, Arc<VmPage>)> {
        let mut released = Vec::new();
        let mut removed = Vec::new();
        for (idx, exact) in plan {
            let area = set.areas[idx].clone();
            if exact {
                released.extend(self.take_area(&area, unmap));
                removed.push(idx);
            } else {
                let new_end = self.shrink_head(&area, end - start, unmap, &mut released);
                if set.next_free < new_end {
                    set.next_free = new_end;
                }
            }
        }
        removed.sort_unstable();
        for idx in removed.into_iter().rev() {
            set.areas.remove(idx);
        }
        released
    }

    /// 恢复区域在 `range` 内的翻译，用于新映射在页表中预留失败之后
    fn restore_translations(&self, area: &VmArea, range: VpnRange) {
        let pte_flags = area.flags().to_pte_flags();
        let range = VpnRange::new(
            range.start().max(area.vpn_range().start()),
            range.end().min(area.vpn_range().end()),
        );
        let slots: Vec<(Vpn, Arc<VmPage>)> = area
            .slots()
            .into_iter()
            .filter(|(vpn, _)| range.contains(*vpn))
            .collect();

        let mut pt = self.page_table.lock();
        let cleared = if area.is_demand() {
            pt.unmap_pages(range.start(), range.len())
        } else {
            pt.map_pages(range.start(), None, range.len(), UniversalPTEFlag::empty())
        };
        if let Err(err) = cleared {
            log::warn!("vm: failed to restore area {}: {:?}", area.id().0, err);
        }
        drop(pt);

        for (vpn, page) in slots {
            let Some(ppn) = page.ppn() else {
                continue;
            };
            // 共享页总是只读映射，写访问走写时复制
            let flags = if page.is_shared() {
                pte_flags - UniversalPTEFlag::WRITEABLE
            } else {
                pte_flags
            };
            if let Err(err) = self.map_one(vpn, ppn, flags) {
                log::warn!("vm: failed to restore translation {}: {}", vpn, err);
            }
        }
    }

    /// 从区域头部去掉 `len` 字节，返回收缩后区域的结束地址
    fn shrink_head(
        &self,
        area: &VmArea,
        len: usize,
        unmap: bool,
        released: &mut Vec<(Vpn, Arc<VmPage>)>,
    ) -> usize {
        let mut inner = area.lock();
        let head = VpnRange::from_start_len(Vpn::from_addr_floor(inner.base), len / page_size());
        released.extend(inner.take_slots(head));
        if unmap {
            if let Err(err) = self
                .page_table
                .lock()
                .unmap_pages(head.start(), head.len())
            {
                log::warn!("vm: failed to unmap shrunk head: {:?}", err);
            }
        }
        let old = (inner.base, inner.len);
        inner.base = inner.base + round_up(len);
        inner.len = round_up(old.1 - len);
        if let Some(backing) = inner.backing.as_mut() {
            backing.offset += len;
            backing.len = backing.len.saturating_sub(len);
        }
        log::trace!(
            "vm: area {:#x}-{:#x} shrunk to {:#x}-{:#x}",
            old.0.as_usize(),
            old.0.as_usize() + old.1,
            inner.base.as_usize(),
            inner.end().as_usize()
        );
        inner.end().as_usize()
    }

    /// 将区域标记为已移除并拆除其翻译，返回需要释放的页面
    fn detach_area(&self, area: &VmArea) -> Vec<(Vpn, Arc<VmPage>)> {
        self.take_area(area, true)
    }

    fn take_area(&self, area: &VmArea, unmap: bool) -> Vec<(Vpn, Arc<VmPage>)> {
        let (slots, backing) = {
            let mut inner = area.lock();
            inner.detached = true;
            let range = inner.vpn_range();
            if unmap {
                if let Err(err) = self.page_table.lock().unmap_pages(range.start(), range.len()) {
                    log::warn!("vm: failed to unmap area {:#x}: {:?}", inner.base.as_usize(), err);
                }
            }
            let slots: Vec<(Vpn, Arc<VmPage>)> =
                core::mem::take(&mut inner.resolved).into_iter().collect();
            (slots, inner.backing.take())
        };
        drop(backing);
        slots
    }

    /// 释放页面：私有页归还帧，共享页减少一个引用
    pub(crate) fn release_pages(&self, pages: Vec<(Vpn, Arc<VmPage>)>) {
        for (_, page) in pages {
            self.release_page(&page);
        }
    }

    pub(crate) fn release_page(&self, page: &Arc<VmPage>) {
        if page.is_shared() {
            self.ctx.cache().release(page);
        } else {
            drop(page.take_frame());
        }
    }

    /// 移除一个区域
    ///
    /// 私有页随之销毁，共享页减少一个引用，文件引用被放弃。
    pub fn unmap(&self, area: &Arc<VmArea>) -> VmResult<()> {
        let released = {
            let mut set = self.areas.lock();
            let idx = set
                .areas
                .iter()
                .position(|a| Arc::ptr_eq(a, area))
                .ok_or(VmError::BadAddress)?;
            set.areas.remove(idx);
            self.detach_area(area)
        };
        self.release_pages(released);
        log::trace!("vm: unmapped area {}", area.id().0);
        Ok(())
    }

    /// 移除包含 `vaddr` 的区域
    pub fn unmap_at(&self, vaddr: Vaddr) -> VmResult<()> {
        let area = self.find_area(vaddr).ok_or(VmError::BadAddress)?;
        self.unmap(&area)
    }

    /// 为非按需缺页区域的每个槽位分配清零的私有页并装入页表
    ///
    /// 按需缺页区域在访问时才解析，这里不做任何事。
    pub fn populate(&self, area: &Arc<VmArea>) -> VmResult<()> {
        if area.is_demand() {
            return Ok(());
        }
        let pte_flags = area.flags().to_pte_flags();
        let mut inner = area.lock();
        if inner.detached {
            return Err(VmError::BadAddress);
        }
        for vpn in inner.vpn_range() {
            if inner.resolved.contains_key(&vpn) {
                continue;
            }
            let frame =
                FrameTracker::alloc_zeroed(self.ctx.frames()).ok_or(VmError::ResourceExhausted)?;
            let ppn = frame.ppn();
            let page = VmPage::new_private(area.id(), frame, vpn.start_addr());
            self.page_table
                .lock()
                .map_pages(vpn, Some(ppn), 1, pte_flags)?;
            inner.resolved.insert(vpn, page);
        }
        Ok(())
    }

    /// 把页面装入槽位并建立翻译
    ///
    /// 槽位已不属于区域（区域被移除或收缩）时放弃页面并返回
    /// [`VmError::BadAddress`]。
    pub(crate) fn install(
        &self,
        area: &VmArea,
        vpn: Vpn,
        page: Arc<VmPage>,
        ppn: Ppn,
        flags: UniversalPTEFlag,
    ) -> VmResult<()> {
        let mut inner = area.lock();
        if !inner.contains_vpn(vpn) {
            drop(inner);
            self.release_page(&page);
            return Err(VmError::BadAddress);
        }
        if let Err(err) = self.page_table.lock().map_pages(vpn, Some(ppn), 1, flags) {
            drop(inner);
            self.release_page(&page);
            return Err(err.into());
        }
        let old = inner.resolved.insert(vpn, page);
        drop(inner);
        if let Some(old) = old {
            self.release_page(&old);
        }
        Ok(())
    }

    /// 更新一个槽位的翻译
    pub(crate) fn map_one(&self, vpn: Vpn, ppn: Ppn, flags: UniversalPTEFlag) -> VmResult<()> {
        self.page_table.lock().map_pages(vpn, Some(ppn), 1, flags)?;
        Ok(())
    }

    /// 释放所有区域
    pub fn cleanup(&self) {
        let released = {
            let mut set = self.areas.lock();
            let areas = core::mem::take(&mut set.areas);
            set.next_free = mm_config().mmap_base();
            let mut released = Vec::new();
            for area in areas.iter() {
                released.extend(self.detach_area(area));
            }
            released
        };
        self.release_pages(released);
    }

    /// 销毁地址空间
    pub fn destroy(self) {
        log::trace!("vm: destroying space, root ppn {}", self.root_ppn());
        drop(self);
    }

    /// 以 info 级别输出所有区域与已解析页面
    pub fn dump(&self) {
        self.dump_at(log::Level::Info);
    }

    pub(crate) fn dump_at(&self, level: log::Level) {
        for area in self.areas() {
            log::log!(level, "{}", area);
        }
    }

    /// 把 `vaddr` 处的数据读入 `buf`，途中按需解析缺页
    pub fn read_bytes_at(&self, vaddr: Vaddr, buf: &mut [u8]) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = vaddr + done;
            let off = cur.page_offset();
            let n = (page_size() - off).min(buf.len() - done);
            let ppn = self.translate_for(cur, FaultType::Read)?;
            let src = ppn.start_addr().to_vaddr() + off;
            // SAFETY: 页面在翻译中存在，临时映射覆盖整个帧
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), buf[done..].as_mut_ptr(), n);
            }
            done += n;
        }
        Ok(())
    }

    /// 把 `data` 写到 `vaddr` 处，途中按需解析缺页（写时复制在此打破）
    pub fn write_bytes_at(&self, vaddr: Vaddr, data: &[u8]) -> VmResult<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = vaddr + done;
            let off = cur.page_offset();
            let n = (page_size() - off).min(data.len() - done);
            let ppn = self.translate_for(cur, FaultType::Write)?;
            let dst = ppn.start_addr().to_vaddr() + off;
            // SAFETY: 同上，且翻译可写
            unsafe {
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst.as_mut_ptr::<u8>(), n);
            }
            done += n;
        }
        Ok(())
    }

    /// 查询满足访问类型的翻译，不满足时走缺页路径
    fn translate_for(&self, vaddr: Vaddr, access: FaultType) -> VmResult<Ppn> {
        let vpn = Vpn::from_addr_floor(vaddr);
        let mut faults = 0;
        loop {
            let entry = self.page_table.lock().translate(vpn);
            if let Some((ppn, flags)) = entry {
                if access != FaultType::Write || flags.contains(UniversalPTEFlag::WRITEABLE) {
                    return Ok(ppn);
                }
            }
            if faults == 2 {
                return Err(VmError::BadAddress);
            }
            self.handle_page_fault(vaddr, access)?;
            faults += 1;
        }
    }

    pub(crate) fn areas_lock(&self) -> SpinLockGuard<'_, AreaSet> {
        self.areas.lock()
    }
}

impl<PT: PageTableOps> fmt::Display for VmSpace<PT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for area in self.areas() {
            writeln!(f, "{}", area)?;
        }
        Ok(())
    }
}

impl<PT: PageTableOps> fmt::Debug for VmSpace<PT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.areas.lock();
        f.debug_struct("VmSpace")
            .field("areas", &set.areas)
            .field("next_free", &set.next_free)
            .finish()
    }
}

impl<PT: PageTableOps> Drop for VmSpace<PT> {
    fn drop(&mut self) {
        self.cleanup();
        self.page_table.lock().destroy();
    }
}
