//! 缺页解析
//!
//! 缺页只在按需缺页区域内合法。解析分三种情况：
//!
//! - 槽位已解析：写访问打破写时复制，或者确认私有页已可写
//! - 槽位落在文件后备窗口内：从页缓存取得文件页，整页有后备且区域不是
//!   私有映射时直接复用缓存页，否则复制有后备的前缀并补零
//! - 其余情况：分配清零的私有页
//!
//! 同一槽位上的缺页通过区域的 `in_flight` 集合串行化；等待期间槽位被
//! 其他缺页者解析时，直接返回成功，由硬件重新执行访问。

use alloc::sync::Arc;

use crate::address::{PageNum, Vaddr, Vpn, UsizeConvert, page_size};
use crate::error::{VmError, VmResult};
use crate::file::{VmFile, read_exact};
use crate::frame_allocator::FrameTracker;
use crate::memory_space::area::{AreaFlags, Backing, VmArea};
use crate::memory_space::space::VmSpace;
use crate::page_table::{PageTableOps, UniversalPTEFlag};
use crate::vm_page::{CacheKey, PageFlags, VmPage, WaitResult};

/// 缺页访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// 读
    Read,
    /// 写
    Write,
    /// 取指
    Execute,
}

/// 对一个槽位的独占解析权，`Drop` 时交还
struct SlotClaim<'a> {
    area: &'a VmArea,
    vpn: Vpn,
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        self.area.lock().in_flight.remove(&self.vpn);
    }
}

enum Claimed<'a> {
    /// 槽位为空
    Vacant(SlotClaim<'a>),
    /// 槽位上已有页面
    Resolved(SlotClaim<'a>, Arc<VmPage>),
    /// 等待期间槽位已被其他缺页者解析
    Raced,
}

fn claim_slot(area: &VmArea, vpn: Vpn) -> VmResult<Claimed<'_>> {
    let mut waited = false;
    loop {
        {
            let mut inner = area.lock();
            if !inner.contains_vpn(vpn) {
                return Err(VmError::BadAddress);
            }
            if !inner.in_flight.contains(&vpn) {
                let existing = inner.resolved.get(&vpn).cloned();
                if waited && existing.is_some() {
                    return Ok(Claimed::Raced);
                }
                inner.in_flight.insert(vpn);
                drop(inner);
                let claim = SlotClaim { area, vpn };
                return Ok(match existing {
                    Some(page) => Claimed::Resolved(claim, page),
                    None => Claimed::Vacant(claim),
                });
            }
        }
        waited = true;
        core::hint::spin_loop();
    }
}

impl<PT: PageTableOps> VmSpace<PT> {
    /// 解析一次缺页
    ///
    /// 返回错误时由陷入处理者终止出错的上下文；[`VmError::is_fatal`]
    /// 为真的错误要求停机。启动阶段内的资源耗尽与 I/O 错误在这里直接 panic。
    pub fn handle_page_fault(&self, vaddr: Vaddr, access: FaultType) -> VmResult<()> {
        let stats = self.context().stats();
        stats.record_fault();
        log::trace!("vm: {:?} fault at {:#x}", access, vaddr.as_usize());

        let result = self.resolve_fault(vaddr, access);
        if let Err(err) = result {
            stats.record_failure();
            if self.context().is_bootstrap()
                && matches!(err, VmError::ResourceExhausted | VmError::Io(_))
            {
                panic!(
                    "vm: unrecoverable {:?} fault at {:#x} during bootstrap: {}",
                    access,
                    vaddr.as_usize(),
                    err
                );
            }
            log::debug!(
                "vm: {:?} fault at {:#x} failed: {}",
                access,
                vaddr.as_usize(),
                err
            );
        }
        result
    }

    fn resolve_fault(&self, vaddr: Vaddr, access: FaultType) -> VmResult<()> {
        let area = self.find_area(vaddr).ok_or(VmError::BadAddress)?;
        if !area.is_demand() {
            log::error!(
                "vm: fault at {:#x} inside non-demand area {}",
                vaddr.as_usize(),
                area
            );
            self.dump_at(log::Level::Error);
            return Err(VmError::InvariantViolation);
        }

        let write = access == FaultType::Write;
        if !area.permits(write, access == FaultType::Execute) {
            return Err(VmError::BadAddress);
        }

        let vpn = Vpn::from_addr_floor(vaddr);
        match claim_slot(&area, vpn)? {
            Claimed::Raced => Ok(()),
            Claimed::Resolved(_claim, page) => {
                if !write {
                    return Err(VmError::BadAddress);
                }
                if page.is_shared() {
                    self.promote_to_private(&area, vpn, &page)
                } else {
                    // 第二次写同一个私有页
                    Ok(())
                }
            }
            Claimed::Vacant(_claim) => {
                let (offset, backing) = {
                    let inner = area.lock();
                    (vpn.start_addr() - inner.base, inner.backing.clone())
                };
                match backing {
                    Some(backing) if offset < backing.len => {
                        self.fault_file(&area, vpn, &backing, offset)
                    }
                    _ => self.fault_zero(&area, vpn),
                }
            }
        }
    }

    fn fault_zero(&self, area: &VmArea, vpn: Vpn) -> VmResult<()> {
        let frame = FrameTracker::alloc_zeroed(self.context().frames())
            .ok_or(VmError::ResourceExhausted)?;
        let ppn = frame.ppn();
        let page = VmPage::new_private(area.id(), frame, vpn.start_addr());
        self.install(area, vpn, page, ppn, area.flags().to_pte_flags())?;
        self.context().stats().record_zero_fill();
        Ok(())
    }

    /// `offset` 为槽位在区域内的偏移，且落在后备窗口内
    fn fault_file(&self, area: &VmArea, vpn: Vpn, backing: &Backing, offset: usize) -> VmResult<()> {
        let ps = page_size();
        let key = CacheKey {
            file: backing.file.id(),
            offset: backing.offset + offset,
        };
        let page = self.cached_file_page(&*backing.file, key)?;
        let backed = (backing.len - offset).min(ps);
        let flags = area.flags();

        if backed == ps && !flags.contains(AreaFlags::PRIVATE) {
            let mut pte = flags.to_pte_flags();
            let ppn = {
                let mut state = page.lock();
                if flags.contains(AreaFlags::WRITE) {
                    state.flags.insert(PageFlags::COW);
                    pte.remove(UniversalPTEFlag::WRITEABLE);
                }
                state.frame.as_ref().map(FrameTracker::ppn)
            };
            let Some(ppn) = ppn else {
                self.context().cache().release(&page);
                return Err(VmError::InvariantViolation);
            };
            // 缓存引用转交给槽位
            self.install(area, vpn, page, ppn, pte)?;
            self.context().stats().record_reuse();
            return Ok(());
        }

        let Some(mut frame) = FrameTracker::alloc(self.context().frames()) else {
            self.context().cache().release(&page);
            return Err(VmError::ResourceExhausted);
        };
        let copied = {
            let state = page.lock();
            match state.frame.as_ref() {
                Some(src) => {
                    frame.fill_from(&src.as_bytes()[..backed]);
                    true
                }
                None => false,
            }
        };
        self.context().cache().release(&page);
        if !copied {
            return Err(VmError::InvariantViolation);
        }
        let ppn = frame.ppn();
        let private = VmPage::new_private(area.id(), frame, vpn.start_addr());
        self.install(area, vpn, private, ppn, flags.to_pte_flags())
    }

    /// 取得一个已就绪的缓存页（持有一个引用），必要时由本缺页者填充
    fn cached_file_page(&self, file: &dyn VmFile, key: CacheKey) -> VmResult<Arc<VmPage>> {
        let cache = self.context().cache();
        loop {
            let (page, created) = cache.lookup_or_create(key);
            if created {
                return match self.fill_cache_page(file, &page, key.offset) {
                    Ok(()) => Ok(page),
                    Err(err) => {
                        log::warn!(
                            "vm: failed to read page {:#x} of file {}: {}",
                            key.offset,
                            key.file.0,
                            err
                        );
                        cache.abandon(&page);
                        Err(err)
                    }
                };
            }
            match page.wait_ready() {
                WaitResult::Ready => return Ok(page),
                WaitResult::Failed => cache.release(&page),
            }
        }
    }

    fn fill_cache_page(&self, file: &dyn VmFile, page: &VmPage, offset: usize) -> VmResult<()> {
        let mut state = page.lock();
        let mut frame =
            FrameTracker::alloc(self.context().frames()).ok_or(VmError::ResourceExhausted)?;
        let len = file.size().saturating_sub(offset).min(page_size());
        let bytes = frame.as_bytes_mut();
        read_exact(file, offset, &mut bytes[..len])?;
        bytes[len..].fill(0);
        state.frame = Some(frame);
        state.flags.remove(PageFlags::PENDING);
        self.context().stats().record_page_in();
        Ok(())
    }
}
