//! 写时复制
//!
//! 两个方向：缺页时把共享页提升为私有页，克隆时把页面变为共享。
//! 两者都先取页锁再取槽位锁，并在槽位锁下确认槽位仍然映射着该页面。

use alloc::sync::Arc;

use crate::address::{PageNum, Vpn};
use crate::error::{VmError, VmResult};
use crate::frame_allocator::FrameTracker;
use crate::memory_space::area::{AreaFlags, VmArea};
use crate::memory_space::space::VmSpace;
use crate::page_table::{PageTableOps, UniversalPTEFlag};
use crate::vm_page::{PageFlags, VmPage};

impl<PT: PageTableOps> VmSpace<PT> {
    /// 打破写时复制：复制共享页的全部内容到新的私有页，装入槽位并以
    /// 读写权限重新映射，然后放弃槽位对共享页的引用
    ///
    /// 槽位在此期间被改变时什么也不做。
    pub(crate) fn promote_to_private(
        &self,
        area: &VmArea,
        vpn: Vpn,
        page: &Arc<VmPage>,
    ) -> VmResult<()> {
        let mut frame =
            FrameTracker::alloc(self.context().frames()).ok_or(VmError::ResourceExhausted)?;
        let state = page.lock();
        let src = state.frame.as_ref().ok_or(VmError::InvariantViolation)?;
        frame.as_bytes_mut().copy_from_slice(src.as_bytes());
        let ppn = frame.ppn();
        let private = VmPage::new_private(area.id(), frame, vpn.start_addr());

        {
            let mut inner = area.lock();
            if !inner.contains_vpn(vpn)
                || !inner
                    .resolved
                    .get(&vpn)
                    .is_some_and(|cur| Arc::ptr_eq(cur, page))
            {
                log::trace!("vm: cow slot {} changed, skip", vpn);
                return Ok(());
            }
            self.map_one(vpn, ppn, area.flags().to_pte_flags())?;
            inner.resolved.insert(vpn, private);
        }
        drop(state);

        self.context().cache().release(page);
        self.context().stats().record_cow();
        log::trace!("vm: cow break at {}", vpn);
        Ok(())
    }

    /// 让 `dest` 的槽位共享源槽位上的页面
    ///
    /// 共享页增加一个引用；私有页的帧转移到一个引用计数为 2 的匿名共享页，
    /// 源槽位的翻译降为只读。两边都标记为写时复制。源槽位在此期间被
    /// 改变时返回 `false`，调用者重新读取槽位后重试。
    pub(crate) fn clone_page(
        &self,
        src_area: &VmArea,
        dest: &Self,
        dest_area: &VmArea,
        vpn: Vpn,
        page: &Arc<VmPage>,
    ) -> VmResult<bool> {
        let dest_pte = dest_area.flags().to_pte_flags() - UniversalPTEFlag::WRITEABLE;
        let mut state = page.lock();
        let mut src_inner = src_area.lock();
        if !src_inner
            .resolved
            .get(&vpn)
            .is_some_and(|cur| Arc::ptr_eq(cur, page))
        {
            return Ok(false);
        }

        let (shared, ppn) = if page.is_shared() {
            let ppn = state
                .frame
                .as_ref()
                .map(FrameTracker::ppn)
                .ok_or(VmError::InvariantViolation)?;
            if !self.context().cache().get_ref(page) {
                return Ok(false);
            }
            if dest_area.flags().contains(AreaFlags::WRITE) {
                state.flags.insert(PageFlags::COW);
            }
            (page.clone(), ppn)
        } else {
            let frame = state.frame.take().ok_or(VmError::InvariantViolation)?;
            let ppn = frame.ppn();
            let shared = VmPage::new_cow_anon(frame);
            let src_pte = src_area.flags().to_pte_flags() - UniversalPTEFlag::WRITEABLE;
            self.map_one(vpn, ppn, src_pte)?;
            src_inner.resolved.insert(vpn, shared.clone());
            (shared, ppn)
        };
        drop(src_inner);
        drop(state);

        dest.install(dest_area, vpn, shared, ppn, dest_pte)?;
        Ok(true)
    }

    /// 把源槽位的内容复制到 `dest` 槽位上新分配的私有页
    pub(crate) fn copy_page(
        &self,
        src_area: &VmArea,
        dest: &Self,
        dest_area: &VmArea,
        vpn: Vpn,
    ) -> VmResult<()> {
        let Some(page) = src_area.page_at(vpn) else {
            return Ok(());
        };
        let mut frame =
            FrameTracker::alloc(self.context().frames()).ok_or(VmError::ResourceExhausted)?;
        {
            let state = page.lock();
            let src = state.frame.as_ref().ok_or(VmError::InvariantViolation)?;
            frame.as_bytes_mut().copy_from_slice(src.as_bytes());
        }
        let ppn = frame.ppn();
        let private = VmPage::new_private(dest_area.id(), frame, vpn.start_addr());
        dest.install(dest_area, vpn, private, ppn, dest_area.flags().to_pte_flags())
    }
}
