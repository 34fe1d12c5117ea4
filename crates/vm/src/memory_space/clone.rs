//! 地址空间克隆
//!
//! fork 与 exec 都通过 [`VmSpace::clone_into`] 构造目标地址空间：
//!
//! - `Fork`：复制除 `NO_CLONE` 与 `MD` 之外的全部区域
//! - `ExecReplace`：额外复制 `MD` 区域，并保留目标中已有的 `MD` 区域
//!
//! 按需缺页区域的页面以写时复制方式共享；预先填充的区域逐页复制。

use crate::address::{UsizeConvert, round_up};
use crate::error::VmResult;
use crate::memory_space::area::AreaFlags;
use crate::memory_space::space::VmSpace;
use crate::mm_config;
use crate::page_table::PageTableOps;

/// 克隆方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// 创建子进程
    Fork,
    /// exec 替换地址空间
    ExecReplace,
}

impl<PT: PageTableOps> VmSpace<PT> {
    /// 把本地址空间克隆到 `dest`
    ///
    /// 失败时立即返回错误，已经部分构造的目标由调用者销毁。
    pub fn clone_into(&self, dest: &Self, mode: CloneMode) -> VmResult<()> {
        let exec = mode == CloneMode::ExecReplace;

        for area in dest.areas() {
            let flags = area.flags();
            let keep = flags.contains(AreaFlags::NO_CLONE) || (exec && flags.contains(AreaFlags::MD));
            if !keep {
                dest.unmap(&area)?;
            }
        }

        for src_area in self.areas() {
            let flags = src_area.flags();
            if flags.contains(AreaFlags::NO_CLONE) || (!exec && flags.contains(AreaFlags::MD)) {
                continue;
            }
            let (base, len, backing) = {
                let inner = src_area.lock();
                (inner.base, inner.len, inner.backing.clone())
            };
            let dest_area = dest.map_area(base, len, flags, backing)?;

            if src_area.is_demand() {
                for (vpn, _) in src_area.slots() {
                    // 槽位在读取之后可能被提升或移除，按当前页面重试
                    while let Some(page) = src_area.page_at(vpn) {
                        if self.clone_page(&src_area, dest, &dest_area, vpn, &page)? {
                            break;
                        }
                    }
                }
            } else {
                for (vpn, _) in src_area.slots() {
                    self.copy_page(&src_area, dest, &dest_area, vpn)?;
                }
            }
        }

        // 没有任何区域时回到映射区起点
        let mut set = dest.areas_lock();
        set.next_free = set
            .areas
            .iter()
            .map(|area| round_up(area.end().as_usize()))
            .max()
            .unwrap_or_else(|| mm_config().mmap_base());
        log::trace!(
            "vm: cloned {} areas ({:?}), next free {:#x}",
            set.areas.len(),
            mode,
            set.next_free
        );
        Ok(())
    }
}
