//! 物理页对象
//!
//! [`VmPage`] 描述一个被映射到某个区域槽位的物理页：
//!
//! - **共享页**：由页缓存（文件页）或克隆（匿名写时复制页）产生，可以同时
//!   出现在多个 (区域, 槽位) 中，引用计数等于映射它的槽位数。
//! - **私有页**：只属于一个区域的一个槽位，随槽位销毁。
//!
//! 页锁是一个不关中断的自旋锁，保护标志、帧与反向引用；填充页面时
//! 持有它跨越后备存储读取。`PENDING` 的页面永远不会被装入页表。

mod cache;

pub use cache::{CacheKey, PageCache};

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;
use bitflags::bitflags;
use sync::{SpinLockWithoutGuard, SpinLockWithoutGuardGuard};

use crate::address::{Ppn, Vaddr};
use crate::frame_allocator::FrameTracker;
use crate::memory_space::AreaId;

bitflags! {
    /// 页面状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// 内容尚未就绪，由创建者填充
        const PENDING = 1 << 0;
        /// 内容只读（缓存页）
        const READONLY = 1 << 1;
        /// 写入前必须复制
        const COW = 1 << 2;
        /// 私有页
        const PRIVATE = 1 << 3;
        /// 填充失败，等待者需要重新查找
        const FAILED = 1 << 4;
    }
}

/// 页面种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// 共享页；`key` 为 `None` 表示克隆私有页得到的匿名共享页
    Shared {
        /// 页缓存键
        key: Option<CacheKey>,
    },
    /// 私有页
    Private {
        /// 所属区域
        owner: AreaId,
    },
}

pub(crate) struct PageState {
    pub(crate) flags: PageFlags,
    pub(crate) frame: Option<FrameTracker>,
    /// 私有页所在的虚拟槽位，不持有区域
    pub(crate) vaddr: Option<Vaddr>,
}

/// 等待一个正在填充的页面的结果
pub(crate) enum WaitResult {
    Ready,
    Failed,
}

/// 被映射到槽位的物理页
pub struct VmPage {
    kind: PageKind,
    /// 仅对共享页有意义，只在页缓存锁下修改
    refs: AtomicUsize,
    state: SpinLockWithoutGuard<PageState>,
}

impl VmPage {
    /// 创建私有页，帧内容由调用者初始化
    pub(crate) fn new_private(owner: AreaId, frame: FrameTracker, vaddr: Vaddr) -> Arc<Self> {
        Arc::new(VmPage {
            kind: PageKind::Private { owner },
            refs: AtomicUsize::new(0),
            state: SpinLockWithoutGuard::new(PageState {
                flags: PageFlags::PRIVATE,
                frame: Some(frame),
                vaddr: Some(vaddr),
            }),
        })
    }

    /// 创建等待填充的缓存页，引用计数为 1（创建者持有）
    pub(crate) fn new_pending(key: CacheKey) -> Arc<Self> {
        Arc::new(VmPage {
            kind: PageKind::Shared { key: Some(key) },
            refs: AtomicUsize::new(1),
            state: SpinLockWithoutGuard::new(PageState {
                flags: PageFlags::PENDING | PageFlags::READONLY,
                frame: None,
                vaddr: None,
            }),
        })
    }

    /// 接管私有页的帧，得到被两个槽位共享的匿名写时复制页
    pub(crate) fn new_cow_anon(frame: FrameTracker) -> Arc<Self> {
        Arc::new(VmPage {
            kind: PageKind::Shared { key: None },
            refs: AtomicUsize::new(2),
            state: SpinLockWithoutGuard::new(PageState {
                flags: PageFlags::COW | PageFlags::READONLY,
                frame: Some(frame),
                vaddr: None,
            }),
        })
    }

    /// 页面种类
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// 是否为共享页
    pub fn is_shared(&self) -> bool {
        matches!(self.kind, PageKind::Shared { .. })
    }

    /// 是否为私有页
    pub fn is_private(&self) -> bool {
        matches!(self.kind, PageKind::Private { .. })
    }

    /// 缓存键
    pub fn key(&self) -> Option<CacheKey> {
        match self.kind {
            PageKind::Shared { key } => key,
            PageKind::Private { .. } => None,
        }
    }

    /// 共享引用计数
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn refs(&self) -> &AtomicUsize {
        &self.refs
    }

    /// 当前标志
    pub fn flags(&self) -> PageFlags {
        self.state.lock().flags
    }

    /// 当前持有的物理页号
    pub fn ppn(&self) -> Option<Ppn> {
        self.state.lock().frame.as_ref().map(FrameTracker::ppn)
    }

    /// 私有页的虚拟槽位
    pub fn vaddr(&self) -> Option<Vaddr> {
        self.state.lock().vaddr
    }

    /// 获取页锁
    pub(crate) fn lock(&self) -> SpinLockWithoutGuardGuard<'_, PageState> {
        self.state.lock()
    }

    /// 自旋等待创建者完成填充
    pub(crate) fn wait_ready(&self) -> WaitResult {
        loop {
            {
                let state = self.state.lock();
                if state.flags.contains(PageFlags::FAILED) {
                    return WaitResult::Failed;
                }
                if !state.flags.contains(PageFlags::PENDING) {
                    return WaitResult::Ready;
                }
            }
            core::hint::spin_loop();
        }
    }

    /// 取出帧，使其在调用者手中被释放
    pub(crate) fn take_frame(&self) -> Option<FrameTracker> {
        self.state.lock().frame.take()
    }
}

impl fmt::Debug for VmPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VmPage")
            .field("kind", &self.kind)
            .field("refs", &self.ref_count())
            .field("flags", &state.flags)
            .field("frame", &state.frame)
            .finish()
    }
}

impl fmt::Display for VmPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let ppn = state.frame.as_ref().map(FrameTracker::ppn);
        match self.kind {
            PageKind::Shared { key: Some(key) } => write!(
                f,
                "shared file {}+{:#x} refs={}",
                key.file.0,
                key.offset,
                self.ref_count()
            )?,
            PageKind::Shared { key: None } => write!(f, "shared anon refs={}", self.ref_count())?,
            PageKind::Private { owner } => write!(f, "private area={}", owner.0)?,
        }
        match ppn {
            Some(ppn) => write!(f, " ppn={}", ppn)?,
            None => write!(f, " ppn=none")?,
        }
        if state.flags.contains(PageFlags::COW) {
            write!(f, " cow")?;
        }
        Ok(())
    }
}
