//! 虚拟内存上下文
//!
//! 所有地址空间共享的状态集中在 [`VmContext`] 中显式传递：帧分配器、
//! 页缓存、缺页统计以及启动阶段标志。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::frame_allocator::FrameAllocator;
use crate::vm_page::PageCache;

/// 缺页统计
#[derive(Debug, Default)]
pub struct FaultStats {
    total: AtomicU64,
    zero_fill: AtomicU64,
    page_in: AtomicU64,
    reuse: AtomicU64,
    cow: AtomicU64,
    failures: AtomicU64,
}

/// [`FaultStats`] 的一次快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStatsSnapshot {
    /// 缺页总次数
    pub total: u64,
    /// 以零页解决的次数
    pub zero_fill: u64,
    /// 从后备存储读入页面的次数
    pub page_in: u64,
    /// 直接复用共享缓存页的次数
    pub reuse: u64,
    /// 写时复制的次数
    pub cow: u64,
    /// 失败的次数
    pub failures: u64,
}

impl FaultStats {
    pub(crate) fn record_fault(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_page_in(&self) {
        self.page_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reuse(&self) {
        self.reuse.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 读取当前计数
    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            zero_fill: self.zero_fill.load(Ordering::Relaxed),
            page_in: self.page_in.load(Ordering::Relaxed),
            reuse: self.reuse.load(Ordering::Relaxed),
            cow: self.cow.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// 所有地址空间共享的虚拟内存状态
pub struct VmContext {
    frames: Arc<dyn FrameAllocator>,
    cache: PageCache,
    stats: FaultStats,
    bootstrap: AtomicBool,
}

impl VmContext {
    /// 以给定的帧分配器创建上下文，初始处于启动阶段之外
    pub fn new(frames: Arc<dyn FrameAllocator>) -> Arc<Self> {
        Arc::new(VmContext {
            frames,
            cache: PageCache::new(),
            stats: FaultStats::default(),
            bootstrap: AtomicBool::new(false),
        })
    }

    /// 帧分配器
    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    /// 页缓存
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// 缺页统计
    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// 进入或离开启动阶段
    ///
    /// 启动阶段没有可以终止的进程，缺页路径上的资源耗尽或 I/O 错误会直接停机。
    pub fn set_bootstrap(&self, on: bool) {
        self.bootstrap.store(on, Ordering::Release);
    }

    /// 是否处于启动阶段
    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap.load(Ordering::Acquire)
    }
}
