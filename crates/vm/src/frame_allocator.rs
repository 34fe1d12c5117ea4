//! 帧分配器模块
//!
//! 本模块定义虚拟内存核心使用的物理帧分配接口，并提供一个默认实现。
//!
//! ## 分配接口
//!
//! [`FrameAllocator`] 是外部服务：内核在启动时选择实现并放入
//! [`crate::VmContext`]。虚拟内存核心只关心"给我一个帧"和"归还这个帧"。
//!
//! ## RAII：自动回收
//!
//! [`FrameTracker`] 持有一个已分配的帧以及分配它的分配器，`Drop` 时恰好
//! 归还一次。页面对象通过持有 `FrameTracker` 拥有帧，因此帧的释放时机
//! 就是最后一个拥有者被销毁的时机。
//!
//! ## 默认实现（位图）
//!
//! [`BitmapFrameAllocator`] 使用位图跟踪每个物理帧的分配状态：
//!
//! - **bitmap**：每个 bit 表示一个物理帧（0=空闲，1=已分配）
//! - **last_alloc_hint**：上次分配位置提示，利用局部性加速查找
//!
//! 释放时直接清除对应 bit，O(1) 操作。

use core::fmt;

use alloc::sync::Arc;
use alloc::vec::Vec;
use sync::SpinLock;

use crate::address::{Paddr, PageNum, Ppn, UsizeConvert, page_size};

/// 物理帧分配器
pub trait FrameAllocator: Send + Sync {
    /// 分配一个物理帧，内存耗尽时返回 `None`
    fn alloc_frame(&self) -> Option<Ppn>;

    /// 归还一个物理帧
    fn dealloc_frame(&self, ppn: Ppn);
}

// ============================================================================
// FrameTracker - 单帧 RAII 封装
// ============================================================================

/// 物理帧跟踪器。
/// 实现了 RAII 模式：当此结构体被 drop 时，它所管理的物理页帧会被归还给分配它的分配器。
pub struct FrameTracker {
    ppn: Ppn,
    allocator: Arc<dyn FrameAllocator>,
}

impl FrameTracker {
    /// 分配一个帧，内容未初始化
    pub fn alloc(allocator: &Arc<dyn FrameAllocator>) -> Option<Self> {
        let ppn = allocator.alloc_frame()?;
        Some(FrameTracker {
            ppn,
            allocator: allocator.clone(),
        })
    }

    /// 分配一个帧并清零
    pub fn alloc_zeroed(allocator: &Arc<dyn FrameAllocator>) -> Option<Self> {
        let mut frame = Self::alloc(allocator)?;
        frame.as_bytes_mut().fill(0);
        Some(frame)
    }

    /// 获取此帧跟踪器所管理的物理页号 (Ppn)。
    pub fn ppn(&self) -> Ppn {
        self.ppn
    }

    /// 通过临时映射读取帧内容
    pub fn as_bytes(&self) -> &[u8] {
        let va = self.ppn.start_addr().to_vaddr();
        // SAFETY: 帧由本跟踪器独占持有，临时映射在帧的生命周期内有效
        unsafe { core::slice::from_raw_parts(va.as_ptr::<u8>(), page_size()) }
    }

    /// 通过临时映射写入帧内容
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let va = self.ppn.start_addr().to_vaddr();
        // SAFETY: 同上，且 &mut self 保证没有其他访问者
        unsafe { core::slice::from_raw_parts_mut(va.as_mut_ptr::<u8>(), page_size()) }
    }

    /// 把 `src` 复制到帧开头，其余部分清零
    pub fn fill_from(&mut self, src: &[u8]) {
        let bytes = self.as_bytes_mut();
        let n = src.len().min(bytes.len());
        bytes[..n].copy_from_slice(&src[..n]);
        bytes[n..].fill(0);
    }
}

impl fmt::Debug for FrameTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameTracker").field(&self.ppn).finish()
    }
}

impl Drop for FrameTracker {
    /// 自动回收物理页帧。
    fn drop(&mut self) {
        self.allocator.dealloc_frame(self.ppn);
    }
}

// ============================================================================
// BitmapFrameAllocator - 位图分配器
// ============================================================================

struct Bitmap {
    /// 物理帧的起始 Ppn。
    start: Ppn,
    /// 位图数据，使用 u64 存储以便整字跳过全满的区段。
    bitmap: Vec<u64>,
    /// 总帧数。
    total_frames: usize,
    /// 已分配帧数。
    allocated_count: usize,
    /// 上次分配的位置提示（以 u64 为单位）。
    last_alloc_hint: usize,
}

impl Bitmap {
    #[inline]
    fn is_free(&self, frame_idx: usize) -> bool {
        (self.bitmap[frame_idx / 64] & (1u64 << (frame_idx % 64))) == 0
    }

    fn alloc(&mut self) -> Option<Ppn> {
        let words = self.bitmap.len();
        // 循环查找：[hint, end) + [0, hint)
        for offset in 0..words {
            let idx = (self.last_alloc_hint + offset) % words;
            let word = self.bitmap[idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let frame_idx = idx * 64 + bit;
            if frame_idx >= self.total_frames {
                continue;
            }
            self.bitmap[idx] |= 1u64 << bit;
            self.allocated_count += 1;
            self.last_alloc_hint = idx;
            return Some(self.start.offset(frame_idx));
        }
        None
    }

    fn dealloc(&mut self, ppn: Ppn) {
        debug_assert!(
            ppn >= self.start && ppn.as_usize() < self.start.as_usize() + self.total_frames,
            "dealloc_frame: frame out of range"
        );
        let frame_idx = ppn.as_usize() - self.start.as_usize();
        debug_assert!(
            !self.is_free(frame_idx),
            "dealloc_frame: double free detected"
        );
        self.bitmap[frame_idx / 64] &= !(1u64 << (frame_idx % 64));
        self.allocated_count -= 1;
    }
}

/// 位图物理帧分配器，由自旋锁保护
pub struct BitmapFrameAllocator {
    inner: SpinLock<Bitmap>,
}

impl BitmapFrameAllocator {
    /// 管理物理地址区间 `[start_addr, end_addr)` 中完整的页
    pub fn new(start_addr: usize, end_addr: usize) -> Self {
        // 起始地址向上取整，结束地址向下取整
        let start = Ppn::from_addr_ceil(Paddr::from_usize(start_addr));
        let end = Ppn::from_addr_floor(Paddr::from_usize(end_addr));
        let total_frames = end.as_usize().saturating_sub(start.as_usize());
        BitmapFrameAllocator {
            inner: SpinLock::new(Bitmap {
                start,
                bitmap: alloc::vec![0u64; total_frames.div_ceil(64)],
                total_frames,
                allocated_count: 0,
                last_alloc_hint: 0,
            }),
        }
    }

    /// 获取总的物理帧数
    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames
    }

    /// 获取已分配的帧数
    pub fn allocated_frames(&self) -> usize {
        self.inner.lock().allocated_count
    }

    /// 获取空闲的帧数
    pub fn free_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.total_frames - inner.allocated_count
    }

    /// 某个帧当前是否已分配
    pub fn is_allocated(&self, ppn: Ppn) -> bool {
        let inner = self.inner.lock();
        match ppn.as_usize().checked_sub(inner.start.as_usize()) {
            Some(idx) if idx < inner.total_frames => !inner.is_free(idx),
            _ => false,
        }
    }
}

impl FrameAllocator for BitmapFrameAllocator {
    fn alloc_frame(&self) -> Option<Ppn> {
        self.inner.lock().alloc()
    }

    fn dealloc_frame(&self, ppn: Ppn) {
        self.inner.lock().dealloc(ppn);
    }
}
