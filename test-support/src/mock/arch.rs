//! 架构相关操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `sync` crate（避免循环依赖）。
//! `sync` crate 在 `cfg(test)` 下为这些类型实现其 trait。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Mock 架构操作：用一个原子布尔量模拟本地中断使能位
pub struct MockArchOps {
    interrupt_state: AtomicBool,
    disable_count: AtomicUsize,
}

impl MockArchOps {
    pub const fn new() -> Self {
        Self {
            interrupt_state: AtomicBool::new(true),
            disable_count: AtomicUsize::new(0),
        }
    }

    /// 关闭中断并返回之前的状态（1 = 开启）
    ///
    /// # Safety
    /// 仅用于测试环境。
    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        self.disable_count.fetch_add(1, Ordering::Relaxed);
        self.interrupt_state.swap(false, Ordering::SeqCst) as usize
    }

    /// 恢复中断状态
    ///
    /// # Safety
    /// 仅用于测试环境。
    pub unsafe fn restore_interrupts(&self, flags: usize) {
        self.interrupt_state.store(flags != 0, Ordering::SeqCst);
    }

    /// 当前是否开中断
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupt_state.load(Ordering::SeqCst)
    }

    /// 累计关中断次数
    pub fn disable_count(&self) -> usize {
        self.disable_count.load(Ordering::Relaxed)
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();
