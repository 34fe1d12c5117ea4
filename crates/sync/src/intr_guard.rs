//! 中断保护器
//!
//! 注意：禁用中断只能阻止**本地 CPU** 的“任务 vs 本地中断”并发，
//! 并不能阻止其他 CPU 的并行访问；多核共享数据仍需要配合自旋锁。

use crate::arch_ops;

/// 中断保护器，基于 RAII 实现中断保护。
///
/// 创建时禁用中断并保存之前的状态，销毁时恢复。
/// [`crate::RawSpinLock`] 无法持有 RAII 对象（`lock_api` 的原始锁接口是
/// `lock`/`unlock` 两个独立调用），因此也提供 [`IntrGuard::into_flags`] 与
/// [`IntrGuard::from_flags`] 把状态暂存到锁内部。
pub struct IntrGuard {
    flags: usize,
}

impl IntrGuard {
    /// 禁用中断并返回保护器
    pub fn new() -> Self {
        // SAFETY: 保存的状态会在 Drop 时原样恢复
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        IntrGuard { flags }
    }

    /// 放弃 RAII，返回保存的中断状态；调用者负责稍后用 [`IntrGuard::from_flags`] 恢复
    pub fn into_flags(self) -> usize {
        let flags = self.flags;
        core::mem::forget(self);
        flags
    }

    /// 由之前 [`IntrGuard::into_flags`] 得到的状态重建保护器
    ///
    /// # Safety
    /// `flags` 必须来自同一 CPU 上尚未恢复的 [`IntrGuard::into_flags`]
    pub unsafe fn from_flags(flags: usize) -> Self {
        IntrGuard { flags }
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        // SAFETY: flags 是在创建 IntrGuard 时保存的
        unsafe { arch_ops().restore_interrupts(self.flags) };
    }
}
