//! 关中断自旋锁
//!
//! 基于原子操作实现自旋，获取锁前关闭本地中断，释放锁后恢复。

use crate::intr_guard::IntrGuard;
use core::{
    hint,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use lock_api::{GuardNoSend, RawMutex};

/// 关中断自旋锁的原始实现，供 [`lock_api::Mutex`] 使用。
///
/// 中断状态在持锁期间存放在锁内部，`unlock` 时恢复。
/// 不可重入。
#[derive(Debug)]
pub struct RawSpinLock {
    locked: AtomicBool,
    saved_irq: AtomicUsize,
}

impl RawSpinLock {
    /// 创建一个未加锁的 RawSpinLock
    pub const fn new() -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
            saved_irq: AtomicUsize::new(0),
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock::new();

    // 守卫携带本 CPU 的中断状态，不能跨 CPU 释放
    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        let guard = IntrGuard::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        self.saved_irq.store(guard.into_flags(), Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let guard = IntrGuard::new();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved_irq.store(guard.into_flags(), Ordering::Relaxed);
            true
        } else {
            // guard 在此处 drop，立即恢复中断
            false
        }
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_irq.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        // SAFETY: flags 由持锁时的 lock/try_lock 保存
        drop(unsafe { IntrGuard::from_flags(flags) });
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
