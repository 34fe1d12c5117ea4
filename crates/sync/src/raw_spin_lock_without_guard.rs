//! 不关中断的自旋锁
//!
//! 与 [`crate::RawSpinLock`] 相同的获取逻辑，但不修改中断状态。
//! 持锁期间允许被中断、允许执行会等待设备完成的操作。

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};
use lock_api::{GuardSend, RawMutex};

/// 不关中断自旋锁的原始实现
#[derive(Debug)]
pub struct RawSpinLockWithoutGuard {
    locked: AtomicBool,
}

impl RawSpinLockWithoutGuard {
    /// 创建一个未加锁的实例
    pub const fn new() -> Self {
        RawSpinLockWithoutGuard {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for RawSpinLockWithoutGuard {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for RawSpinLockWithoutGuard {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLockWithoutGuard::new();

    type GuardMarker = GuardSend;

    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
