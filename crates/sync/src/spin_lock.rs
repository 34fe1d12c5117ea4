//! 自旋锁封装
//!
//! # 示例
//! ```ignore
//! let lock = SpinLock::new(0);
//! {
//!     let mut guard = lock.lock(); // 获取锁，关闭本地中断
//!     *guard += 1;
//! } // 离开作用域，释放锁并恢复中断状态
//! ```
//!
//! # 注意
//! 两种锁都不可重入。SpinLock 持锁期间中断处于关闭状态，应避免长时间持有；
//! 需要在持锁期间等待 I/O 时使用 [`SpinLockWithoutGuard`]。

use crate::raw_spin_lock::RawSpinLock;
use crate::raw_spin_lock_without_guard::RawSpinLockWithoutGuard;

/// 关中断自旋锁
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// [`SpinLock`] 的 RAII 守卫
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// 不关中断的自旋锁
pub type SpinLockWithoutGuard<T> = lock_api::Mutex<RawSpinLockWithoutGuard, T>;

/// [`SpinLockWithoutGuard`] 的 RAII 守卫
pub type SpinLockWithoutGuardGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLockWithoutGuard, T>;
