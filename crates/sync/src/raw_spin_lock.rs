//! 原始自旋锁
//!
//! 实现 [`lock_api::RawMutex`]，在获取锁的同时屏蔽本地中断（spin_lock_irqsave 语义），
//! 释放锁时恢复。中断状态保存在锁内部，因此 guard 不能跨 CPU 移动。

use crate::intr_guard::IntrGuard;
use core::{
    hint,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// 中断安全的原始自旋锁。
///
/// 不可重入：持锁期间再次 `lock()` 会死锁。
#[derive(Debug)]
pub struct RawSpinLock {
    locked: AtomicBool,
    /// 获取锁前的中断状态，仅持锁者读写
    saved_flags: AtomicUsize,
}

impl RawSpinLock {
    /// 创建一个未上锁的实例
    pub const fn new() -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
            saved_flags: AtomicUsize::new(0),
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: locked 标志通过 Acquire/Release 保证互斥，且只有持锁者调用 unlock
unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock::new();

    // 保存的中断状态属于加锁的 CPU
    type GuardMarker = lock_api::GuardNoSend;

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
        self.saved_flags.store(guard.into_raw(), Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let guard = IntrGuard::new();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved_flags.store(guard.into_raw(), Ordering::Relaxed);
            true
        } else {
            // guard 在此 Drop，立即恢复中断
            false
        }
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_flags.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        // SAFETY: flags 由本 CPU 上的 lock/try_lock 保存，尚未恢复
        drop(unsafe { IntrGuard::from_raw(flags) });
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
