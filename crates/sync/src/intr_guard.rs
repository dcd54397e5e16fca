//! 中断保护器
//!
//! 基于 RAII 实现中断保护，在创建时禁用中断，销毁时恢复。
//!
//! 注意：禁用中断只能阻止**本地 CPU** 的“收包软中断 vs 本地硬中断”并发，
//! 并不能阻止其他 CPU 的并行访问；多核共享数据仍需要配合自旋锁。

use crate::arch_ops;

/// 中断保护器，基于 RAII 实现中断保护。
///
/// # 示例
/// ```ignore
/// {
///     let guard = IntrGuard::new(); // 禁用中断
///     // 临界区代码
/// } // 离开作用域，自动恢复中断状态
/// ```
pub struct IntrGuard {
    flags: usize,
}

impl IntrGuard {
    /// 原子地禁用中断并返回一个 IntrGuard 实例。
    pub fn new() -> Self {
        let flags = match arch_ops() {
            // SAFETY: 保存的 flags 只会在 Drop 或 into_raw 的配对路径中恢复
            Some(ops) => unsafe { ops.read_and_disable_interrupts() },
            None => 0,
        };
        IntrGuard { flags }
    }

    /// 放弃 RAII，交出保存的中断状态
    ///
    /// 用于锁实现：中断状态需要跨越 `lock`/`unlock` 两次调用保存。
    pub fn into_raw(self) -> usize {
        let flags = self.flags;
        core::mem::forget(self);
        flags
    }

    /// 由 [`IntrGuard::into_raw`] 交出的状态重建保护器，Drop 时恢复中断
    ///
    /// # Safety
    /// `flags` 必须来自同一 CPU 上尚未恢复的 [`IntrGuard::into_raw`]。
    pub unsafe fn from_raw(flags: usize) -> Self {
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
        if let Some(ops) = arch_ops() {
            // SAFETY: flags 是在创建 IntrGuard 时保存的
            unsafe { ops.restore_interrupts(self.flags) };
        }
    }
}
