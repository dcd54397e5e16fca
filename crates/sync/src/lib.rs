//! 同步原语
//!
//! 向网络收包路径提供中断安全的自旋锁与架构钩子：
//!
//! - [`SpinLock`] - 基于 `lock_api` 的自旋锁，持锁期间屏蔽本地中断
//! - [`IntrGuard`] - RAII 中断保护器
//! - [`cpu_id`] / [`max_cpu_count`] / [`cpu_relax`] - 架构查询
//!
//! # 架构依赖
//!
//! 此 crate 通过 `ArchOps` trait 抽象架构相关操作，由 os crate 在启动时调用
//! [`register_arch_ops`] 注册。注册之前（早期启动或宿主机测试），中断屏蔽为空操作，
//! CPU 编号固定为 0。

#![no_std]

mod intr_guard;
mod raw_spin_lock;
mod spin_lock;

pub use intr_guard::IntrGuard;
pub use raw_spin_lock::RawSpinLock;
pub use spin_lock::{SpinLock, SpinLockGuard};

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关操作的 trait
///
/// 由 os crate 实现并注册，提供中断控制和 CPU 信息
pub trait ArchOps: Send + Sync {
    /// 读取并禁用中断，返回之前的状态
    ///
    /// # Safety
    /// 调用者必须确保在适当的上下文中调用
    unsafe fn read_and_disable_interrupts(&self) -> usize;

    /// 恢复中断状态
    ///
    /// # Safety
    /// flags 必须是之前 read_and_disable_interrupts 返回的值
    unsafe fn restore_interrupts(&self, flags: usize);

    /// 获取当前 CPU ID
    fn cpu_id(&self) -> usize;

    /// 获取最大 CPU 数量
    fn max_cpu_count(&self) -> usize;

    /// 忙等待中让出 CPU（msleep/cpu_relax 的替代）
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }
}

/// 全局架构操作实例（存储 fat pointer 的两个部分）
static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchOps) {
    let ptr = ops as *const dyn ArchOps;
    // SAFETY: transmute 在这里是安全的，因为 fat pointer 的布局是 (data, vtable)
    let (data, vtable) = unsafe { core::mem::transmute::<*const dyn ArchOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 获取架构操作实例，未注册时返回 `None`
#[inline]
pub(crate) fn arch_ops() -> Option<&'static dyn ArchOps> {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    if data == 0 {
        return None;
    }
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    // SAFETY: data 和 vtable 是通过 register_arch_ops 设置的有效指针
    Some(unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchOps>((data, vtable)) })
}

/// 当前 CPU 编号（未注册时为 0）
#[inline]
pub fn cpu_id() -> usize {
    arch_ops().map_or(0, |ops| ops.cpu_id())
}

/// 系统 CPU 数量（未注册时为 1）
#[inline]
pub fn max_cpu_count() -> usize {
    arch_ops().map_or(1, |ops| ops.max_cpu_count().max(1))
}

/// 在自旋等待中调用
#[inline]
pub fn cpu_relax() {
    match arch_ops() {
        Some(ops) => ops.cpu_relax(),
        None => core::hint::spin_loop(),
    }
}
