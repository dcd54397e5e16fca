//! 收包路径运行时操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `netrx` crate（避免循环依赖）。
//! `netrx` crate 在 `cfg(test)` 下为这些类型实现其 trait（`NetRxOps`）。

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Mock 的收包运行时操作
///
/// jiffies 由测试手动推进；软中断请求只计数，不触发任何处理。
pub struct MockNetRxOps {
    jiffies: AtomicU64,
    softirq_raised: AtomicUsize,
    last_softirq_cpu: AtomicUsize,
}

impl MockNetRxOps {
    /// 创建 jiffies 为 0 的实例
    pub const fn new() -> Self {
        Self {
            jiffies: AtomicU64::new(0),
            softirq_raised: AtomicUsize::new(0),
            last_softirq_cpu: AtomicUsize::new(usize::MAX),
        }
    }

    /// 当前 jiffies
    pub fn jiffies(&self) -> u64 {
        self.jiffies.load(Ordering::Acquire)
    }

    /// 推进 jiffies，返回推进后的值
    pub fn advance(&self, ticks: u64) -> u64 {
        self.jiffies.fetch_add(ticks, Ordering::AcqRel) + ticks
    }

    /// 记录一次软中断请求
    pub fn raise_softirq(&self, cpu: usize) {
        self.last_softirq_cpu.store(cpu, Ordering::Release);
        self.softirq_raised.fetch_add(1, Ordering::AcqRel);
    }

    /// 累计的软中断请求次数
    pub fn softirq_raised(&self) -> usize {
        self.softirq_raised.load(Ordering::Acquire)
    }

    /// 最近一次软中断请求的目标 CPU，尚无请求时为 `usize::MAX`
    pub fn last_softirq_cpu(&self) -> usize {
        self.last_softirq_cpu.load(Ordering::Acquire)
    }
}

impl Default for MockNetRxOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_NET_RX_OPS: MockNetRxOps = MockNetRxOps::new();
