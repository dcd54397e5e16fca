//! 收包路径运行时操作 trait 定义和注册
//!
//! 此模块定义了收包路径需要的外部依赖接口，通过 trait 抽象实现与 os crate 的解耦。

use core::sync::atomic::{AtomicUsize, Ordering};

/// 收包路径运行时操作
///
/// os crate 需要实现此 trait 并在启动时注册。
pub trait NetRxOps: Send + Sync {
    /// 当前时钟节拍数
    ///
    /// 用于 GRO 聚合的老化判断和软中断的时间上限
    fn jiffies(&self) -> u64;

    /// 在目标 CPU 上请求 NET_RX 软中断
    ///
    /// 目标 CPU 随后应调用 [`NetRx::net_rx_action`](crate::NetRx::net_rx_action)。
    fn raise_softirq(&self, cpu: usize);

    /// 忙等待中让出 CPU
    fn cpu_relax(&self) {
        sync::cpu_relax();
    }
}

// 使用 AtomicUsize 存储 fat pointer 的两部分
static NET_RX_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static NET_RX_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册收包路径运行时操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_net_rx_ops(ops: &'static dyn NetRxOps) {
    let ptr = ops as *const dyn NetRxOps;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) = unsafe { core::mem::transmute::<*const dyn NetRxOps, (usize, usize)>(ptr) };
    NET_RX_OPS_VTABLE.store(vtable, Ordering::Release);
    NET_RX_OPS_DATA.store(data, Ordering::Release);
}

/// 获取已注册的运行时操作实现
///
/// # Panics
/// 如果尚未调用 [`register_net_rx_ops`] 注册实现，则 panic
#[inline]
pub fn net_rx_ops() -> &'static dyn NetRxOps {
    let data = NET_RX_OPS_DATA.load(Ordering::Acquire);
    let vtable = NET_RX_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        #[cfg(test)]
        {
            extern crate test_support;
            return &test_support::mock::net::MOCK_NET_RX_OPS;
        }
        #[cfg(not(test))]
        panic!("netrx: NetRxOps not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn NetRxOps>((data, vtable)) }
}

/// 当前 jiffies
#[inline]
pub(crate) fn jiffies() -> u64 {
    net_rx_ops().jiffies()
}

#[cfg(test)]
mod test_mock {
    extern crate test_support;

    use super::NetRxOps;

    impl NetRxOps for test_support::mock::net::MockNetRxOps {
        fn jiffies(&self) -> u64 {
            test_support::mock::net::MockNetRxOps::jiffies(self)
        }

        fn raise_softirq(&self, cpu: usize) {
            test_support::mock::net::MockNetRxOps::raise_softirq(self, cpu)
        }
    }

    #[test]
    fn test_net_rx_ops_fallback_does_not_panic() {
        let before = super::net_rx_ops().jiffies();
        assert!(super::net_rx_ops().jiffies() >= before);
        super::net_rx_ops().raise_softirq(0);
        super::net_rx_ops().cpu_relax();
    }
}
