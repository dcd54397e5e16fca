//! 收包路径配置
//!
//! 编译期常量和可在运行时调整的参数（sysctl 风格）。运行时参数用原子变量保存，
//! 读取方每次使用时重新加载，调整立即生效。

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::NetRxError;

/// 驱动 NAPI 权重的推荐上限，超过时打印警告
pub const NAPI_POLL_WEIGHT: usize = 64;

/// 每个 NAPI 上下文的 GRO 哈希桶数量
pub const GRO_HASH_BUCKETS: usize = 8;

/// 忙轮询单次调用的预算
pub const BUSY_POLL_BUDGET: usize = 8;

/// 流量限制历史窗口长度（必须为 2 的幂）
pub const FLOW_LIMIT_HISTORY: usize = 1 << 7;

/// 可分配给 NAPI 上下文的最小 ID，更小的值保留给 CPU 编号
pub const MIN_NAPI_ID: u32 = 256 + 1;

/// `ip_summed == Unnecessary` 时可以声明的最大封装层数
pub const SKB_MAX_CSUM_LEVEL: u8 = 3;

/// 运行时可调参数
///
/// 所有字段都是原子变量，可以在收包路径运行时修改。
#[derive(Debug)]
pub struct NetRxConfig {
    netdev_max_backlog: AtomicUsize,
    netdev_budget: AtomicUsize,
    netdev_budget_jiffies: AtomicU64,
    dev_weight: AtomicUsize,
    gro_normal_batch: AtomicUsize,
    gro_recursion_limit: AtomicUsize,
    max_gro_skbs: AtomicUsize,
    gro_max_size: AtomicUsize,
    gro_max_segs: AtomicUsize,
    flow_limit_table_len: AtomicUsize,
    flow_limit_cpu_bitmap: AtomicU64,
}

impl NetRxConfig {
    /// 使用默认值创建配置
    pub const fn new() -> Self {
        Self {
            netdev_max_backlog: AtomicUsize::new(1000),
            netdev_budget: AtomicUsize::new(300),
            netdev_budget_jiffies: AtomicU64::new(2),
            dev_weight: AtomicUsize::new(64),
            gro_normal_batch: AtomicUsize::new(8),
            gro_recursion_limit: AtomicUsize::new(15),
            max_gro_skbs: AtomicUsize::new(8),
            gro_max_size: AtomicUsize::new(65536),
            gro_max_segs: AtomicUsize::new(65535),
            flow_limit_table_len: AtomicUsize::new(4096),
            flow_limit_cpu_bitmap: AtomicU64::new(0),
        }
    }

    /// 每个 CPU 输入队列的长度上限
    pub fn netdev_max_backlog(&self) -> usize {
        self.netdev_max_backlog.load(Ordering::Relaxed)
    }

    /// 设置输入队列长度上限
    pub fn set_netdev_max_backlog(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.netdev_max_backlog, value)
    }

    /// 单次 `net_rx_action` 可处理的报文总数
    pub fn netdev_budget(&self) -> usize {
        self.netdev_budget.load(Ordering::Relaxed)
    }

    /// 设置单次软中断预算
    pub fn set_netdev_budget(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.netdev_budget, value)
    }

    /// 单次 `net_rx_action` 的时间上限（jiffies）
    pub fn netdev_budget_jiffies(&self) -> u64 {
        self.netdev_budget_jiffies.load(Ordering::Relaxed)
    }

    /// 设置单次软中断时间上限
    pub fn set_netdev_budget_jiffies(&self, value: u64) -> Result<(), NetRxError> {
        if value == 0 {
            return Err(NetRxError::InvalidArgument);
        }
        self.netdev_budget_jiffies.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// backlog NAPI 的权重
    pub fn dev_weight(&self) -> usize {
        self.dev_weight.load(Ordering::Relaxed)
    }

    /// 设置 backlog NAPI 的权重
    pub fn set_dev_weight(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.dev_weight, value)
    }

    /// GRO 普通路径批量递交的分段数
    pub fn gro_normal_batch(&self) -> usize {
        self.gro_normal_batch.load(Ordering::Relaxed)
    }

    /// 设置批量递交的分段数
    pub fn set_gro_normal_batch(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.gro_normal_batch, value)
    }

    /// 单个报文允许的嵌套 GRO 回调层数
    pub fn gro_recursion_limit(&self) -> usize {
        self.gro_recursion_limit.load(Ordering::Relaxed)
    }

    /// 设置嵌套层数上限
    pub fn set_gro_recursion_limit(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.gro_recursion_limit, value)
    }

    /// 单个哈希桶可以持有的聚合数
    pub fn max_gro_skbs(&self) -> usize {
        self.max_gro_skbs.load(Ordering::Relaxed)
    }

    /// 设置单桶聚合数
    pub fn set_max_gro_skbs(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.max_gro_skbs, value)
    }

    /// 聚合报文的最大长度（字节，从网络层首部算起）
    pub fn gro_max_size(&self) -> usize {
        self.gro_max_size.load(Ordering::Relaxed)
    }

    /// 设置聚合报文最大长度
    pub fn set_gro_max_size(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.gro_max_size, value)
    }

    /// 单个聚合最多包含的分段数
    pub fn gro_max_segs(&self) -> usize {
        self.gro_max_segs.load(Ordering::Relaxed)
    }

    /// 设置聚合最大分段数
    pub fn set_gro_max_segs(&self, value: usize) -> Result<(), NetRxError> {
        store_nonzero(&self.gro_max_segs, value)
    }

    /// 流量限制表的桶数
    pub fn flow_limit_table_len(&self) -> usize {
        self.flow_limit_table_len.load(Ordering::Relaxed)
    }

    /// 设置流量限制表桶数，必须为 2 的幂；只影响之后创建的流量限制表
    pub fn set_flow_limit_table_len(&self, value: usize) -> Result<(), NetRxError> {
        if !value.is_power_of_two() {
            return Err(NetRxError::InvalidArgument);
        }
        self.flow_limit_table_len.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// 启用流量限制的 CPU 位图
    pub fn flow_limit_cpu_bitmap(&self) -> u64 {
        self.flow_limit_cpu_bitmap.load(Ordering::Relaxed)
    }

    pub(crate) fn store_flow_limit_cpu_bitmap(&self, mask: u64) {
        self.flow_limit_cpu_bitmap.store(mask, Ordering::Relaxed);
    }
}

impl Default for NetRxConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn store_nonzero(slot: &AtomicUsize, value: usize) -> Result<(), NetRxError> {
    if value == 0 {
        return Err(NetRxError::InvalidArgument);
    }
    slot.store(value, Ordering::Relaxed);
    Ok(())
}
