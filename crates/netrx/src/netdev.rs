//! 网络设备
//!
//! 收包路径只关心设备的少数属性：特性位、运行状态、统计计数、NAPI 列表和 RPS 映射。
//! 设备注册到全局设备表后可以按索引、名称或 NAPI ID 查找。

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use bitflags::bitflags;
use lazy_static::lazy_static;
use sync::SpinLock;

use crate::{NetRxError, napi::Napi};

bitflags! {
    /// 设备特性
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NetDeviceFeatures: u32 {
        /// 软件 GRO
        const GRO = 1 << 0;
        /// 接收校验和卸载
        const RXCSUM = 1 << 1;
        /// 接收哈希卸载
        const RXHASH = 1 << 2;
        /// 硬件 LRO
        const LRO = 1 << 3;
        /// 硬件 GRO
        const GRO_HW = 1 << 4;
    }
}

/// 设备接收统计
#[derive(Debug, Default)]
pub struct NetDeviceStats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
    rx_nohandler: AtomicU64,
    rx_csum_fault: AtomicU64,
}

/// [`NetDeviceStats`] 的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetDeviceStatsSnapshot {
    /// 递交给协议层的报文数
    pub rx_packets: u64,
    /// 递交给协议层的字节数
    pub rx_bytes: u64,
    /// 入队时被丢弃的报文数
    pub rx_dropped: u64,
    /// 没有协议处理器的报文数
    pub rx_nohandler: u64,
    /// 硬件校验和与软件结果不一致的次数
    pub rx_csum_fault: u64,
}

impl NetDeviceStats {
    /// 读取当前计数
    pub fn snapshot(&self) -> NetDeviceStatsSnapshot {
        NetDeviceStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_nohandler: self.rx_nohandler.load(Ordering::Relaxed),
            rx_csum_fault: self.rx_csum_fault.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rx_nohandler(&self) {
        self.rx_nohandler.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rx_csum_fault(&self) {
        self.rx_csum_fault.fetch_add(1, Ordering::Relaxed);
    }
}

static NEXT_IFINDEX: AtomicU32 = AtomicU32::new(1);

/// 网络设备
pub struct NetDevice {
    name: String,
    ifindex: u32,
    mtu: AtomicU32,
    features: AtomicU32,
    running: AtomicBool,
    xdp_attached: AtomicBool,
    stats: NetDeviceStats,
    napi_list: SpinLock<Vec<Arc<Napi>>>,
    rps_map: SpinLock<Vec<usize>>,
}

impl NetDevice {
    /// 创建设备，分配新的 ifindex；设备初始为停止状态
    pub fn new(name: &str, features: NetDeviceFeatures) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ifindex: NEXT_IFINDEX.fetch_add(1, Ordering::Relaxed),
            mtu: AtomicU32::new(1500),
            features: AtomicU32::new(features.bits()),
            running: AtomicBool::new(false),
            xdp_attached: AtomicBool::new(false),
            stats: NetDeviceStats::default(),
            napi_list: SpinLock::new(Vec::new()),
            rps_map: SpinLock::new(Vec::new()),
        })
    }

    /// 设备名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 设备索引
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// MTU
    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// 修改 MTU
    pub fn set_mtu(&self, mtu: u32) -> Result<(), NetRxError> {
        if mtu == 0 {
            return Err(NetRxError::InvalidArgument);
        }
        self.mtu.store(mtu, Ordering::Relaxed);
        Ok(())
    }

    /// 当前特性
    pub fn features(&self) -> NetDeviceFeatures {
        NetDeviceFeatures::from_bits_truncate(self.features.load(Ordering::Relaxed))
    }

    /// 修改特性
    pub fn set_features(&self, features: NetDeviceFeatures) {
        self.features.store(features.bits(), Ordering::Relaxed);
    }

    /// 启动设备
    pub fn open(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// 停止设备，之后到达的报文在入队时被丢弃
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// 设备是否在运行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 标记是否挂载了 XDP 程序
    pub fn set_xdp_attached(&self, attached: bool) {
        self.xdp_attached.store(attached, Ordering::Relaxed);
    }

    /// 是否跳过 GRO：未开启 GRO 特性或挂载了 XDP 程序
    pub fn netif_elide_gro(&self) -> bool {
        !self.features().contains(NetDeviceFeatures::GRO) || self.xdp_attached.load(Ordering::Relaxed)
    }

    /// 接收统计
    pub fn stats(&self) -> &NetDeviceStats {
        &self.stats
    }

    /// 设置 RPS CPU 映射，空表示关闭 RPS
    pub fn set_rps_map(&self, cpus: &[usize]) {
        *self.rps_map.lock() = cpus.to_vec();
    }

    /// RPS CPU 映射
    pub fn rps_map(&self) -> Vec<usize> {
        self.rps_map.lock().clone()
    }

    /// 挂在该设备上的 NAPI 上下文
    pub fn napis(&self) -> Vec<Arc<Napi>> {
        self.napi_list.lock().clone()
    }

    pub(crate) fn attach_napi(&self, napi: Arc<Napi>) {
        self.napi_list.lock().push(napi);
    }

    pub(crate) fn detach_napi(&self, napi: &Arc<Napi>) {
        self.napi_list.lock().retain(|n| !Arc::ptr_eq(n, napi));
    }
}

impl fmt::Debug for NetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetDevice")
            .field("name", &self.name)
            .field("ifindex", &self.ifindex)
            .field("features", &self.features())
            .field("running", &self.is_running())
            .finish()
    }
}

lazy_static! {
    /// 全局网络设备表
    static ref NET_DEVICES: SpinLock<Vec<Arc<NetDevice>>> = SpinLock::new(Vec::new());
}

/// 注册设备，名称必须唯一
pub fn register_netdevice(dev: Arc<NetDevice>) -> Result<(), NetRxError> {
    let mut devices = NET_DEVICES.lock();
    if devices.iter().any(|d| d.name == dev.name) {
        return Err(NetRxError::AlreadyRegistered);
    }
    log::debug!("netrx: register netdevice {} (ifindex {})", dev.name, dev.ifindex);
    devices.push(dev);
    Ok(())
}

/// 注销设备
pub fn unregister_netdevice(dev: &Arc<NetDevice>) {
    dev.close();
    NET_DEVICES.lock().retain(|d| !Arc::ptr_eq(d, dev));
    log::debug!("netrx: unregister netdevice {}", dev.name);
}

/// 按索引查找设备
pub fn dev_get_by_index(ifindex: u32) -> Option<Arc<NetDevice>> {
    NET_DEVICES.lock().iter().find(|d| d.ifindex == ifindex).cloned()
}

/// 按名称查找设备
pub fn dev_get_by_name(name: &str) -> Option<Arc<NetDevice>> {
    NET_DEVICES.lock().iter().find(|d| d.name == name).cloned()
}

/// 所有已注册设备
pub fn net_devices() -> Vec<Arc<NetDevice>> {
    NET_DEVICES.lock().clone()
}
