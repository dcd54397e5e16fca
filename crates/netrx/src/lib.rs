//! 网络收包路径
//!
//! 此 crate 实现驱动与协议栈之间的接收路径，包括：
//!
//! - 每 CPU 输入队列与 backlog 处理（[`SoftnetData`]）
//! - NAPI 轮询上下文及其状态机（[`Napi`]）
//! - 通用接收卸载 GRO（[`GroEngine`]），内置 IPv4/TCP 卸载
//! - 校验和辅助与远程校验和卸载（[`checksum`]、[`GroRemcsum`]）
//! - RPS 跨 CPU 分发与流量限制
//! - `/proc/net/softnet_stat` 格式的统计
//!
//! # 运行时依赖
//!
//! 时钟和软中断由 [`NetRxOps`] 抽象，os crate 在启动时调用 [`register_net_rx_ops`] 注册；
//! 锁和 CPU 编号来自 `sync` crate。

#![no_std]

extern crate alloc;

pub mod checksum;
pub mod config;
mod error;
mod flow_limit;
pub mod gro;
mod napi;
mod netdev;
pub mod offload;
mod ops;
mod protocol;
mod rx;
mod skb;
mod softnet;

#[cfg(test)]
mod tests;

pub use config::NetRxConfig;
pub use error::NetRxError;
pub use flow_limit::FlowLimit;
pub use gro::{
    GroEngine, GroList, GroRemcsum, GroResult, GroSession, call_gro_receive, gro_list_prepare,
    gro_merge,
};
pub use napi::{
    Napi, NapiContext, NapiFlags, NapiPoll, NapiState, dev_get_by_napi_id, napi_by_id,
    netif_napi_add, netif_napi_del, netif_tx_napi_add,
};
pub use netdev::{
    NetDevice, NetDeviceFeatures, NetDeviceStats, NetDeviceStatsSnapshot, dev_get_by_index,
    dev_get_by_name, net_devices, register_netdevice, unregister_netdevice,
};
pub use ops::{NetRxOps, net_rx_ops, register_net_rx_ops};
pub use protocol::{GroOffload, PacketHandler, ProtocolTable};
pub use rx::{NetRx, reciprocal_scale};
pub use skb::{ETH_P_ARP, ETH_P_IP, ETH_P_IPV6, GsoType, IpSummed, SkBuff};
pub use softnet::{BacklogDrain, SoftnetData, SoftnetStat};
