//! 收包路径入口
//!
//! [`NetRx`] 持有每个 CPU 的 [`SoftnetData`]、运行时配置和协议注册表，提供：
//!
//! - 中断上下文：[`NetRx::netif_rx`]、[`NetRx::napi_schedule`]
//! - 软中断上下文：[`NetRx::net_rx_action`]
//! - 进程上下文：[`NetRx::napi_busy_poll`]
//! - 统计：[`NetRx::softnet_stat`]、[`NetRx::softnet_stat_text`]

use alloc::{
    collections::VecDeque,
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::fmt::Write;

use crate::{
    NetRxError,
    config::{BUSY_POLL_BUDGET, NetRxConfig},
    napi::{Napi, NapiFlags},
    offload::{Ipv4GroOffload, TcpGroOffload},
    ops::{jiffies, net_rx_ops},
    protocol::{PacketHandler, ProtocolTable},
    skb::{ETH_P_IP, SkBuff},
    softnet::{SoftnetData, SoftnetStat},
};

/// 收包路径
pub struct NetRx {
    config: NetRxConfig,
    softnet: Vec<SoftnetData>,
    protocols: ProtocolTable,
}

impl NetRx {
    /// 按系统 CPU 数量创建
    pub fn new(config: NetRxConfig) -> Result<Self, NetRxError> {
        Self::with_cpus(sync::max_cpu_count(), config)
    }

    /// 为 `cpus` 个 CPU 创建，并注册内置的 IPv4/TCP GRO 卸载
    pub fn with_cpus(cpus: usize, config: NetRxConfig) -> Result<Self, NetRxError> {
        if cpus == 0 {
            return Err(NetRxError::InvalidArgument);
        }
        let dev_weight = config.dev_weight();
        let rx = Self {
            softnet: (0..cpus).map(|cpu| SoftnetData::new(cpu, dev_weight)).collect(),
            config,
            protocols: ProtocolTable::new(),
        };
        rx.protocols.add_offload(ETH_P_IP, Arc::new(Ipv4GroOffload))?;
        rx.protocols.add_inet_offload(u8::from(smoltcp::wire::IpProtocol::Tcp), Arc::new(TcpGroOffload))?;
        Ok(rx)
    }

    /// 运行时配置
    pub fn config(&self) -> &NetRxConfig {
        &self.config
    }

    /// 协议注册表
    pub fn protocols(&self) -> &ProtocolTable {
        &self.protocols
    }

    /// CPU 数量
    pub fn cpus(&self) -> usize {
        self.softnet.len()
    }

    /// 某个 CPU 的接收状态
    pub fn softnet(&self, cpu: usize) -> Result<&SoftnetData, NetRxError> {
        self.softnet.get(cpu).ok_or(NetRxError::InvalidCpu)
    }

    /// 注册协议处理器
    pub fn dev_add_pack(&self, ethertype: u16, handler: impl PacketHandler + 'static) -> Result<(), NetRxError> {
        self.protocols.add_pack(ethertype, Arc::new(handler))
    }

    /// 注销协议处理器
    pub fn dev_remove_pack(&self, ethertype: u16) -> Result<(), NetRxError> {
        self.protocols.remove_pack(ethertype)
    }

    /// 按 CPU 位图打开或关闭流量限制
    pub fn set_flow_limit_cpu_bitmap(&self, mask: u64) {
        self.config.store_flow_limit_cpu_bitmap(mask);
        let table_len = self.config.flow_limit_table_len();
        for sd in &self.softnet {
            let enabled = sd.cpu() < 64 && mask & (1 << sd.cpu()) != 0;
            sd.set_flow_limit(enabled.then_some(table_len));
        }
    }

    /// 把报文放入 `cpu` 的输入队列
    ///
    /// 返回报文是否被接受；`local_cpu` 为调用者所在 CPU。
    pub fn enqueue_to_backlog(&self, skb: SkBuff, cpu: usize, local_cpu: usize) -> Result<bool, NetRxError> {
        let sd = self.softnet(cpu)?;
        self.softnet(local_cpu)?;
        Ok(sd.enqueue(skb, self.config.netdev_max_backlog(), local_cpu))
    }

    /// 从中断上下文提交一个报文
    ///
    /// 设备配置了 RPS 映射时按流哈希选择目标 CPU，否则放入本 CPU 的输入队列。
    pub fn netif_rx(&self, local_cpu: usize, mut skb: SkBuff) -> Result<bool, NetRxError> {
        self.softnet(local_cpu)?;
        let cpu = self.get_rps_cpu(&mut skb).unwrap_or(local_cpu);
        self.enqueue_to_backlog(skb, cpu, local_cpu)
    }

    fn get_rps_cpu(&self, skb: &mut SkBuff) -> Option<usize> {
        let map = skb.dev()?.rps_map();
        let cpu = match map.len() {
            0 => return None,
            1 => map[0],
            len => {
                let hash = skb.get_hash();
                if hash == 0 {
                    return None;
                }
                map[reciprocal_scale(hash, len as u32) as usize]
            }
        };
        (cpu < self.cpus()).then_some(cpu)
    }

    /// 调度 NAPI 上下文在 `cpu` 上轮询
    ///
    /// 上下文已调度、正在禁用或已禁用时什么也不做。
    pub fn napi_schedule(&self, cpu: usize, napi: &Arc<Napi>) -> Result<(), NetRxError> {
        self.napi_reschedule(cpu, napi).map(|_| ())
    }

    /// 与 [`NetRx::napi_schedule`] 相同，返回是否真的调度了
    pub fn napi_reschedule(&self, cpu: usize, napi: &Arc<Napi>) -> Result<bool, NetRxError> {
        self.softnet(cpu)?;
        if napi.schedule_prep() {
            self.list_napi(cpu, napi.clone());
            return Ok(true);
        }
        Ok(false)
    }

    /// 把已处于 Scheduled 的上下文放入 `cpu` 的轮询列表
    pub(crate) fn list_napi(&self, cpu: usize, napi: Arc<Napi>) {
        if let Some(sd) = self.softnet.get(cpu) {
            napi.set_poll_cpu(cpu);
            sd.list_napi(napi);
        }
    }

    pub(crate) fn unlist_napi(&self, cpu: usize, napi: &Arc<Napi>) {
        if let Some(sd) = self.softnet.get(cpu) {
            sd.unlist_napi(napi);
        }
    }

    /// NET_RX 软中断处理
    ///
    /// 依次轮询 `cpu` 轮询列表中的上下文，总预算 `netdev_budget` 或时间上限
    /// `netdev_budget_jiffies` 用尽时提前结束并计入 `time_squeeze`。剩余上下文、
    /// 处理期间新调度的上下文和需要重新轮询的上下文按此顺序放回轮询列表，
    /// 列表非空时再次请求软中断。返回本次处理的报文数。
    pub fn net_rx_action(&self, cpu: usize) -> Result<usize, NetRxError> {
        let sd = self.softnet(cpu)?;
        sd.consume_kick();

        let time_limit = jiffies() + self.config.netdev_budget_jiffies();
        let mut budget = self.config.netdev_budget() as isize;
        let mut list = sd.take_poll_list();
        let mut repoll = VecDeque::new();
        let mut work_total = 0;

        while let Some(napi) = list.pop_front() {
            let work = self.napi_poll(sd, &napi, &mut repoll);
            work_total += work;
            budget -= work as isize;
            if budget <= 0 || jiffies() >= time_limit {
                sd.inc_time_squeeze();
                break;
            }
        }

        list.append(&mut sd.take_poll_list());
        list.append(&mut repoll);
        if sd.restore_poll_list(list) {
            net_rx_ops().raise_softirq(cpu);
        }
        Ok(work_total)
    }

    fn napi_poll(&self, sd: &SoftnetData, napi: &Arc<Napi>, repoll: &mut VecDeque<Arc<Napi>>) -> usize {
        if Arc::ptr_eq(napi, sd.backlog()) {
            napi.set_weight(self.config.dev_weight());
        }
        let weight = napi.weight();
        if !napi.begin_poll() {
            return 0;
        }
        napi.set_poll_cpu(sd.cpu());
        sd.inc_polls();

        let work = napi.run_poll(self, sd.cpu(), weight);
        if work > weight {
            log::warn!("netrx: napi {}: poll returned {}, exceeding its budget of {}", napi.id(), work, weight);
        }

        if work < weight {
            // 驱动没有完成时由核心代为完成
            if napi.is_polling() {
                napi.complete_done(self, work);
            }
            return work;
        }

        // 预算用尽时驱动不得修改状态
        if napi.disable_pending() {
            napi.complete(self);
            return work;
        }

        let pending = {
            let mut gro = napi.gro.lock();
            if gro.bitmask() != 0 {
                gro.flush(self, true);
            }
            gro.take_rx_list()
        };
        self.deliver(sd.cpu(), pending);

        if !napi.rearm() {
            log::warn!("netrx: napi {}: budget exhausted after napi rescheduled", napi.id());
            return work;
        }
        repoll.push_back(napi.clone());
        work
    }

    /// 在进程上下文中直接轮询一次
    ///
    /// 上下文空闲时以 [`BUSY_POLL_BUDGET`] 为预算运行轮询函数；若已被调度、正在轮询或禁用，
    /// 返回 `None`（偏好忙轮询的上下文会被记录 MISSED）。
    pub fn napi_busy_poll(&self, cpu: usize, napi: &Arc<Napi>) -> Result<Option<usize>, NetRxError> {
        self.softnet(cpu)?;
        if napi.flags().contains(NapiFlags::NO_BUSY_POLL) || !napi.begin_busy_poll() {
            return Ok(None);
        }
        napi.set_poll_cpu(cpu);
        let work = napi.run_poll(self, cpu, BUSY_POLL_BUDGET);

        let pending = napi.gro.lock().take_rx_list();
        self.deliver(cpu, pending);
        napi.end_busy_poll();

        if work >= BUSY_POLL_BUDGET {
            if napi.rearm() {
                self.list_napi(cpu, napi.clone());
            }
        } else if napi.is_polling() {
            napi.complete_done(self, work);
        }
        Ok(Some(work))
    }

    /// 把报文递交给协议处理器
    pub fn netif_receive_skb(&self, cpu: usize, skb: SkBuff) {
        if let Some(sd) = self.softnet.get(cpu) {
            sd.inc_processed();
        }
        match self.protocols.handler(skb.protocol) {
            Some(handler) => {
                if let Some(dev) = skb.dev() {
                    dev.stats().inc_rx(skb.len());
                }
                handler.receive(skb);
            }
            None => {
                if let Some(dev) = skb.dev() {
                    dev.stats().inc_rx_nohandler();
                }
                log::trace!("netrx: no handler for protocol {:#06x}", skb.protocol);
            }
        }
    }

    pub(crate) fn deliver(&self, cpu: usize, list: Vec<SkBuff>) {
        for skb in list {
            self.netif_receive_skb(cpu, skb);
        }
    }

    /// 每个 CPU 的统计快照
    pub fn softnet_stat(&self) -> Vec<SoftnetStat> {
        self.softnet.iter().map(SoftnetData::stat).collect()
    }

    /// `/proc/net/softnet_stat` 格式的统计
    pub fn softnet_stat_text(&self) -> String {
        let mut out = String::new();
        for stat in self.softnet_stat() {
            let _ = write!(out, "{}", stat);
        }
        out
    }
}

/// 把 32 位值均匀映射到 `[0, ep_ro)`
#[inline]
pub fn reciprocal_scale(val: u32, ep_ro: u32) -> u32 {
    ((val as u64 * ep_ro as u64) >> 32) as u32
}
