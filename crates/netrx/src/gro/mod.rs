//! 通用接收卸载（GRO）
//!
//! 每个 NAPI 上下文持有一个 [`GroEngine`]：8 个按流哈希分桶的聚合链表、
//! 一个非空桶位图，以及等待批量递交给普通路径的报文列表。
//!
//! 一个报文进入 [`GroEngine::receive`] 后：
//!
//! 1. 标记桶内与之哈希、设备、VLAN 相同的聚合为可能同流；
//! 2. 调用其以太类型对应的卸载，由卸载逐层匹配并合并；
//! 3. 卸载要求的聚合立即完成并递交；
//! 4. 报文被合并则结束，被标记为 flush 则走普通路径，否则作为新聚合入桶。
//!
//! 链表头部是最新的聚合，尾部最旧。

mod remcsum;
mod session;

pub use remcsum::GroRemcsum;
pub use session::GroSession;

use alloc::{collections::VecDeque, vec::Vec};

use crate::{
    NetRx, NetRxError,
    config::GRO_HASH_BUCKETS,
    ops::jiffies,
    protocol::GroOffload,
    skb::SkBuff,
};

/// 一个哈希桶内的聚合链表，头部最新
pub type GroList = VecDeque<SkBuff>;

/// GRO 处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroResult {
    /// 报文被合并进已有聚合
    Merged,
    /// 报文作为新聚合被持有
    Held,
    /// 报文交给普通路径
    Normal,
}

/// 每个 NAPI 上下文的 GRO 状态
#[derive(Debug, Default)]
pub struct GroEngine {
    hash: [GroList; GRO_HASH_BUCKETS],
    bitmask: u32,
    rx_list: Vec<SkBuff>,
    rx_count: usize,
}

impl GroEngine {
    /// 空引擎
    pub fn new() -> Self {
        Self::default()
    }

    /// 非空桶位图
    pub fn bitmask(&self) -> u32 {
        self.bitmask
    }

    /// 持有的聚合总数
    pub fn held(&self) -> usize {
        self.hash.iter().map(VecDeque::len).sum()
    }

    /// 某个桶持有的聚合
    pub fn bucket(&self, index: usize) -> &GroList {
        &self.hash[index % GRO_HASH_BUCKETS]
    }

    /// 等待递交的分段数
    pub fn rx_count(&self) -> usize {
        self.rx_count
    }

    /// 处理一个报文
    pub fn receive(&mut self, rx: &NetRx, mut skb: SkBuff) -> GroResult {
        if skb.dev().is_some_and(|dev| dev.netif_elide_gro()) {
            self.normal_one(skb, 1);
            return GroResult::Normal;
        }

        let bucket = skb.hash as usize & (GRO_HASH_BUCKETS - 1);
        gro_list_prepare(&mut self.hash[bucket], &skb);

        let Some(offload) = rx.protocols().offload(skb.protocol) else {
            self.normal_one(skb, 1);
            self.update_bitmask(bucket);
            return GroResult::Normal;
        };

        skb.gro = GroSession::begin(&skb);
        skb.network_header = skb.gro_offset();
        // 顶层卸载直接调用，不计入嵌套层数
        let pp = offload.gro_receive(rx, &mut self.hash[bucket], &mut skb);

        if let Some(p) = pp.and_then(|index| self.hash[bucket].remove(index)) {
            self.complete(rx, p);
        }

        let result = if skb.gro.same_flow {
            GroResult::Merged
        } else if skb.gro.flush {
            self.normal_one(skb, 1);
            GroResult::Normal
        } else if let Ok(gso_size) = u16::try_from(skb.gro_len()) {
            if self.hash[bucket].len() >= rx.config().max_gro_skbs() {
                self.flush_oldest(rx, bucket);
            }
            skb.gro.count = 1;
            skb.gro.age = jiffies();
            skb.gso_size = gso_size;
            self.hash[bucket].push_front(skb);
            GroResult::Held
        } else {
            // 负载放不进 gso_size，不能作为聚合头
            self.normal_one(skb, 1);
            GroResult::Normal
        };
        self.update_bitmask(bucket);
        result
    }

    fn update_bitmask(&mut self, bucket: usize) {
        if self.hash[bucket].is_empty() {
            self.bitmask &= !(1 << bucket);
        } else {
            self.bitmask |= 1 << bucket;
        }
    }

    fn flush_oldest(&mut self, rx: &NetRx, bucket: usize) {
        if let Some(oldest) = self.hash[bucket].pop_back() {
            self.complete(rx, oldest);
        }
    }

    /// 完成一个聚合并放入递交列表
    ///
    /// 只有一个分段的报文没有被改动过，跳过协议的完成回调。
    pub fn complete(&mut self, rx: &NetRx, mut skb: SkBuff) {
        if skb.gro.count == 1 {
            skb.gso_size = 0;
        } else {
            let Some(offload) = rx.protocols().offload(skb.protocol) else {
                log::warn!("netrx: gro complete without offload for {:#06x}", skb.protocol);
                return;
            };
            if let Err(err) = offload.gro_complete(rx, &mut skb, 0) {
                log::warn!("netrx: gro complete failed: {:?}", err);
                return;
            }
        }
        let segs = skb.gro.count as usize;
        self.normal_one(skb, segs);
    }

    /// 完成聚合
    ///
    /// `flush_old` 为真时只完成在本 jiffy 之前创建的聚合，否则全部完成。
    pub fn flush(&mut self, rx: &NetRx, flush_old: bool) {
        let now = jiffies();
        for bucket in 0..GRO_HASH_BUCKETS {
            if self.bitmask & (1 << bucket) == 0 {
                continue;
            }
            while let Some(oldest) = self.hash[bucket].back() {
                if flush_old && oldest.gro.age == now {
                    break;
                }
                if let Some(skb) = self.hash[bucket].pop_back() {
                    self.complete(rx, skb);
                }
            }
            self.update_bitmask(bucket);
        }
    }

    fn normal_one(&mut self, skb: SkBuff, segs: usize) {
        self.rx_list.push(skb);
        self.rx_count += segs;
    }

    /// 递交列表达到批量阈值时取出
    pub fn take_batch(&mut self, batch: usize) -> Option<Vec<SkBuff>> {
        if self.rx_count >= batch {
            Some(self.take_rx_list())
        } else {
            None
        }
    }

    /// 取出全部待递交报文
    pub fn take_rx_list(&mut self) -> Vec<SkBuff> {
        self.rx_count = 0;
        core::mem::take(&mut self.rx_list)
    }

    /// 丢弃持有的聚合和待递交报文
    pub fn discard(&mut self) -> usize {
        let dropped = self.held() + self.rx_list.len();
        for bucket in self.hash.iter_mut() {
            bucket.clear();
        }
        self.bitmask = 0;
        self.rx_list.clear();
        self.rx_count = 0;
        dropped
    }
}

/// 在桶内标记可能同流的聚合
///
/// 同流要求流哈希、接收设备和 VLAN 标签都相同，细节交给各层卸载继续比较。
pub fn gro_list_prepare(head: &mut GroList, skb: &SkBuff) {
    for p in head.iter_mut() {
        if p.hash != skb.hash {
            p.gro.same_flow = false;
            continue;
        }
        let same_dev = match (p.dev(), skb.dev()) {
            (Some(a), Some(b)) => alloc::sync::Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        p.gro.same_flow = same_dev && p.vlan_tci == skb.vlan_tci;
    }
}

/// 嵌套调用下一层卸载
///
/// 达到递归上限时不再调用，把报文标记为 flush。
pub fn call_gro_receive(
    rx: &NetRx,
    offload: &dyn GroOffload,
    head: &mut GroList,
    skb: &mut SkBuff,
) -> Option<usize> {
    skb.gro.recursion_counter += 1;
    if skb.gro.recursion_counter >= rx.config().gro_recursion_limit() {
        log::debug!("netrx: gro recursion limit reached, flushing");
        skb.gro.flush = true;
        return None;
    }
    offload.gro_receive(rx, head, skb)
}

/// 把 `skb` 的负载追加到聚合 `p`
///
/// 超出 `gro_max_size` 或 `gro_max_segs`，或 `skb` 已被标记 flush 时返回 [`NetRxError::TooBig`]。
pub fn gro_merge(rx: &NetRx, p: &mut SkBuff, skb: &mut SkBuff) -> Result<(), NetRxError> {
    let len = skb.gro_len();
    if p.len() + len >= rx.config().gro_max_size()
        || p.gro.count as usize >= rx.config().gro_max_segs()
        || skb.gro.flush
    {
        return Err(NetRxError::TooBig);
    }
    let offset = skb.gro_offset();
    p.append(&skb.data()[offset..]);
    p.gro.count += 1;
    p.csum_complete_sw |= skb.csum_complete_sw;
    skb.gro.same_flow = true;
    Ok(())
}
