//! 每 CPU 流量限制
//!
//! 输入队列过半后开始记录最近 [`FLOW_LIMIT_HISTORY`] 个报文所属的流桶，
//! 某个流桶占据历史窗口一半以上时丢弃该流的报文，避免单个大流挤占 backlog。

use alloc::{vec, vec::Vec};

use crate::config::FLOW_LIMIT_HISTORY;

/// 流量限制表
#[derive(Debug, Clone)]
pub struct FlowLimit {
    count: u64,
    history_head: usize,
    history: [u16; FLOW_LIMIT_HISTORY],
    buckets: Vec<u8>,
}

impl FlowLimit {
    /// 创建 `num_buckets` 个流桶的表，`num_buckets` 必须为 2 的幂且不超过 65536
    pub fn new(num_buckets: usize) -> Self {
        Self {
            count: 0,
            history_head: 0,
            history: [0; FLOW_LIMIT_HISTORY],
            buckets: vec![0; num_buckets.clamp(1, 1 << 16)],
        }
    }

    /// 被限制丢弃的报文数
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 记录一个哈希为 `hash` 的报文，返回是否应当丢弃
    pub fn should_drop(&mut self, hash: u32) -> bool {
        let new_flow = (hash as usize & (self.buckets.len() - 1)) as u16;
        let old_flow = self.history[self.history_head] as usize;
        self.history[self.history_head] = new_flow;
        self.history_head = (self.history_head + 1) & (FLOW_LIMIT_HISTORY - 1);

        if self.buckets[old_flow] > 0 {
            self.buckets[old_flow] -= 1;
        }
        let bucket = &mut self.buckets[new_flow as usize];
        *bucket = bucket.saturating_add(1);
        if *bucket as usize > FLOW_LIMIT_HISTORY >> 1 {
            self.count += 1;
            return true;
        }
        false
    }
}
