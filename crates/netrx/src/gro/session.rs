//! GRO 会话控制块及其报文辅助函数
//!
//! 报文进入 GRO 时由 [`GroSession::begin`] 初始化，被合并或交给普通路径后不再使用。
//! 协议卸载通过 `SkBuff` 上的 `gro_*` 方法读取首部、推进偏移和校验校验和。

use crate::{
    checksum::{Sum16, Wsum, csum_add, csum_fold, csum_partial, csum_sub},
    skb::{IpSummed, SkBuff},
};

/// GRO 会话控制块
#[derive(Debug, Clone, Default)]
pub struct GroSession {
    /// 当前处理到的偏移（相对报文起点）
    pub data_offset: usize,
    /// 非零表示该报文不能再与后续报文合并
    pub flush: bool,
    /// IP ID 检查结果，在传输层确认同流后再参与 flush 判断
    pub flush_id: u16,
    /// 已聚合的分段数
    pub count: u16,
    /// 远端校验和卸载的起始偏移
    pub gro_remcsum_start: usize,
    /// 第一个分段入队时的 jiffies
    pub age: u64,
    /// 隧道内层协议
    pub proto: u16,
    /// 持有的聚合与当前报文可能属于同一流；当前报文上置位表示已被合并
    pub same_flow: bool,
    /// 已经过一层隧道封装
    pub encap_mark: bool,
    /// `csum` 有效
    pub csum_valid: bool,
    /// 剩余可消耗的硬件“无需校验”层数
    pub csum_cnt: u8,
    /// IP ID 固定（DF 置位）
    pub is_atomic: bool,
    /// 已经过的嵌套 GRO 回调数
    pub recursion_counter: usize,
    /// 从 `data_offset` 开始的部分和，或待校验时的伪首部和
    pub csum: Wsum,
}

impl GroSession {
    /// 为一个刚进入 GRO 的报文建立会话
    pub fn begin(skb: &SkBuff) -> Self {
        let mut session = GroSession {
            data_offset: skb.gro.data_offset,
            flush: skb.is_gso(),
            is_atomic: true,
            ..Default::default()
        };
        match skb.ip_summed {
            IpSummed::Complete => {
                session.csum = skb.csum;
                session.csum_valid = true;
            }
            IpSummed::Unnecessary => {
                session.csum_cnt = skb.csum_level + 1;
            }
            _ => {}
        }
        session
    }
}

impl SkBuff {
    /// GRO 当前偏移
    pub fn gro_offset(&self) -> usize {
        self.gro.data_offset
    }

    /// 从 GRO 当前偏移到末尾的长度
    pub fn gro_len(&self) -> usize {
        self.len().saturating_sub(self.gro.data_offset)
    }

    /// 推进 GRO 偏移
    pub fn gro_pull(&mut self, len: usize) {
        self.gro.data_offset += len;
    }

    /// 从 `offset` 开始长 `hlen` 的首部，报文不够长时返回 `None`
    pub fn gro_header(&self, offset: usize, hlen: usize) -> Option<&[u8]> {
        self.data().get(offset..offset.checked_add(hlen)?)
    }

    /// 网络层首部
    pub fn gro_network_header(&self) -> &[u8] {
        &self.data()[self.network_header.min(self.len())..]
    }

    /// 剥离首部后从会话部分和中减去这段数据
    pub fn gro_postpull_rcsum(&mut self, start: usize, len: usize) {
        if self.gro.csum_valid {
            let part = csum_partial(&self.data()[start..start + len], 0);
            self.gro.csum = csum_sub(self.gro.csum, part);
        }
    }

    /// 当前偏移恰好是远端校验和卸载的起点
    pub fn gro_at_remcsum_start(&self) -> bool {
        self.gro.gro_remcsum_start == self.gro_offset()
    }

    fn gro_checksum_validate_needed(&self, zero_okay: bool, check: Sum16) -> bool {
        (self.ip_summed != IpSummed::Partial || self.csum_start < self.gro_offset())
            && !self.gro_at_remcsum_start()
            && self.gro.csum_cnt == 0
            && (!zero_okay || check != 0)
    }

    /// 用软件完成校验：对 `[gro_offset..]` 求和，加上会话中保存的伪首部和
    fn gro_checksum_complete(&mut self) -> Sum16 {
        let wsum = csum_partial(&self.data()[self.gro_offset()..], 0);
        let sum = csum_fold(csum_add(self.gro.csum, wsum));
        if sum == 0 && self.ip_summed == IpSummed::Complete && !self.csum_complete_sw {
            // 硬件声称的部分和与软件结果不一致
            if let Some(dev) = self.dev() {
                dev.stats().inc_rx_csum_fault();
                log::warn!("netrx: {}: hw csum failure", dev.name());
            }
        }
        self.gro.csum = wsum;
        self.gro.csum_valid = true;
        sum
    }

    fn gro_checksum_validate_complete(&mut self, psum: Wsum) -> Sum16 {
        if self.gro.csum_valid && csum_fold(csum_add(psum, self.gro.csum)) == 0 {
            return 0;
        }
        self.gro.csum = psum;
        self.gro_checksum_complete()
    }

    /// 消耗一层硬件“无需校验”额度，没有额度时记录软件多校验了一层
    pub fn gro_incr_csum_unnecessary(&mut self) {
        if self.gro.csum_cnt > 0 {
            self.gro.csum_cnt -= 1;
        } else {
            self.incr_checksum_unnecessary();
        }
    }

    fn gro_checksum_validate_inner(
        &mut self,
        zero_okay: bool,
        check: Sum16,
        compute_pseudo: impl FnOnce(&SkBuff) -> Wsum,
    ) -> Sum16 {
        let mut ret = 0;
        if self.gro_checksum_validate_needed(zero_okay, check) {
            let psum = compute_pseudo(self);
            ret = self.gro_checksum_validate_complete(psum);
        }
        if ret == 0 {
            self.gro_incr_csum_unnecessary();
        }
        ret
    }

    /// 校验传输层校验和，返回 0 表示通过
    ///
    /// `compute_pseudo` 只在需要软件校验时调用。
    pub fn gro_checksum_validate(&mut self, compute_pseudo: impl FnOnce(&SkBuff) -> Wsum) -> Sum16 {
        self.gro_checksum_validate_inner(false, 0, compute_pseudo)
    }

    /// 与 [`SkBuff::gro_checksum_validate`] 相同，但 `check == 0` 表示报文没有校验和（UDP）
    pub fn gro_checksum_validate_zero_check(
        &mut self,
        check: Sum16,
        compute_pseudo: impl FnOnce(&SkBuff) -> Wsum,
    ) -> Sum16 {
        self.gro_checksum_validate_inner(true, check, compute_pseudo)
    }

    /// 不带伪首部的校验
    pub fn gro_checksum_simple_validate(&mut self) -> Sum16 {
        self.gro_checksum_validate_inner(false, 0, |_| 0)
    }

    /// 还没有任何校验结果时，把会话部分和设为伪首部的反码，供内层协议复用
    pub fn gro_checksum_try_convert(&mut self, compute_pseudo: impl FnOnce(&SkBuff) -> Wsum) {
        if self.gro.csum_cnt == 0 && !self.gro.csum_valid {
            self.gro.csum = !compute_pseudo(self);
            self.gro.csum_valid = true;
        }
    }

    /// 协议回调结束时合并 flush 标志
    pub fn gro_flush_final(&mut self, flush: bool) {
        self.gro.flush |= flush;
    }
}
