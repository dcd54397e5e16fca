//! GRO 中的远端校验和卸载
//!
//! 隧道协议在 GRO 阶段按外层部分和推导内层校验和并写入报文，同时记录
//! `(offset, delta)`；会话结束时若报文要交给普通路径，再把字段改回线上的原值。

use crate::{
    NetRxError,
    checksum::{Wsum, csum_add, read_sum16, remcsum_adjust, remcsum_unadjust, write_sum16},
    skb::SkBuff,
};

/// 远端校验和调整记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroRemcsum {
    /// 被改写的校验和字段偏移
    pub offset: usize,
    /// 改写前后的部分和差值，0 表示没有改写
    pub delta: Wsum,
}

impl GroRemcsum {
    /// 空记录
    pub const fn new() -> Self {
        Self { offset: 0, delta: 0 }
    }
}

impl SkBuff {
    /// 处理远端校验和卸载
    ///
    /// `off` 为隧道首部偏移，`hdrlen` 为隧道首部长度，`start`/`offset` 相对隧道首部之后。
    /// `nopartial` 为假时只记录起点，由内层协议按 `Partial` 语义处理。
    pub fn gro_remcsum_process(
        &mut self,
        off: usize,
        hdrlen: usize,
        start: usize,
        offset: usize,
        grc: &mut GroRemcsum,
        nopartial: bool,
    ) -> Result<(), NetRxError> {
        if !self.gro.csum_valid {
            log::warn!("netrx: remcsum without a valid gro checksum");
            return Err(NetRxError::InvalidArgument);
        }
        if !nopartial {
            self.gro.gro_remcsum_start = off + hdrlen + start;
            return Ok(());
        }

        let plen = hdrlen + start.max(offset + 2);
        if self.len() < off + plen {
            return Err(NetRxError::Truncated);
        }
        let csum = self.gro.csum;
        let delta = remcsum_adjust(&mut self.data_mut()[off + hdrlen..], csum, start, offset);
        // 报文被改写，会话部分和同步调整
        self.gro.csum = csum_add(self.gro.csum, delta);

        grc.offset = off + hdrlen + offset;
        grc.delta = delta;
        Ok(())
    }

    /// 撤销 [`SkBuff::gro_remcsum_process`] 对校验和字段的改写
    pub fn gro_remcsum_cleanup(&mut self, grc: &GroRemcsum) {
        if grc.delta == 0 || grc.offset + 2 > self.len() {
            return;
        }
        let mut sum = read_sum16(self.data(), grc.offset);
        remcsum_unadjust(&mut sum, grc.delta);
        write_sum16(self.data_mut(), grc.offset, sum);
    }

    /// 带远端校验和卸载的协议回调结束时调用
    pub fn gro_flush_final_remcsum(&mut self, flush: bool, grc: &GroRemcsum) {
        self.gro.flush |= flush;
        self.gro_remcsum_cleanup(grc);
        self.remcsum_offload = false;
    }
}
