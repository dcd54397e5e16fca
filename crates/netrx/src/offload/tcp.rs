//! TCP over IPv4 GRO 卸载
//!
//! 同一流（端口相同）且序号连续、标志和选项一致的分段被合并；
//! 完成时把聚合改写为 `Partial` 校验和状态，交由上层或分段时补全。

use alloc::vec::Vec;

use smoltcp::wire::{IpProtocol, TcpPacket};

use crate::{
    NetRx, NetRxError,
    checksum::{csum_tcpudp_magic, write_sum16},
    gro::{GroList, gro_merge},
    offload::inet_gro_compute_pseudo,
    protocol::GroOffload,
    skb::{GsoType, IpSummed, SkBuff, read_be32},
};

const TCP_HLEN: usize = 20;
/// 校验和字段在 TCP 首部中的偏移
const TCP_CHECK_OFFSET: usize = 16;

// 首部第 12..16 字节（数据偏移、标志、窗口）按大端读出后的标志位
const TCP_FLAG_CWR: u32 = 0x0080_0000;
const TCP_FLAG_URG: u32 = 0x0020_0000;
const TCP_FLAG_PSH: u32 = 0x0008_0000;
const TCP_FLAG_RST: u32 = 0x0004_0000;
const TCP_FLAG_SYN: u32 = 0x0002_0000;
const TCP_FLAG_FIN: u32 = 0x0001_0000;

/// TCP GRO 卸载
#[derive(Debug, Default)]
pub struct TcpGroOffload;

fn tcp_flag_word(th: &[u8]) -> u32 {
    read_be32(th, 12)
}

impl GroOffload for TcpGroOffload {
    fn gro_receive(&self, rx: &NetRx, head: &mut GroList, skb: &mut SkBuff) -> Option<usize> {
        let proto = u8::from(IpProtocol::Tcp);
        if !skb.gro.flush && skb.gro_checksum_validate(|skb| inet_gro_compute_pseudo(skb, proto)) != 0 {
            log::trace!("netrx: tcp gro checksum mismatch, flushing");
            skb.gro.flush = true;
            return None;
        }
        tcp_gro_receive(rx, head, skb)
    }

    fn gro_complete(&self, _rx: &NetRx, skb: &mut SkBuff, thoff: usize) -> Result<(), NetRxError> {
        let iph = skb.data().get(skb.network_header..skb.network_header + 20).ok_or(NetRxError::Truncated)?;
        let (saddr, daddr) = (read_be32(iph, 12), read_be32(iph, 16));
        if skb.len() < thoff + TCP_HLEN {
            return Err(NetRxError::Truncated);
        }
        let len = (skb.len() - thoff) as u32;
        let pseudo = !csum_tcpudp_magic(saddr, daddr, len, u8::from(IpProtocol::Tcp), 0);
        write_sum16(skb.data_mut(), thoff + TCP_CHECK_OFFSET, pseudo);

        skb.gso_type |= GsoType::TCPV4;
        if skb.gro.is_atomic {
            skb.gso_type |= GsoType::TCP_FIXEDID;
        }
        skb.transport_header = thoff;
        tcp_gro_complete(skb)
    }
}

fn tcp_gro_complete(skb: &mut SkBuff) -> Result<(), NetRxError> {
    let thoff = skb.transport_header;
    skb.csum_start = thoff;
    skb.csum_offset = TCP_CHECK_OFFSET;
    skb.ip_summed = IpSummed::Partial;
    skb.gso_segs = skb.gro.count;
    if tcp_flag_word(&skb.data()[thoff..]) & TCP_FLAG_CWR != 0 {
        skb.gso_type |= GsoType::TCP_ECN;
    }
    Ok(())
}

/// 与协议无关的 TCP 合并逻辑
///
/// 返回需要立即完成的聚合下标：流结束（FIN/PSH 等）或无法继续合并时。
pub fn tcp_gro_receive(rx: &NetRx, head: &mut GroList, skb: &mut SkBuff) -> Option<usize> {
    let off = skb.gro_offset();
    let Some(th) = tcp_header(skb, off) else {
        skb.gro.flush = true;
        return None;
    };
    let thlen = th.len();
    let tcp = TcpPacket::new_unchecked(&th[..]);

    skb.gro_pull(thlen);
    let len = skb.gro_len();
    let flags = tcp_flag_word(&th);

    let mut found = None;
    for (index, p) in head.iter_mut().enumerate() {
        if !p.gro.same_flow {
            continue;
        }
        if !same_ports(p, &th) {
            p.gro.same_flow = false;
            continue;
        }
        found = Some(index);
        break;
    }

    let mut mss = 1usize;
    if let Some(index) = found {
        let p = &mut head[index];
        match tcp_header(p, p.transport_header) {
            Some(th2) => {
                let tcp2 = TcpPacket::new_unchecked(&th2[..]);

                let mut flush = p.gro.flush;
                flush |= flags & TCP_FLAG_CWR != 0;
                flush |= (flags ^ tcp_flag_word(&th2)) & !(TCP_FLAG_CWR | TCP_FLAG_FIN | TCP_FLAG_PSH) != 0;
                flush |= tcp.ack_number() != tcp2.ack_number();
                // 选项必须逐字节相同
                flush |= th[TCP_HLEN..] != th2[TCP_HLEN..];

                // 第二个分段到达时决定这条流的 IP ID 是固定还是递增
                if p.gro.flush_id != 1 || p.gro.count != 1 || !p.gro.is_atomic {
                    flush |= p.gro.flush_id != 0;
                } else {
                    p.gro.is_atomic = false;
                }

                mss = p.gso_size as usize;
                flush |= len.wrapping_sub(1) >= mss;
                let next_seq = (tcp2.seq_number().0 as u32).wrapping_add(p.gro_len() as u32);
                flush |= next_seq != tcp.seq_number().0 as u32;

                if flush || gro_merge(rx, p, skb).is_err() {
                    mss = 1;
                } else {
                    // 聚合继承最后一个分段的 FIN/PSH
                    let th2_off = p.transport_header;
                    let word = tcp_flag_word(&th2) | (flags & (TCP_FLAG_FIN | TCP_FLAG_PSH));
                    p.data_mut()[th2_off + 12..th2_off + 16].copy_from_slice(&word.to_be_bytes());
                }
            }
            None => mss = 1,
        }
    }

    let mut flush = len < mss;
    flush |= flags & (TCP_FLAG_URG | TCP_FLAG_PSH | TCP_FLAG_RST | TCP_FLAG_SYN | TCP_FLAG_FIN) != 0;

    let pp = found.filter(|_| !skb.gro.same_flow || flush);
    skb.gro.flush |= flush;
    pp
}

/// 读取 `off` 处完整的 TCP 首部（含选项）
fn tcp_header(skb: &SkBuff, off: usize) -> Option<Vec<u8>> {
    let base = skb.gro_header(off, TCP_HLEN)?;
    let thlen = TcpPacket::new_unchecked(base).header_len() as usize;
    if thlen < TCP_HLEN {
        return None;
    }
    skb.gro_header(off, thlen).map(<[u8]>::to_vec)
}

fn same_ports(p: &SkBuff, th: &[u8]) -> bool {
    p.data().get(p.transport_header..p.transport_header + 4) == Some(&th[..4])
}
