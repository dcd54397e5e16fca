//! IPv4 GRO 卸载

use smoltcp::wire::Ipv4Packet;

use crate::{
    NetRx, NetRxError,
    checksum::{csum_replace2, ip_fast_csum},
    gro::{GroList, call_gro_receive},
    protocol::GroOffload,
    skb::SkBuff,
};

const IPV4_HLEN: usize = 20;
/// 首部第一个字节：版本 4，首部长度 5 个字
const IPV4_VERSION_IHL: u8 = 0x45;
const IP_DF: u16 = 0x4000;

/// IPv4 GRO 卸载
#[derive(Debug, Default)]
pub struct Ipv4GroOffload;

/// 首部中 ID 和分片字段组成的 32 位字
fn id_frag_word(iph: &[u8]) -> u32 {
    u32::from_be_bytes([iph[4], iph[5], iph[6], iph[7]])
}

impl GroOffload for Ipv4GroOffload {
    fn gro_receive(&self, rx: &NetRx, head: &mut GroList, skb: &mut SkBuff) -> Option<usize> {
        let off = skb.gro_offset();
        let mut flush = true;
        let pp = self.receive_inner(rx, head, skb, off, &mut flush);
        skb.gro_flush_final(flush);
        pp
    }

    fn gro_complete(&self, rx: &NetRx, skb: &mut SkBuff, nhoff: usize) -> Result<(), NetRxError> {
        if skb.len() < nhoff + IPV4_HLEN {
            return Err(NetRxError::Truncated);
        }
        let new_len = u16::try_from(skb.len() - nhoff).map_err(|_| NetRxError::TooBig)?;
        let proto = {
            let mut iph = Ipv4Packet::new_unchecked(&mut skb.data_mut()[nhoff..nhoff + IPV4_HLEN]);
            let mut check = iph.checksum();
            csum_replace2(&mut check, iph.total_len(), new_len);
            iph.set_total_len(new_len);
            iph.set_checksum(check);
            u8::from(iph.next_header())
        };

        let Some(ops) = rx.protocols().inet_offload(proto) else {
            log::warn!("netrx: ipv4 gro complete without inet offload for proto {}", proto);
            return Err(NetRxError::NoProtocol);
        };
        ops.gro_complete(rx, skb, nhoff + IPV4_HLEN)
    }
}

impl Ipv4GroOffload {
    fn receive_inner(
        &self,
        rx: &NetRx,
        head: &mut GroList,
        skb: &mut SkBuff,
        off: usize,
        flush: &mut bool,
    ) -> Option<usize> {
        let iph: [u8; IPV4_HLEN] = skb.gro_header(off, IPV4_HLEN)?.try_into().ok()?;
        let ip = Ipv4Packet::new_unchecked(&iph[..]);
        let proto = u8::from(ip.next_header());

        let ops = rx.protocols().inet_offload(proto)?;
        if iph[0] != IPV4_VERSION_IHL {
            return None;
        }
        if ip.more_frags() || ip.frag_offset() != 0 {
            return None;
        }
        if ip_fast_csum(&iph, 5) != 0 {
            return None;
        }

        let id_frag = id_frag_word(&iph);
        // 总长度与实际长度不符（有填充）或除 DF 外的分片位被置位
        *flush = (ip.total_len() as usize != skb.gro_len()) || (id_frag as u16 & !IP_DF) != 0;
        let id = (id_frag >> 16) as u16;
        let df = ip.dont_frag();

        for p in head.iter_mut() {
            if !p.gro.same_flow {
                continue;
            }
            let Some(iph2) = p
                .data()
                .get(off..off + IPV4_HLEN)
                .and_then(|h| <[u8; IPV4_HLEN]>::try_from(h).ok())
            else {
                p.gro.same_flow = false;
                continue;
            };
            let ip2 = Ipv4Packet::new_unchecked(&iph2[..]);
            if iph[9] != iph2[9] || iph[12..20] != iph2[12..20] {
                p.gro.same_flow = false;
                continue;
            }

            // 除长度和校验和外的字段都必须相同
            p.gro.flush |= ip.hop_limit() != ip2.hop_limit()
                || iph[1] != iph2[1]
                || ip.dont_frag() != ip2.dont_frag();
            p.gro.flush |= *flush;

            // IP ID 检查先记下来，等传输层确认同流后再使用
            let mut flush_id = id.wrapping_sub(ip2.ident());
            if !p.gro.is_atomic || !df {
                flush_id ^= p.gro.count;
                flush_id = if flush_id != 0 { 0xffff } else { 0 };
            }
            if skb.gro.is_atomic {
                p.gro.flush_id = flush_id;
            } else {
                p.gro.flush_id |= flush_id;
            }
        }

        skb.gro.is_atomic = df;
        skb.gro.flush |= *flush;
        skb.network_header = off;
        skb.gro_postpull_rcsum(off, IPV4_HLEN);
        skb.gro_pull(IPV4_HLEN);
        skb.transport_header = skb.gro_offset();

        call_gro_receive(rx, ops.as_ref(), head, skb)
    }
}
