//! 内置 GRO 卸载
//!
//! - [`Ipv4GroOffload`]：以太类型 0x0800，按协议号分发给传输层卸载
//! - [`TcpGroOffload`]：IP 协议号 6

mod ipv4;
mod tcp;

pub use ipv4::Ipv4GroOffload;
pub use tcp::{TcpGroOffload, tcp_gro_receive};

use crate::{
    checksum::{Wsum, csum_tcpudp_nofold},
    skb::{SkBuff, read_be32},
};

/// 以网络层首部中的地址和 GRO 剩余长度计算 IPv4 伪首部部分和
pub fn inet_gro_compute_pseudo(skb: &SkBuff, proto: u8) -> Wsum {
    let iph = skb.gro_network_header();
    csum_tcpudp_nofold(read_be32(iph, 12), read_be32(iph, 16), skb.gro_len() as u32, proto, 0)
}
