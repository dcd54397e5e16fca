// Unit tests for netrx.
//
// 运行时操作回退到 `test_support::mock::net::MOCK_NET_RX_OPS`。jiffies 只有 `gro::test_flush_old`
// 会推进，其他测试不依赖具体时间。

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use sync::SpinLock;

use crate::{
    NapiContext, NetRx, NetRxConfig, SkBuff,
    checksum::{csum_partial, csum_tcpudp_magic, ip_fast_csum},
    skb::ETH_P_IP,
};

mod napi;
mod softnet;

pub(super) const SADDR: [u8; 4] = [10, 0, 0, 1];
pub(super) const DADDR: [u8; 4] = [10, 0, 0, 2];
pub(super) const SPORT: u16 = 1234;
pub(super) const DPORT: u16 = 80;

pub(super) const TCP_ACK: u8 = 0x10;
pub(super) const TCP_PSH: u8 = 0x08;

/// 单 CPU 的收包路径
pub(super) fn new_rx() -> NetRx {
    NetRx::with_cpus(1, NetRxConfig::new()).unwrap()
}

/// 按 Fn 约束推断闭包签名，使其满足 `NapiPoll`
pub(super) fn poll_fn<F>(f: F) -> F
where
    F: Fn(&mut NapiContext<'_>, usize) -> usize + Send + Sync + 'static,
{
    f
}

/// 注册一个收集报文的 IPv4 处理器
pub(super) fn collect_ipv4(rx: &NetRx) -> Arc<SpinLock<Vec<SkBuff>>> {
    let received = Arc::new(SpinLock::new(Vec::new()));
    let sink = received.clone();
    rx.dev_add_pack(ETH_P_IP, move |skb: SkBuff| sink.lock().push(skb))
        .unwrap();
    received
}

/// 注册一个只计数的 IPv4 处理器
pub(super) fn count_ipv4(rx: &NetRx) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    rx.dev_add_pack(ETH_P_IP, move |_skb: SkBuff| {
        counter.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    count
}

/// 构造一个 IPv4/TCP 分段，首部校验和与 TCP 校验和均正确，DF 置位
pub(super) fn tcp_segment(id: u16, seq: u32, flags: u8, payload: &[u8]) -> SkBuff {
    let tcp_len = 20 + payload.len();
    let tot_len = 20 + tcp_len;

    let mut data = Vec::with_capacity(tot_len);
    data.extend_from_slice(&[0x45, 0x00]);
    data.extend_from_slice(&(tot_len as u16).to_be_bytes());
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&[0x40, 0x00, 64, 6, 0, 0]);
    data.extend_from_slice(&SADDR);
    data.extend_from_slice(&DADDR);
    let check = ip_fast_csum(&data, 5);
    data[10..12].copy_from_slice(&check.to_be_bytes());

    data.extend_from_slice(&SPORT.to_be_bytes());
    data.extend_from_slice(&DPORT.to_be_bytes());
    data.extend_from_slice(&seq.to_be_bytes());
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
    data.extend_from_slice(payload);
    let check = csum_tcpudp_magic(
        u32::from_be_bytes(SADDR),
        u32::from_be_bytes(DADDR),
        tcp_len as u32,
        6,
        csum_partial(&data[20..], 0),
    );
    data[36..38].copy_from_slice(&check.to_be_bytes());

    let mut skb = SkBuff::new(ETH_P_IP, data);
    skb.hash = 0x2a;
    skb
}

/// TCP 校验和（含伪首部）是否正确
pub(super) fn tcp_checksum_ok(skb: &SkBuff) -> bool {
    let data = skb.data();
    csum_tcpudp_magic(
        u32::from_be_bytes(SADDR),
        u32::from_be_bytes(DADDR),
        (data.len() - 20) as u32,
        6,
        csum_partial(&data[20..], 0),
    ) == 0
}
