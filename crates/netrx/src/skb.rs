//! 报文缓冲区
//!
//! [`SkBuff`] 持有从网络层首部开始的报文数据，以及收包路径沿途使用的元数据：
//! 接收设备、流哈希、VLAN 标签、校验和状态、GSO 信息和 GRO 会话。
//! 链路层首部在进入本模块之前已经由驱动剥离，`protocol` 字段记录其中的以太类型。

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;
use smoltcp::wire::{IpProtocol, Ipv4Packet};

use crate::{
    NetRxError,
    checksum::{Wsum, csum_fold, csum_partial, write_sum16},
    config::SKB_MAX_CSUM_LEVEL,
    gro::GroSession,
    netdev::NetDevice,
};

/// IPv4 以太类型
pub const ETH_P_IP: u16 = 0x0800;
/// ARP 以太类型
pub const ETH_P_ARP: u16 = 0x0806;
/// IPv6 以太类型
pub const ETH_P_IPV6: u16 = 0x86dd;

/// 校验和状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpSummed {
    /// 设备未校验
    #[default]
    None,
    /// 设备已校验，`csum_level + 1` 层校验和无需再检查
    Unnecessary,
    /// 设备提供了覆盖整个报文的部分和 `csum`
    Complete,
    /// 校验和尚未计算，需要从 `csum_start` 开始求和并写入 `csum_start + csum_offset`
    Partial,
}

bitflags! {
    /// GSO 类型
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GsoType: u32 {
        /// IPv4 上的 TCP
        const TCPV4 = 1 << 0;
        /// 来源不可信，需要重新校验首部
        const DODGY = 1 << 1;
        /// 带 CWR 的 TCP
        const TCP_ECN = 1 << 2;
        /// IP ID 固定不递增
        const TCP_FIXEDID = 1 << 3;
        /// IPv6 上的 TCP
        const TCPV6 = 1 << 4;
    }
}

/// 报文缓冲区
#[derive(Debug, Clone, Default)]
pub struct SkBuff {
    data: Vec<u8>,
    dev: Option<Arc<NetDevice>>,
    /// 以太类型
    pub protocol: u16,
    /// 流哈希，0 表示未知
    pub hash: u32,
    /// 哈希覆盖了四元组
    pub l4_hash: bool,
    /// 哈希由软件计算
    pub sw_hash: bool,
    /// VLAN 标签
    pub vlan_tci: Option<u16>,
    /// 校验和状态
    pub ip_summed: IpSummed,
    /// `Complete` 时覆盖整个报文的部分和
    pub csum: Wsum,
    /// `Unnecessary` 时已校验的封装层数减一
    pub csum_level: u8,
    /// `Partial` 时校验和计算的起始偏移
    pub csum_start: usize,
    /// `Partial` 时校验和字段相对 `csum_start` 的偏移
    pub csum_offset: usize,
    /// 校验和已由软件完成
    pub csum_complete_sw: bool,
    /// 网络层首部偏移
    pub network_header: usize,
    /// 传输层首部偏移
    pub transport_header: usize,
    /// GSO 分段大小，非 0 表示这是聚合报文
    pub gso_size: u16,
    /// GSO 分段数
    pub gso_segs: u16,
    /// GSO 类型
    pub gso_type: GsoType,
    /// 报文经过了远端校验和卸载
    pub remcsum_offload: bool,
    /// 接收该报文的 NAPI 上下文 ID
    pub napi_id: u32,
    /// GRO 会话控制块
    pub gro: GroSession,
}

impl SkBuff {
    /// 由网络层首部开始的字节创建报文
    pub fn new(protocol: u16, data: Vec<u8>) -> Self {
        Self {
            data,
            protocol,
            ..Default::default()
        }
    }

    /// 设置接收设备
    pub fn with_dev(mut self, dev: Arc<NetDevice>) -> Self {
        self.dev = Some(dev);
        self
    }

    /// 接收设备
    pub fn dev(&self) -> Option<&Arc<NetDevice>> {
        self.dev.as_ref()
    }

    /// 修改接收设备
    pub fn set_dev(&mut self, dev: Option<Arc<NetDevice>>) {
        self.dev = dev;
    }

    /// 报文数据
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 可写的报文数据
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 取出报文数据
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// 报文长度
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 报文是否为空
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 是否为 GSO 聚合报文
    pub fn is_gso(&self) -> bool {
        self.gso_size != 0
    }

    /// 在尾部追加数据
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// 以软件完成 `Partial` 状态的校验和
    ///
    /// 从 `csum_start` 求和到报文末尾，折叠结果写入 `csum_start + csum_offset`。
    /// 结果为 0 时写入 0xffff（UDP 中 0 表示“无校验和”）。
    pub fn checksum_help(&mut self) -> Result<(), NetRxError> {
        if self.ip_summed != IpSummed::Partial {
            return Ok(());
        }
        let start = self.csum_start;
        let field = start + self.csum_offset;
        if start >= self.data.len() || field + 2 > self.data.len() {
            return Err(NetRxError::InvalidArgument);
        }
        let sum = match csum_fold(csum_partial(&self.data[start..], 0)) {
            0 => 0xffff,
            sum => sum,
        };
        write_sum16(&mut self.data, field, sum);
        self.ip_summed = IpSummed::None;
        Ok(())
    }

    /// 记录软件多校验了一层校验和
    pub fn incr_checksum_unnecessary(&mut self) {
        match self.ip_summed {
            IpSummed::Unnecessary => {
                if self.csum_level < SKB_MAX_CSUM_LEVEL {
                    self.csum_level += 1;
                }
            }
            IpSummed::None => {
                self.ip_summed = IpSummed::Unnecessary;
                self.csum_level = 0;
            }
            _ => {}
        }
    }

    /// 流哈希
    ///
    /// 设备没有提供哈希时由 IPv4 五元组计算，结果对两个方向相同。
    /// 无法解析的报文返回 0。
    pub fn get_hash(&mut self) -> u32 {
        if self.hash == 0 && !self.l4_hash {
            self.compute_flow_hash();
        }
        self.hash
    }

    fn compute_flow_hash(&mut self) {
        if self.protocol != ETH_P_IP {
            return;
        }
        let Ok(ip) = Ipv4Packet::new_checked(self.data.as_slice()) else {
            return;
        };
        let ihl = ip.header_len() as usize;
        let proto = ip.next_header();
        let saddr = read_be32(&self.data, 12);
        let daddr = read_be32(&self.data, 16);
        let ports = match proto {
            IpProtocol::Tcp | IpProtocol::Udp
                if ip.frag_offset() == 0 && !ip.more_frags() && self.data.len() >= ihl + 4 =>
            {
                Some(read_be32(&self.data, ihl))
            }
            _ => None,
        };
        let hash = flow_hash(saddr, daddr, ports.unwrap_or(0), u8::from(proto));
        self.hash = hash;
        self.l4_hash = ports.is_some();
        self.sw_hash = true;
    }
}

#[inline]
pub(crate) fn read_be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

const JHASH_INITVAL: u32 = 0xdead_beef;

fn jhash_3words(a: u32, b: u32, c: u32, initval: u32) -> u32 {
    let mut a = a.wrapping_add(JHASH_INITVAL);
    let mut b = b.wrapping_add(JHASH_INITVAL);
    let mut c = c.wrapping_add(initval);
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c.wrapping_sub(b.rotate_left(24))
}

/// 对称的五元组哈希，结果非 0
fn flow_hash(saddr: u32, daddr: u32, ports: u32, proto: u8) -> u32 {
    let (sport, dport) = ((ports >> 16) as u16, ports as u16);
    // 按地址排序，两个方向落到同一个流
    let (a, b, ports) = if (saddr, sport) <= (daddr, dport) {
        (saddr, daddr, ports)
    } else {
        (daddr, saddr, ((dport as u32) << 16) | sport as u32)
    };
    match jhash_3words(a, b, ports, proto as u32) {
        0 => 1,
        hash => hash,
    }
}
