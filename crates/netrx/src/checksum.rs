//! 互联网校验和运算
//!
//! RFC 1071 反码算术。16 位字按网络字节序（大端）读取，校验和字段按大端写回，
//! 因此这里的数值与报文中的字节一一对应，与主机字节序无关。
//!
//! - [`Wsum`]：未折叠的 32 位累加和
//! - [`Sum16`]：折叠并取反后的 16 位校验和

/// 未折叠的 32 位部分和
pub type Wsum = u32;

/// 折叠后的 16 位校验和
pub type Sum16 = u16;

/// 带回卷进位的 32 位加法
#[inline]
pub const fn csum_add(csum: Wsum, addend: Wsum) -> Wsum {
    let (res, carry) = csum.overflowing_add(addend);
    res.wrapping_add(carry as u32)
}

/// 反码减法：`csum - addend`
#[inline]
pub const fn csum_sub(csum: Wsum, addend: Wsum) -> Wsum {
    csum_add(csum, !addend)
}

/// 折叠为 16 位并取反
#[inline]
pub const fn csum_fold(csum: Wsum) -> Sum16 {
    let sum = (csum & 0xffff) + (csum >> 16);
    let sum = (sum & 0xffff) + (sum >> 16);
    !(sum as u16)
}

/// 把报文中的校验和字段当作部分和使用
#[inline]
pub const fn csum_unfold(n: Sum16) -> Wsum {
    n as Wsum
}

/// 合并从 `offset` 处开始的数据块的部分和
///
/// 奇数偏移意味着块内的字节落在了相反的半字上，需要旋转 8 位。
#[inline]
pub const fn csum_block_add(csum: Wsum, csum2: Wsum, offset: usize) -> Wsum {
    let csum2 = if offset & 1 != 0 { csum2.rotate_right(8) } else { csum2 };
    csum_add(csum, csum2)
}

/// 从 `csum` 中减去从 `offset` 处开始的数据块的部分和
#[inline]
pub const fn csum_block_sub(csum: Wsum, csum2: Wsum, offset: usize) -> Wsum {
    csum_block_add(csum, !csum2, offset)
}

/// 计算 `buf` 的部分和并累加到 `sum`
///
/// 长度为奇数时，最后一个字节作为高字节补零。
pub fn csum_partial(buf: &[u8], sum: Wsum) -> Wsum {
    let mut acc: u64 = sum as u64;
    let mut chunks = buf.chunks_exact(2);
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u64) << 8;
    }
    fold64(acc)
}

/// 64 位累加值折回 32 位（保留进位）
#[inline]
const fn fold64(acc: u64) -> Wsum {
    let acc = (acc & 0xffff_ffff) + (acc >> 32);
    let acc = (acc & 0xffff_ffff) + (acc >> 32);
    acc as Wsum
}

#[inline]
const fn csum16_add(csum: u16, addend: u16) -> u16 {
    let (res, carry) = csum.overflowing_add(addend);
    res.wrapping_add(carry as u16)
}

#[inline]
const fn csum16_sub(csum: u16, addend: u16) -> u16 {
    csum16_add(csum, !addend)
}

/// 16 位字段由 `old` 改为 `new` 时增量更新校验和（RFC 1624）
#[inline]
pub fn csum_replace2(sum: &mut Sum16, old: u16, new: u16) {
    *sum = !csum16_add(csum16_sub(!*sum, old), new);
}

/// 32 位字段由 `from` 改为 `to` 时增量更新校验和
#[inline]
pub fn csum_replace4(sum: &mut Sum16, from: u32, to: u32) {
    let tmp = csum_sub(!csum_unfold(*sum), from);
    *sum = csum_fold(csum_add(tmp, to));
}

/// 按已知的部分和差值 `diff` 更新校验和
#[inline]
pub fn csum_replace_by_diff(sum: &mut Sum16, diff: Wsum) {
    *sum = csum_fold(csum_add(diff, !csum_unfold(*sum)));
}

/// TCP/UDP 伪首部部分和
///
/// `saddr`/`daddr` 为按大端读出的 IPv4 地址，`len` 为传输层长度。
#[inline]
pub const fn csum_tcpudp_nofold(saddr: u32, daddr: u32, len: u32, proto: u8, sum: Wsum) -> Wsum {
    let acc = sum as u64 + saddr as u64 + daddr as u64 + proto as u64 + len as u64;
    fold64(acc)
}

/// 带伪首部的完整校验和，结果为 0 表示校验通过
#[inline]
pub const fn csum_tcpudp_magic(saddr: u32, daddr: u32, len: u32, proto: u8, sum: Wsum) -> Sum16 {
    csum_fold(csum_tcpudp_nofold(saddr, daddr, len, proto, sum))
}

/// 读取 `buf[offset..offset + 2]` 处的大端校验和字段
#[inline]
pub(crate) fn read_sum16(buf: &[u8], offset: usize) -> Sum16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// 按大端写入校验和字段
#[inline]
pub(crate) fn write_sum16(buf: &mut [u8], offset: usize, sum: Sum16) {
    buf[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}

/// 远端校验和卸载：根据 `csum` 推导 `[start..]` 范围的校验和，写入 `buf[offset..]`
///
/// `csum` 覆盖整个 `buf`，返回写入前后字段的部分和差值。
pub fn remcsum_adjust(buf: &mut [u8], csum: Wsum, start: usize, offset: usize) -> Wsum {
    let csum = csum_sub(csum, csum_partial(&buf[..start], 0));
    let new = csum_fold(csum);
    let delta = csum_sub(csum_unfold(new), csum_unfold(read_sum16(buf, offset)));
    write_sum16(buf, offset, new);
    delta
}

/// 撤销 [`remcsum_adjust`] 对校验和字段的修改
#[inline]
pub fn remcsum_unadjust(psum: &mut Sum16, delta: Wsum) {
    *psum = csum_fold(csum_sub(delta, csum_unfold(*psum)));
}

/// IPv4 首部校验和（首部长度以 32 位字计）
#[inline]
pub fn ip_fast_csum(header: &[u8], ihl: usize) -> Sum16 {
    csum_fold(csum_partial(&header[..ihl * 4], 0))
}
