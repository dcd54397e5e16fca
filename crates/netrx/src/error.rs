//! 收包路径错误类型
//!
//! 只用于 API 误用（参数、注册、状态）。数据面上的降级（队列满、校验和错误、
//! 递归过深）不产生错误，而是体现在计数器和返回值里。

/// 收包路径错误类型
///
/// 各错误码对应标准 POSIX errno 值，可通过 [`NetRxError::to_errno()`] 转换。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetRxError {
    /// 无效参数，例如权重或配置值为 0 (-EINVAL)
    InvalidArgument,
    /// CPU 编号超出范围 (-ENODEV)
    InvalidCpu,
    /// 对未禁用的 NAPI 上下文调用 enable (-EBUSY)
    NotDisabled,
    /// 重复注册协议处理器、卸载或设备 (-EEXIST)
    AlreadyRegistered,
    /// 没有对应的协议处理器或卸载 (-EPROTONOSUPPORT)
    NoProtocol,
    /// 聚合超出长度或分段上限 (-E2BIG)
    TooBig,
    /// 报文长度不足以读取首部 (-EFAULT)
    Truncated,
}

impl NetRxError {
    /// 转换为系统调用错误码（负数）
    pub fn to_errno(&self) -> isize {
        match self {
            NetRxError::TooBig => -7,
            NetRxError::Truncated => -14,
            NetRxError::NotDisabled => -16,
            NetRxError::AlreadyRegistered => -17,
            NetRxError::InvalidCpu => -19,
            NetRxError::InvalidArgument => -22,
            NetRxError::NoProtocol => -93,
        }
    }
}
