//! 协议处理器与 GRO 卸载注册表
//!
//! - 协议处理器按以太类型注册，接收普通路径递交的报文
//! - GRO 卸载按以太类型注册，网络层卸载再按 IP 协议号查找传输层卸载
//!
//! 查找时克隆出 `Arc` 后立即释放锁，回调在锁外执行。

use alloc::{collections::BTreeMap, sync::Arc};

use sync::SpinLock;

use crate::{NetRx, NetRxError, gro::GroList, skb::SkBuff};

/// 协议处理器
pub trait PacketHandler: Send + Sync {
    /// 接收一个报文
    fn receive(&self, skb: SkBuff);
}

impl<F> PacketHandler for F
where
    F: Fn(SkBuff) + Send + Sync,
{
    fn receive(&self, skb: SkBuff) {
        self(skb)
    }
}

/// GRO 协议卸载
pub trait GroOffload: Send + Sync {
    /// 尝试把 `skb` 合并进 `head` 中持有的聚合
    ///
    /// 返回需要立即完成并递交的聚合在 `head` 中的下标。
    /// `skb` 被合并时在其会话上置 `same_flow`；不能再被合并时置 `flush`。
    fn gro_receive(&self, rx: &NetRx, head: &mut GroList, skb: &mut SkBuff) -> Option<usize>;

    /// 聚合即将递交时修正首部，`nhoff` 为本层首部偏移
    fn gro_complete(&self, rx: &NetRx, skb: &mut SkBuff, nhoff: usize) -> Result<(), NetRxError>;
}

/// 注册表
#[derive(Default)]
pub struct ProtocolTable {
    handlers: SpinLock<BTreeMap<u16, Arc<dyn PacketHandler>>>,
    offloads: SpinLock<BTreeMap<u16, Arc<dyn GroOffload>>>,
    inet_offloads: SpinLock<BTreeMap<u8, Arc<dyn GroOffload>>>,
}

impl ProtocolTable {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册以太类型 `ethertype` 的协议处理器
    pub fn add_pack(&self, ethertype: u16, handler: Arc<dyn PacketHandler>) -> Result<(), NetRxError> {
        insert_unique(&self.handlers, ethertype, handler)?;
        log::debug!("netrx: add packet handler {:#06x}", ethertype);
        Ok(())
    }

    /// 注销协议处理器
    pub fn remove_pack(&self, ethertype: u16) -> Result<(), NetRxError> {
        self.handlers.lock().remove(&ethertype).map(|_| ()).ok_or(NetRxError::NoProtocol)
    }

    /// 查找协议处理器
    pub fn handler(&self, ethertype: u16) -> Option<Arc<dyn PacketHandler>> {
        self.handlers.lock().get(&ethertype).cloned()
    }

    /// 注册网络层 GRO 卸载
    pub fn add_offload(&self, ethertype: u16, offload: Arc<dyn GroOffload>) -> Result<(), NetRxError> {
        insert_unique(&self.offloads, ethertype, offload)?;
        log::debug!("netrx: add gro offload {:#06x}", ethertype);
        Ok(())
    }

    /// 注销网络层 GRO 卸载
    pub fn remove_offload(&self, ethertype: u16) -> Result<(), NetRxError> {
        self.offloads.lock().remove(&ethertype).map(|_| ()).ok_or(NetRxError::NoProtocol)
    }

    /// 查找网络层 GRO 卸载
    pub fn offload(&self, ethertype: u16) -> Option<Arc<dyn GroOffload>> {
        self.offloads.lock().get(&ethertype).cloned()
    }

    /// 注册传输层 GRO 卸载
    pub fn add_inet_offload(&self, proto: u8, offload: Arc<dyn GroOffload>) -> Result<(), NetRxError> {
        insert_unique(&self.inet_offloads, proto, offload)?;
        log::debug!("netrx: add inet gro offload {}", proto);
        Ok(())
    }

    /// 注销传输层 GRO 卸载
    pub fn remove_inet_offload(&self, proto: u8) -> Result<(), NetRxError> {
        self.inet_offloads.lock().remove(&proto).map(|_| ()).ok_or(NetRxError::NoProtocol)
    }

    /// 查找传输层 GRO 卸载
    pub fn inet_offload(&self, proto: u8) -> Option<Arc<dyn GroOffload>> {
        self.inet_offloads.lock().get(&proto).cloned()
    }
}

fn insert_unique<K: Ord, V: ?Sized>(
    table: &SpinLock<BTreeMap<K, Arc<V>>>,
    key: K,
    value: Arc<V>,
) -> Result<(), NetRxError> {
    let mut table = table.lock();
    if table.contains_key(&key) {
        return Err(NetRxError::AlreadyRegistered);
    }
    table.insert(key, value);
    Ok(())
}
