//! NAPI 上下文
//!
//! 每个 NAPI 上下文是一个轮询对象，其状态机决定轮询函数是否已被调度、正在运行或已禁用：
//!
//! ```text
//!            schedule_prep               napi_poll
//!   Idle ─────────────────▶ Scheduled ─────────────▶ Polling
//!    ▲                          ▲                       │
//!    │       complete_done      │ missed / 预算用尽     │
//!    └──────────────────────────┴───────────────────────┘
//!
//!   Idle ── disable ──▶ (Disabling) ──▶ Disabled ── enable ──▶ Idle
//! ```
//!
//! 状态保存在一个 `AtomicU32` 中：低两位为阶段，其余位为 [`NapiFlags`]。
//! 所有转换都通过 CAS 完成，因此同一个上下文任何时刻最多只有一个轮询者。

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use lazy_static::lazy_static;
use sync::SpinLock;

use crate::{
    NetRx, NetRxError,
    config::{MIN_NAPI_ID, NAPI_POLL_WEIGHT},
    gro::{GroEngine, GroResult},
    netdev::NetDevice,
    ops::net_rx_ops,
    skb::SkBuff,
};

const PHASE_MASK: u32 = 0b11;
const PHASE_IDLE: u32 = 0;
const PHASE_SCHEDULED: u32 = 1;
const PHASE_POLLING: u32 = 2;
const PHASE_DISABLED: u32 = 3;

bitflags! {
    /// NAPI 状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NapiFlags: u32 {
        /// 轮询期间又有新的调度请求
        const MISSED = 1 << 2;
        /// 禁用进行中
        const DISABLE = 1 << 3;
        /// 优先由忙轮询处理
        const PREFER_BUSY_POLL = 1 << 4;
        /// 不参与忙轮询（不进入 NAPI ID 表）
        const NO_BUSY_POLL = 1 << 5;
        /// 正在被忙轮询
        const IN_BUSY_POLL = 1 << 6;
        /// 已登记到 NAPI ID 表
        const LISTED = 1 << 7;
    }
}

/// NAPI 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NapiState {
    /// 空闲，可以被调度
    Idle,
    /// 已在某个 CPU 的轮询列表中
    Scheduled,
    /// 轮询函数正在运行
    Polling,
    /// 已请求禁用，等待在途的轮询结束
    Disabling,
    /// 已禁用
    Disabled,
}

/// 轮询函数
///
/// 最多处理 `budget` 个报文并返回实际处理数。处理数小于 `budget` 时驱动应调用
/// [`NapiContext::complete_done`]；否则不得修改 NAPI 状态，由核心重新调度。
pub trait NapiPoll: Send + Sync {
    /// 轮询一次
    fn poll(&self, ctx: &mut NapiContext<'_>, budget: usize) -> usize;
}

impl<F> NapiPoll for F
where
    F: Fn(&mut NapiContext<'_>, usize) -> usize + Send + Sync,
{
    fn poll(&self, ctx: &mut NapiContext<'_>, budget: usize) -> usize {
        self(ctx, budget)
    }
}

/// NAPI 上下文
pub struct Napi {
    state: AtomicU32,
    weight: AtomicUsize,
    id: AtomicU32,
    poll_cpu: AtomicUsize,
    dev: Weak<NetDevice>,
    poll: Box<dyn NapiPoll>,
    pub(crate) gro: SpinLock<GroEngine>,
}

impl Napi {
    fn new(dev: Weak<NetDevice>, poll: Box<dyn NapiPoll>, weight: usize, phase: u32, flags: NapiFlags) -> Self {
        Self {
            state: AtomicU32::new(phase | flags.bits()),
            weight: AtomicUsize::new(weight),
            id: AtomicU32::new(0),
            poll_cpu: AtomicUsize::new(0),
            dev,
            poll,
            gro: SpinLock::new(GroEngine::new()),
        }
    }

    /// 每个 CPU 的 backlog 上下文，创建即可调度
    pub(crate) fn new_backlog(poll: Box<dyn NapiPoll>, weight: usize) -> Self {
        Self::new(Weak::new(), poll, weight, PHASE_IDLE, NapiFlags::NO_BUSY_POLL)
    }

    /// 当前状态
    pub fn state(&self) -> NapiState {
        let val = self.state.load(Ordering::Acquire);
        match val & PHASE_MASK {
            PHASE_DISABLED => NapiState::Disabled,
            _ if val & NapiFlags::DISABLE.bits() != 0 => NapiState::Disabling,
            PHASE_SCHEDULED => NapiState::Scheduled,
            PHASE_POLLING => NapiState::Polling,
            _ => NapiState::Idle,
        }
    }

    /// 当前标志
    pub fn flags(&self) -> NapiFlags {
        NapiFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// 权重（每次轮询的预算）
    pub fn weight(&self) -> usize {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_weight(&self, weight: usize) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// NAPI ID，未登记时为 0
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// 所属设备
    pub fn dev(&self) -> Option<Arc<NetDevice>> {
        self.dev.upgrade()
    }

    /// 最近一次被调度到的 CPU
    pub fn poll_cpu(&self) -> usize {
        self.poll_cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_poll_cpu(&self, cpu: usize) {
        self.poll_cpu.store(cpu, Ordering::Relaxed);
    }

    /// 持有的 GRO 聚合数
    pub fn gro_held(&self) -> usize {
        self.gro.lock().held()
    }

    fn set_flags(&self, flags: NapiFlags) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_flags(&self, flags: NapiFlags) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// 是否有禁用请求
    pub fn disable_pending(&self) -> bool {
        self.flags().contains(NapiFlags::DISABLE)
    }

    /// 是否优先由忙轮询处理
    pub fn prefer_busy_poll(&self) -> bool {
        self.flags().contains(NapiFlags::PREFER_BUSY_POLL)
    }

    /// 设置忙轮询偏好
    pub fn set_prefer_busy_poll(&self, prefer: bool) {
        if prefer {
            self.set_flags(NapiFlags::PREFER_BUSY_POLL);
        } else {
            self.clear_flags(NapiFlags::PREFER_BUSY_POLL);
        }
    }

    /// 尝试 Idle → Scheduled
    ///
    /// 成功的调用者负责把上下文放入轮询列表。正在轮询时记录 MISSED，
    /// 使轮询结束后自动重新调度；已调度、正在禁用或已禁用时什么也不做。
    pub fn schedule_prep(&self) -> bool {
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            if val & NapiFlags::DISABLE.bits() != 0 {
                return false;
            }
            let new = match val & PHASE_MASK {
                PHASE_IDLE => (val & !PHASE_MASK) | PHASE_SCHEDULED,
                PHASE_POLLING => val | NapiFlags::MISSED.bits(),
                _ => return false,
            };
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return val & PHASE_MASK == PHASE_IDLE,
                Err(cur) => val = cur,
            }
        }
    }

    /// 正在轮询时记录 MISSED
    ///
    /// 返回上下文是否不可调度：已调度、正在轮询、正在禁用或已禁用。
    pub fn if_scheduled_mark_missed(&self) -> bool {
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            if val & NapiFlags::DISABLE.bits() != 0 {
                return true;
            }
            let new = match val & PHASE_MASK {
                PHASE_POLLING => val | NapiFlags::MISSED.bits(),
                PHASE_SCHEDULED | PHASE_DISABLED => return true,
                _ => return false,
            };
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(cur) => val = cur,
            }
        }
    }

    /// Scheduled → Polling，由轮询循环调用
    pub(crate) fn begin_poll(&self) -> bool {
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            if val & PHASE_MASK != PHASE_SCHEDULED {
                return false;
            }
            let new = (val & !PHASE_MASK) | PHASE_POLLING;
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(cur) => val = cur,
            }
        }
    }

    /// Idle → Polling 并置 IN_BUSY_POLL，由忙轮询调用
    pub(crate) fn begin_busy_poll(&self) -> bool {
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            if val & NapiFlags::DISABLE.bits() != 0 || val & PHASE_MASK != PHASE_IDLE {
                if val & NapiFlags::PREFER_BUSY_POLL.bits() != 0 {
                    self.set_flags(NapiFlags::MISSED);
                }
                return false;
            }
            let new = (val & !PHASE_MASK) | PHASE_POLLING | NapiFlags::IN_BUSY_POLL.bits();
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(cur) => val = cur,
            }
        }
    }

    pub(crate) fn end_busy_poll(&self) {
        self.clear_flags(NapiFlags::IN_BUSY_POLL);
    }

    /// Polling → Scheduled，预算用尽时由轮询循环调用
    pub(crate) fn rearm(&self) -> bool {
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            if val & PHASE_MASK != PHASE_POLLING {
                return false;
            }
            let new = ((val & !PHASE_MASK) | PHASE_SCHEDULED) & !NapiFlags::MISSED.bits();
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(cur) => val = cur,
            }
        }
    }

    /// 直接回到 Idle，backlog 在输入队列锁内确认队列为空后调用
    pub(crate) fn mark_idle(&self) {
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            let new = (val & !PHASE_MASK & !NapiFlags::MISSED.bits()) | PHASE_IDLE;
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(cur) => val = cur,
            }
        }
    }

    /// 是否处于轮询阶段
    pub(crate) fn is_polling(&self) -> bool {
        self.state.load(Ordering::Acquire) & PHASE_MASK == PHASE_POLLING
    }

    /// 本次处理完成
    ///
    /// 完成所有 GRO 聚合并递交，然后离开轮询状态。轮询期间收到过调度请求时
    /// 重新调度并返回 false，此时驱动不应重新打开中断；忙轮询期间同样返回 false。
    pub fn complete_done(self: &Arc<Self>, rx: &NetRx, work_done: usize) -> bool {
        if self.flags().contains(NapiFlags::IN_BUSY_POLL) {
            return false;
        }

        let cpu = self.poll_cpu();
        let pending = {
            let mut gro = self.gro.lock();
            if gro.bitmask() != 0 {
                gro.flush(rx, false);
            }
            gro.take_rx_list()
        };
        rx.deliver(cpu, pending);

        let mut val = self.state.load(Ordering::Acquire);
        loop {
            let phase = val & PHASE_MASK;
            if phase != PHASE_POLLING && phase != PHASE_SCHEDULED {
                log::warn!("netrx: napi {}: complete_done({}) without SCHED", self.id(), work_done);
                return false;
            }
            let missed = val & NapiFlags::MISSED.bits() != 0;
            let new = if missed {
                ((val & !PHASE_MASK) | PHASE_SCHEDULED) & !NapiFlags::MISSED.bits()
            } else {
                (val & !PHASE_MASK) | PHASE_IDLE
            };
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if missed {
                        if phase == PHASE_POLLING {
                            rx.list_napi(cpu, self.clone());
                        }
                        return false;
                    }
                    if phase == PHASE_SCHEDULED {
                        rx.unlist_napi(cpu, self);
                    }
                    return true;
                }
                Err(cur) => val = cur,
            }
        }
    }

    /// 等价于 `complete_done(rx, 0)`
    pub fn complete(self: &Arc<Self>, rx: &NetRx) -> bool {
        self.complete_done(rx, 0)
    }

    /// 禁止调度，并等待在途的轮询结束
    ///
    /// 若上下文已在轮询列表中，需要其所在 CPU 的轮询循环先处理完它。
    pub fn disable(&self) {
        if self.state.load(Ordering::Acquire) & PHASE_MASK == PHASE_DISABLED {
            return;
        }
        self.set_flags(NapiFlags::DISABLE);
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            match val & PHASE_MASK {
                PHASE_DISABLED => break,
                PHASE_IDLE => {
                    let new = (val & !PHASE_MASK) | PHASE_DISABLED;
                    match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => break,
                        Err(cur) => val = cur,
                    }
                }
                _ => {
                    net_rx_ops().cpu_relax();
                    val = self.state.load(Ordering::Acquire);
                }
            }
        }
        self.clear_flags(NapiFlags::DISABLE | NapiFlags::PREFER_BUSY_POLL | NapiFlags::MISSED);
    }

    /// Disabled → Idle
    pub fn enable(&self) -> Result<(), NetRxError> {
        let mut val = self.state.load(Ordering::Acquire);
        loop {
            if val & PHASE_MASK != PHASE_DISABLED {
                return Err(NetRxError::NotDisabled);
            }
            let new = (val & !PHASE_MASK & !(NapiFlags::DISABLE | NapiFlags::PREFER_BUSY_POLL).bits()) | PHASE_IDLE;
            match self.state.compare_exchange_weak(val, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(cur) => val = cur,
            }
        }
    }

    /// 等待在途的调度和轮询结束，不阻止之后的调度
    pub fn synchronize(&self) {
        while matches!(self.state(), NapiState::Scheduled | NapiState::Polling) {
            net_rx_ops().cpu_relax();
        }
    }

    pub(crate) fn run_poll(self: &Arc<Self>, rx: &NetRx, cpu: usize, budget: usize) -> usize {
        let mut ctx = NapiContext { rx, napi: self, cpu };
        self.poll.poll(&mut ctx, budget)
    }
}

impl fmt::Debug for Napi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Napi")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("weight", &self.weight())
            .finish()
    }
}

/// 轮询函数的执行环境
pub struct NapiContext<'a> {
    rx: &'a NetRx,
    napi: &'a Arc<Napi>,
    cpu: usize,
}

impl<'a> NapiContext<'a> {
    /// 收包路径
    pub fn rx(&self) -> &'a NetRx {
        self.rx
    }

    /// 正在轮询的上下文
    pub fn napi(&self) -> &'a Arc<Napi> {
        self.napi
    }

    /// 轮询所在 CPU
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// 把报文交给 GRO
    pub fn gro_receive(&mut self, mut skb: SkBuff) -> GroResult {
        skb.napi_id = self.napi.id();
        skb.gro.data_offset = 0;
        let (result, batch) = {
            let mut gro = self.napi.gro.lock();
            let result = gro.receive(self.rx, skb);
            (result, gro.take_batch(self.rx.config().gro_normal_batch()))
        };
        if let Some(batch) = batch {
            self.rx.deliver(self.cpu, batch);
        }
        result
    }

    /// 绕过 GRO 直接递交
    pub fn receive_skb(&mut self, mut skb: SkBuff) {
        skb.napi_id = self.napi.id();
        self.rx.netif_receive_skb(self.cpu, skb);
    }

    /// 见 [`Napi::complete_done`]
    pub fn complete_done(&mut self, work_done: usize) -> bool {
        self.napi.complete_done(self.rx, work_done)
    }

    /// 见 [`Napi::complete`]
    pub fn complete(&mut self) -> bool {
        self.napi.complete(self.rx)
    }
}

static NAPI_GEN_ID: AtomicU32 = AtomicU32::new(MIN_NAPI_ID);

lazy_static! {
    /// NAPI ID 表
    static ref NAPI_HASH: SpinLock<BTreeMap<u32, Arc<Napi>>> = SpinLock::new(BTreeMap::new());
}

fn napi_hash_add(napi: &Arc<Napi>) {
    if napi.flags().contains(NapiFlags::NO_BUSY_POLL) {
        return;
    }
    let mut hash = NAPI_HASH.lock();
    let mut id = NAPI_GEN_ID.fetch_add(1, Ordering::Relaxed);
    while id < MIN_NAPI_ID || hash.contains_key(&id) {
        id = NAPI_GEN_ID.fetch_add(1, Ordering::Relaxed);
    }
    napi.id.store(id, Ordering::Relaxed);
    napi.set_flags(NapiFlags::LISTED);
    hash.insert(id, napi.clone());
}

fn napi_hash_del(napi: &Arc<Napi>) {
    if !napi.flags().contains(NapiFlags::LISTED) {
        return;
    }
    NAPI_HASH.lock().remove(&napi.id());
    napi.clear_flags(NapiFlags::LISTED);
}

/// 按 ID 查找 NAPI 上下文
pub fn napi_by_id(id: u32) -> Option<Arc<Napi>> {
    NAPI_HASH.lock().get(&id).cloned()
}

/// 按 NAPI ID 查找设备
pub fn dev_get_by_napi_id(id: u32) -> Option<Arc<NetDevice>> {
    if id < MIN_NAPI_ID {
        return None;
    }
    napi_by_id(id).and_then(|napi| napi.dev())
}

fn napi_add(
    dev: &Arc<NetDevice>,
    poll: Box<dyn NapiPoll>,
    weight: usize,
    flags: NapiFlags,
) -> Result<Arc<Napi>, NetRxError> {
    if weight == 0 {
        return Err(NetRxError::InvalidArgument);
    }
    if weight > NAPI_POLL_WEIGHT {
        log::warn!(
            "netrx: {}: netif_napi_add() called with weight {}",
            dev.name(),
            weight
        );
    }
    let napi = Arc::new(Napi::new(Arc::downgrade(dev), poll, weight, PHASE_DISABLED, flags));
    napi_hash_add(&napi);
    dev.attach_napi(napi.clone());
    Ok(napi)
}

/// 为设备创建接收 NAPI 上下文
///
/// 新上下文处于 Disabled 状态，需要 [`Napi::enable`] 后才能调度。
pub fn netif_napi_add(
    dev: &Arc<NetDevice>,
    poll: impl NapiPoll + 'static,
    weight: usize,
) -> Result<Arc<Napi>, NetRxError> {
    napi_add(dev, Box::new(poll), weight, NapiFlags::empty())
}

/// 为设备创建发送完成 NAPI 上下文，不参与忙轮询
pub fn netif_tx_napi_add(
    dev: &Arc<NetDevice>,
    poll: impl NapiPoll + 'static,
    weight: usize,
) -> Result<Arc<Napi>, NetRxError> {
    napi_add(dev, Box::new(poll), weight, NapiFlags::NO_BUSY_POLL)
}

/// 删除 NAPI 上下文，丢弃其持有的 GRO 报文
pub fn netif_napi_del(napi: &Arc<Napi>) {
    napi_hash_del(napi);
    if let Some(dev) = napi.dev() {
        dev.detach_napi(napi);
    }
    let dropped = napi.gro.lock().discard();
    if dropped > 0 {
        log::debug!("netrx: napi {} deleted, {} gro packets dropped", napi.id(), dropped);
    }
}
