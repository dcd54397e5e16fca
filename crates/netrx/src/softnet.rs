//! 每 CPU 接收队列（softnet data）
//!
//! 中断上下文通过 [`SoftnetData::enqueue`] 把报文放入输入队列，只持有一个很短的
//! 关中断自旋锁。软中断上下文由所属 CPU 的 backlog NAPI 把输入队列整体搬到处理队列，
//! 再逐个递交，因此处理期间中断上下文仍可继续入队。
//!
//! 跨 CPU 入队不直接操作目标 CPU 的轮询列表：置位目标的 `kick` 标志并请求软中断，
//! 目标 CPU 在 `net_rx_action` 开始时自行把 backlog 放入轮询列表。

use alloc::{boxed::Box, collections::VecDeque, sync::Arc};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use sync::SpinLock;

use crate::{
    NetRx,
    flow_limit::FlowLimit,
    napi::{Napi, NapiContext, NapiPoll},
    ops::net_rx_ops,
    skb::SkBuff,
};

struct InputQueue {
    queue: VecDeque<SkBuff>,
    flow_limit: Option<FlowLimit>,
}

impl InputQueue {
    /// 队列过半后按流量限制表判断
    fn flow_limited(&mut self, skb: &mut SkBuff, qlen: usize, max_backlog: usize) -> bool {
        if qlen < (max_backlog >> 1) {
            return false;
        }
        match self.flow_limit.as_mut() {
            Some(fl) => fl.should_drop(skb.get_hash()),
            None => false,
        }
    }
}

/// 每 CPU 的接收状态
pub struct SoftnetData {
    cpu: usize,
    input: SpinLock<InputQueue>,
    process_queue: SpinLock<VecDeque<SkBuff>>,
    poll_list: SpinLock<VecDeque<Arc<Napi>>>,
    backlog: Arc<Napi>,
    kick: AtomicBool,
    input_queue_head: AtomicU32,
    input_queue_tail: AtomicU32,
    processed: AtomicU32,
    dropped: AtomicU32,
    time_squeeze: AtomicU32,
    received_rps: AtomicU32,
    polls: AtomicU32,
}

/// backlog NAPI 的轮询函数
struct BacklogPoll {
    cpu: usize,
}

impl NapiPoll for BacklogPoll {
    fn poll(&self, ctx: &mut NapiContext<'_>, budget: usize) -> usize {
        let rx = ctx.rx();
        match rx.softnet(self.cpu) {
            Ok(sd) => sd.process_backlog(rx, budget),
            Err(_) => 0,
        }
    }
}

impl SoftnetData {
    pub(crate) fn new(cpu: usize, dev_weight: usize) -> Self {
        Self {
            cpu,
            input: SpinLock::new(InputQueue {
                queue: VecDeque::new(),
                flow_limit: None,
            }),
            process_queue: SpinLock::new(VecDeque::new()),
            poll_list: SpinLock::new(VecDeque::new()),
            backlog: Arc::new(Napi::new_backlog(Box::new(BacklogPoll { cpu }), dev_weight)),
            kick: AtomicBool::new(false),
            input_queue_head: AtomicU32::new(0),
            input_queue_tail: AtomicU32::new(0),
            processed: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            time_squeeze: AtomicU32::new(0),
            received_rps: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        }
    }

    /// 所属 CPU
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// backlog NAPI 上下文
    pub fn backlog(&self) -> &Arc<Napi> {
        &self.backlog
    }

    /// 把报文放入输入队列
    ///
    /// 队列长度小于 `max_backlog`、设备在运行且流量限制不反对时接受；否则丢弃报文，
    /// 增加本队列和设备的丢弃计数。输入队列由空变为非空时调度 backlog：
    /// `local_cpu` 就是本 CPU 时直接放入轮询列表，否则通过 kick 交给本 CPU。
    pub fn enqueue(&self, mut skb: SkBuff, max_backlog: usize, local_cpu: usize) -> bool {
        let running = skb.dev().is_none_or(|dev| dev.is_running());
        let mut input = self.input.lock();
        let qlen = input.queue.len();
        if running && qlen < max_backlog && !input.flow_limited(&mut skb, qlen, max_backlog) {
            input.queue.push_back(skb);
            self.input_queue_tail.fetch_add(1, Ordering::Relaxed);
            if qlen == 0 && self.backlog.schedule_prep() {
                self.backlog.set_poll_cpu(self.cpu);
                if local_cpu == self.cpu {
                    self.list_napi(self.backlog.clone());
                } else {
                    self.kick.store(true, Ordering::Release);
                    self.received_rps.fetch_add(1, Ordering::Relaxed);
                    net_rx_ops().raise_softirq(self.cpu);
                }
            }
            return true;
        }
        drop(input);

        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(dev) = skb.dev() {
            dev.stats().inc_rx_dropped();
        }
        log::trace!("netrx: cpu {} backlog drop (qlen {}, running {})", self.cpu, qlen, running);
        false
    }

    /// 把上下文追加到轮询列表并请求软中断
    pub(crate) fn list_napi(&self, napi: Arc<Napi>) {
        self.poll_list.lock().push_back(napi);
        net_rx_ops().raise_softirq(self.cpu);
    }

    /// 从轮询列表移除
    pub(crate) fn unlist_napi(&self, napi: &Arc<Napi>) {
        self.poll_list.lock().retain(|n| !Arc::ptr_eq(n, napi));
    }

    /// 取走整个轮询列表
    pub(crate) fn take_poll_list(&self) -> VecDeque<Arc<Napi>> {
        core::mem::take(&mut *self.poll_list.lock())
    }

    /// 把 `list` 放回轮询列表头部，返回列表是否非空
    pub(crate) fn restore_poll_list(&self, mut list: VecDeque<Arc<Napi>>) -> bool {
        let mut poll_list = self.poll_list.lock();
        list.append(&mut poll_list);
        *poll_list = list;
        !poll_list.is_empty()
    }

    /// 轮询列表长度
    pub fn poll_list_len(&self) -> usize {
        self.poll_list.lock().len()
    }

    /// 消费跨 CPU 的 kick，把 backlog 放入轮询列表
    pub(crate) fn consume_kick(&self) {
        if self.kick.swap(false, Ordering::AcqRel) {
            self.poll_list.lock().push_back(self.backlog.clone());
        }
    }

    /// 输入队列长度
    pub fn input_len(&self) -> usize {
        self.input.lock().queue.len()
    }

    /// 输入队列和处理队列的总长度
    pub fn backlog_len(&self) -> usize {
        self.input_len() + self.process_queue.lock().len()
    }

    /// 已入队但尚未出队的报文数（`tail - head`）
    pub fn queue_depth(&self) -> u32 {
        self.input_queue_tail
            .load(Ordering::Relaxed)
            .wrapping_sub(self.input_queue_head.load(Ordering::Relaxed))
    }

    /// 打开或关闭本 CPU 的流量限制
    pub(crate) fn set_flow_limit(&self, table_len: Option<usize>) {
        let mut input = self.input.lock();
        match table_len {
            Some(len) => {
                if input.flow_limit.is_none() {
                    input.flow_limit = Some(FlowLimit::new(len));
                }
            }
            None => input.flow_limit = None,
        }
    }

    fn pop_process(&self) -> Option<SkBuff> {
        let skb = self.process_queue.lock().pop_front()?;
        self.input_queue_head.fetch_add(1, Ordering::Relaxed);
        Some(skb)
    }

    /// 把输入队列整体移到处理队列，返回是否移动了报文
    fn refill(&self, input: &mut InputQueue) -> bool {
        if input.queue.is_empty() {
            return false;
        }
        self.process_queue.lock().append(&mut input.queue);
        true
    }

    /// 逐个取出待处理报文
    ///
    /// 只能由所属 CPU 调用。处理队列为空时从输入队列补充，两者都为空时结束；
    /// 之后有新报文入队时可以再次调用。
    pub fn drain(&self) -> BacklogDrain<'_> {
        BacklogDrain { sd: self }
    }

    /// backlog 的轮询函数
    ///
    /// 最多递交 `quota` 个报文。输入队列为空时在输入队列锁内把 backlog 置回 Idle，
    /// 与入队时的调度判断互斥。
    pub(crate) fn process_backlog(&self, rx: &NetRx, quota: usize) -> usize {
        let mut work = 0;
        loop {
            while let Some(skb) = self.pop_process() {
                rx.netif_receive_skb(self.cpu, skb);
                work += 1;
                if work >= quota {
                    return work;
                }
            }
            let mut input = self.input.lock();
            if !self.refill(&mut input) {
                self.backlog.mark_idle();
                return work;
            }
        }
    }

    pub(crate) fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_time_squeeze(&self) {
        self.time_squeeze.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_polls(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// 统计快照
    pub fn stat(&self) -> SoftnetStat {
        let (input_len, flow_limit_count) = {
            let input = self.input.lock();
            (input.queue.len(), input.flow_limit.as_ref().map_or(0, FlowLimit::count))
        };
        SoftnetStat {
            cpu: self.cpu,
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            time_squeeze: self.time_squeeze.load(Ordering::Relaxed),
            received_rps: self.received_rps.load(Ordering::Relaxed),
            flow_limit_count,
            polls: self.polls.load(Ordering::Relaxed),
            backlog_len: input_len + self.process_queue.lock().len(),
            input_queue_head: self.input_queue_head.load(Ordering::Relaxed),
            input_queue_tail: self.input_queue_tail.load(Ordering::Relaxed),
        }
    }
}

/// [`SoftnetData::drain`] 返回的迭代器
pub struct BacklogDrain<'a> {
    sd: &'a SoftnetData,
}

impl Iterator for BacklogDrain<'_> {
    type Item = SkBuff;

    fn next(&mut self) -> Option<SkBuff> {
        loop {
            if let Some(skb) = self.sd.pop_process() {
                return Some(skb);
            }
            let mut input = self.sd.input.lock();
            if !self.sd.refill(&mut input) {
                return None;
            }
        }
    }
}

/// 每 CPU 统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftnetStat {
    /// CPU 编号
    pub cpu: usize,
    /// 递交给协议层的报文数
    pub processed: u32,
    /// 入队时丢弃的报文数
    pub dropped: u32,
    /// 因预算或时间用尽提前结束软中断的次数
    pub time_squeeze: u32,
    /// 收到的跨 CPU 调度次数
    pub received_rps: u32,
    /// 流量限制丢弃数
    pub flow_limit_count: u64,
    /// NAPI 轮询次数
    pub polls: u32,
    /// 输入队列与处理队列的总长度
    pub backlog_len: usize,
    /// 已出队计数
    pub input_queue_head: u32,
    /// 已入队计数
    pub input_queue_tail: u32,
}

impl fmt::Display for SoftnetStat {
    /// `/proc/net/softnet_stat` 的一行
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x}",
            self.processed,
            self.dropped,
            self.time_squeeze,
            0,
            0,
            0,
            0,
            0,
            0,
            self.received_rps,
            self.flow_limit_count as u32,
            self.backlog_len as u32,
            self.cpu as u32,
        )
    }
}
