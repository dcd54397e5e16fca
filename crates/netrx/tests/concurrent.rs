//! Integration tests for the receive path under real threads.
//!
//! 每个测试线程扮演一个 CPU：中断上下文调用 `netif_rx`/`napi_schedule`，
//! 软中断上下文循环调用 `net_rx_action`。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use netrx::{
    ETH_P_IP, NapiContext, NapiState, NetDevice, NetDeviceFeatures, NetRx, NetRxConfig, NetRxOps,
    SkBuff, netif_napi_add, register_net_rx_ops,
};
use sync::{ArchOps, register_arch_ops};

struct HostArch;

impl ArchOps for HostArch {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        0
    }

    unsafe fn restore_interrupts(&self, _flags: usize) {}

    fn cpu_id(&self) -> usize {
        0
    }

    fn max_cpu_count(&self) -> usize {
        2
    }

    fn cpu_relax(&self) {
        thread::yield_now();
    }
}

struct HostNetRx {
    softirqs: AtomicU64,
}

impl NetRxOps for HostNetRx {
    fn jiffies(&self) -> u64 {
        0
    }

    fn raise_softirq(&self, _cpu: usize) {
        self.softirqs.fetch_add(1, Ordering::Relaxed);
    }
}

static HOST_ARCH: HostArch = HostArch;
static HOST_NET_RX: HostNetRx = HostNetRx {
    softirqs: AtomicU64::new(0),
};

static INIT: Once = Once::new();

fn init_once() {
    INIT.call_once(|| unsafe {
        register_arch_ops(&HOST_ARCH);
        register_net_rx_ops(&HOST_NET_RX);
    });
}

fn poll_fn<F>(f: F) -> F
where
    F: Fn(&mut NapiContext<'_>, usize) -> usize + Send + Sync + 'static,
{
    f
}

fn packet(id: u16) -> SkBuff {
    let mut data = vec![0u8; 40];
    data[0] = 0x45;
    data[2..4].copy_from_slice(&40u16.to_be_bytes());
    data[4..6].copy_from_slice(&id.to_be_bytes());
    data[8] = 64;
    data[9] = 6;
    data[12..16].copy_from_slice(&[10, 0, 0, 1]);
    data[16..20].copy_from_slice(&[10, 0, 0, 2]);
    SkBuff::new(ETH_P_IP, data)
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::yield_now();
    }
}

#[test]
fn test_new_uses_arch_cpu_count() {
    init_once();
    let rx = NetRx::new(NetRxConfig::new()).unwrap();
    assert_eq!(rx.cpus(), 2);
}

#[test]
fn test_no_concurrent_poll_of_one_napi() {
    init_once();
    let rx = Arc::new(NetRx::with_cpus(2, NetRxConfig::new()).unwrap());
    let dev = NetDevice::new("conc0", NetDeviceFeatures::GRO);
    dev.open();

    let in_poll = Arc::new(AtomicBool::new(false));
    let polls = Arc::new(AtomicUsize::new(0));
    let (flag, count) = (in_poll.clone(), polls.clone());
    let napi = netif_napi_add(
        &dev,
        poll_fn(move |_ctx, _budget| {
            assert!(!flag.swap(true, Ordering::AcqRel), "napi polled concurrently");
            count.fetch_add(1, Ordering::Relaxed);
            thread::yield_now();
            flag.store(false, Ordering::Release);
            0
        }),
        64,
    )
    .unwrap();
    napi.enable().unwrap();

    let workers: Vec<_> = (0..2)
        .map(|cpu| {
            let (rx, napi) = (rx.clone(), napi.clone());
            thread::spawn(move || {
                for _ in 0..2000 {
                    rx.napi_schedule(cpu, &napi).unwrap();
                    rx.net_rx_action(cpu).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for cpu in 0..2 {
        while rx.softnet(cpu).unwrap().poll_list_len() > 0 {
            rx.net_rx_action(cpu).unwrap();
        }
    }
    assert_eq!(napi.state(), NapiState::Idle);
    assert!(polls.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_disable_waits_for_inflight_poll() {
    init_once();
    let rx = Arc::new(NetRx::with_cpus(1, NetRxConfig::new()).unwrap());
    let dev = NetDevice::new("conc1", NetDeviceFeatures::GRO);

    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let (e, r) = (entered.clone(), release.clone());
    let napi = netif_napi_add(
        &dev,
        poll_fn(move |_ctx, budget| {
            e.store(true, Ordering::Release);
            while !r.load(Ordering::Acquire) {
                thread::yield_now();
            }
            // 用满预算，核心需要在禁用请求下代为完成
            budget
        }),
        8,
    )
    .unwrap();
    napi.enable().unwrap();
    rx.napi_schedule(0, &napi).unwrap();

    let softirq = {
        let rx = rx.clone();
        thread::spawn(move || rx.net_rx_action(0).unwrap())
    };
    wait_until("poll to start", || entered.load(Ordering::Acquire));

    let disabled = Arc::new(AtomicBool::new(false));
    let disabler = {
        let (napi, disabled) = (napi.clone(), disabled.clone());
        thread::spawn(move || {
            napi.disable();
            disabled.store(true, Ordering::Release);
        })
    };

    wait_until("disable request", || napi.state() == NapiState::Disabling);
    thread::sleep(Duration::from_millis(50));
    assert!(!disabled.load(Ordering::Acquire));

    release.store(true, Ordering::Release);
    assert_eq!(softirq.join().unwrap(), 8);
    disabler.join().unwrap();

    assert!(disabled.load(Ordering::Acquire));
    assert_eq!(napi.state(), NapiState::Disabled);
    assert!(!napi.schedule_prep());
    assert_eq!(rx.softnet(0).unwrap().poll_list_len(), 0);
}

#[test]
fn test_rps_remote_cpu_processes_packets() {
    init_once();
    let rx = Arc::new(NetRx::with_cpus(2, NetRxConfig::new()).unwrap());
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    rx.dev_add_pack(ETH_P_IP, move |_skb: SkBuff| {
        counter.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();

    let dev = NetDevice::new("conc2", NetDeviceFeatures::GRO);
    dev.open();
    dev.set_rps_map(&[1]);

    let softirq = {
        let (rx, delivered) = (rx.clone(), delivered.clone());
        thread::spawn(move || {
            wait_until("remote delivery", || {
                rx.net_rx_action(1).unwrap();
                delivered.load(Ordering::Relaxed) == 100
            });
        })
    };

    for id in 0..100 {
        assert_eq!(rx.netif_rx(0, packet(id).with_dev(dev.clone())), Ok(true));
    }
    softirq.join().unwrap();

    let stat = rx.softnet(1).unwrap().stat();
    assert_eq!(stat.processed, 100);
    assert!(stat.received_rps >= 1);
    assert_eq!(rx.softnet(0).unwrap().stat().processed, 0);
    assert_eq!(dev.stats().snapshot().rx_packets, 100);
}

#[test]
fn test_concurrent_producers_single_consumer() {
    init_once();
    let rx = Arc::new(NetRx::with_cpus(5, NetRxConfig::new()).unwrap());
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    rx.dev_add_pack(ETH_P_IP, move |_skb: SkBuff| {
        counter.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();

    let producers: Vec<_> = (1..5)
        .map(|cpu| {
            let rx = rx.clone();
            thread::spawn(move || {
                for id in 0..250 {
                    rx.enqueue_to_backlog(packet(id), 0, cpu).unwrap();
                }
            })
        })
        .collect();

    wait_until("all packets accounted", || {
        rx.net_rx_action(0).unwrap();
        let stat = rx.softnet(0).unwrap().stat();
        stat.processed + stat.dropped == 1000
    });
    for producer in producers {
        producer.join().unwrap();
    }
    // 最后一轮可能正好用满权重而被重新调度
    while rx.softnet(0).unwrap().poll_list_len() > 0 {
        rx.net_rx_action(0).unwrap();
    }

    let stat = rx.softnet(0).unwrap().stat();
    assert_eq!(delivered.load(Ordering::Relaxed), stat.processed as usize);
    assert_eq!(stat.input_queue_tail, stat.processed);
    assert_eq!(rx.softnet(0).unwrap().backlog().state(), NapiState::Idle);
}
