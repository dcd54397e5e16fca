use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{TCP_ACK, collect_ipv4, new_rx, poll_fn, tcp_segment};
use crate::{
    GroResult, NapiFlags, NapiState, NetDevice, NetDeviceFeatures, NetRxError,
    config::MIN_NAPI_ID, dev_get_by_napi_id, napi_by_id, netif_napi_add, netif_napi_del,
    netif_tx_napi_add,
};

fn gro_dev(name: &str) -> Arc<NetDevice> {
    let dev = NetDevice::new(name, NetDeviceFeatures::GRO);
    dev.open();
    dev
}

/// 不调用 complete 的轮询函数，返回 `work` 与预算中较小者
fn counting_poll(calls: &Arc<AtomicUsize>, work: usize) -> impl crate::NapiPoll + 'static {
    let calls = calls.clone();
    poll_fn(move |_ctx, budget| {
        calls.fetch_add(1, Ordering::Relaxed);
        work.min(budget)
    })
}

#[test]
fn test_new_napi_starts_disabled() {
    let dev = gro_dev("napitest0");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();

    assert_eq!(napi.state(), NapiState::Disabled);
    assert!(!napi.schedule_prep());

    napi.enable().unwrap();
    assert_eq!(napi.state(), NapiState::Idle);
    assert_eq!(napi.enable(), Err(NetRxError::NotDisabled));

    assert!(napi.schedule_prep());
    assert!(!napi.schedule_prep());
    assert_eq!(napi.state(), NapiState::Scheduled);
    assert!(!napi.flags().contains(NapiFlags::MISSED));
}

#[test]
fn test_zero_weight_rejected() {
    let dev = gro_dev("napitest1");
    let calls = Arc::new(AtomicUsize::new(0));
    assert_eq!(
        netif_napi_add(&dev, counting_poll(&calls, 0), 0).err(),
        Some(NetRxError::InvalidArgument)
    );
    assert!(dev.napis().is_empty());
}

#[test]
fn test_napi_id_registry() {
    let dev = gro_dev("napitest2");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    let tx = netif_tx_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();

    assert!(napi.id() >= MIN_NAPI_ID);
    assert!(napi.flags().contains(NapiFlags::LISTED));
    assert!(Arc::ptr_eq(&napi_by_id(napi.id()).unwrap(), &napi));
    assert!(Arc::ptr_eq(&dev_get_by_napi_id(napi.id()).unwrap(), &dev));
    assert_eq!(tx.id(), 0);
    assert!(dev_get_by_napi_id(1).is_none());
    assert_eq!(dev.napis().len(), 2);

    let id = napi.id();
    netif_napi_del(&napi);
    assert!(napi_by_id(id).is_none());
    assert_eq!(dev.napis().len(), 1);
}

#[test]
fn test_schedule_twice_polls_once() {
    let rx = new_rx();
    let dev = gro_dev("napitest3");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    napi.enable().unwrap();

    assert_eq!(rx.napi_reschedule(0, &napi), Ok(true));
    assert_eq!(rx.napi_reschedule(0, &napi), Ok(false));
    assert_eq!(rx.softnet(0).unwrap().poll_list_len(), 1);

    rx.net_rx_action(0).unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    // 驱动没有完成，核心代为完成
    assert_eq!(napi.state(), NapiState::Idle);
    assert_eq!(rx.softnet(0).unwrap().poll_list_len(), 0);
}

#[test]
fn test_schedule_while_polling_sets_missed() {
    let rx = new_rx();
    let dev = gro_dev("napitest4");
    let calls = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let (c, done) = (calls.clone(), completed.clone());
    let napi = netif_napi_add(
        &dev,
        poll_fn(move |ctx, _budget| {
            if c.fetch_add(1, Ordering::Relaxed) == 0 {
                // 轮询期间来了一次中断
                assert!(!ctx.napi().schedule_prep());
                assert!(ctx.napi().flags().contains(NapiFlags::MISSED));
                assert!(!ctx.complete_done(0));
            } else if ctx.complete_done(0) {
                done.fetch_add(1, Ordering::Relaxed);
            }
            0
        }),
        16,
    )
    .unwrap();
    napi.enable().unwrap();
    rx.napi_schedule(0, &napi).unwrap();

    rx.net_rx_action(0).unwrap();
    assert_eq!(napi.state(), NapiState::Scheduled);
    assert_eq!(rx.softnet(0).unwrap().poll_list_len(), 1);

    rx.net_rx_action(0).unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 2);
    assert_eq!(completed.load(Ordering::Relaxed), 1);
    assert_eq!(napi.state(), NapiState::Idle);
}

#[test]
fn test_budget_exhausted_repolls() {
    let rx = new_rx();
    let dev = gro_dev("napitest5");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, usize::MAX), 4).unwrap();
    napi.enable().unwrap();
    rx.napi_schedule(0, &napi).unwrap();

    assert_eq!(rx.net_rx_action(0), Ok(4));
    assert_eq!(napi.state(), NapiState::Scheduled);
    assert_eq!(rx.softnet(0).unwrap().poll_list_len(), 1);
}

#[test]
fn test_if_scheduled_mark_missed() {
    let dev = gro_dev("napitest6");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    assert!(napi.if_scheduled_mark_missed());

    napi.enable().unwrap();
    assert!(!napi.if_scheduled_mark_missed());
    napi.schedule_prep();
    assert!(napi.if_scheduled_mark_missed());
    assert!(!napi.flags().contains(NapiFlags::MISSED));
}

#[test]
fn test_complete_from_scheduled_unlists() {
    let rx = new_rx();
    let dev = gro_dev("napitest7");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    napi.enable().unwrap();
    rx.napi_schedule(0, &napi).unwrap();

    assert!(napi.complete(&rx));
    assert_eq!(napi.state(), NapiState::Idle);
    assert_eq!(rx.softnet(0).unwrap().poll_list_len(), 0);

    rx.net_rx_action(0).unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn test_complete_done_when_idle_warns() {
    let rx = new_rx();
    let dev = gro_dev("napitest8");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    napi.enable().unwrap();
    assert!(!napi.complete_done(&rx, 0));
    assert_eq!(napi.state(), NapiState::Idle);
}

#[test]
fn test_disable_idle_and_enable() {
    let rx = new_rx();
    let dev = gro_dev("napitest9");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    napi.enable().unwrap();
    napi.set_prefer_busy_poll(true);

    napi.disable();
    assert_eq!(napi.state(), NapiState::Disabled);
    assert!(!napi.prefer_busy_poll());
    assert_eq!(rx.napi_reschedule(0, &napi), Ok(false));
    // 重复禁用立即返回
    napi.disable();

    napi.enable().unwrap();
    assert_eq!(rx.napi_reschedule(0, &napi), Ok(true));
}

#[test]
fn test_busy_poll() {
    let rx = new_rx();
    let dev = gro_dev("napitest10");
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let napi = netif_napi_add(
        &dev,
        poll_fn(move |ctx, budget| {
            c.fetch_add(1, Ordering::Relaxed);
            assert_eq!(budget, crate::config::BUSY_POLL_BUDGET);
            // 忙轮询期间 complete_done 不改变状态
            assert!(!ctx.complete_done(1));
            1
        }),
        64,
    )
    .unwrap();
    napi.enable().unwrap();

    assert_eq!(rx.napi_busy_poll(0, &napi), Ok(Some(1)));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(napi.state(), NapiState::Idle);
    assert!(!napi.flags().contains(NapiFlags::IN_BUSY_POLL));

    // 已被调度时忙轮询让出，偏好忙轮询的上下文记录 MISSED
    napi.set_prefer_busy_poll(true);
    rx.napi_schedule(0, &napi).unwrap();
    assert_eq!(rx.napi_busy_poll(0, &napi), Ok(None));
    assert!(napi.flags().contains(NapiFlags::MISSED));
}

#[test]
fn test_tx_napi_not_busy_polled() {
    let rx = new_rx();
    let dev = gro_dev("napitest11");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_tx_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    napi.enable().unwrap();
    assert_eq!(rx.napi_busy_poll(0, &napi), Ok(None));
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn test_poll_feeds_gro() {
    let rx = new_rx();
    let received = collect_ipv4(&rx);
    let dev = gro_dev("napitest12");
    let ring_dev = dev.clone();
    let napi = netif_napi_add(
        &dev,
        poll_fn(move |ctx, _budget| {
            let payload = [0x5a; 100];
            let first = tcp_segment(1, 1000, TCP_ACK, &payload).with_dev(ring_dev.clone());
            let second = tcp_segment(2, 1100, TCP_ACK, &payload).with_dev(ring_dev.clone());
            assert_eq!(ctx.gro_receive(first), GroResult::Held);
            assert_eq!(ctx.gro_receive(second), GroResult::Merged);
            assert!(ctx.complete_done(2));
            2
        }),
        64,
    )
    .unwrap();
    napi.enable().unwrap();
    rx.napi_schedule(0, &napi).unwrap();
    rx.net_rx_action(0).unwrap();

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].gso_segs, 2);
    assert_eq!(received[0].napi_id, napi.id());
    assert_eq!(napi.gro_held(), 0);
    assert_eq!(dev.stats().snapshot().rx_packets, 1);
}

#[test]
fn test_synchronize_idle_returns() {
    let dev = gro_dev("napitest13");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    napi.synchronize();
    napi.enable().unwrap();
    napi.synchronize();
    assert_eq!(napi.state(), NapiState::Idle);
}

#[test]
fn test_stale_poll_list_entry_keeps_poll_cpu() {
    let rx = crate::NetRx::with_cpus(2, crate::NetRxConfig::new()).unwrap();
    let dev = gro_dev("napitest14");
    let calls = Arc::new(AtomicUsize::new(0));
    let napi = netif_napi_add(&dev, counting_poll(&calls, 0), 64).unwrap();
    napi.enable().unwrap();
    rx.napi_schedule(0, &napi).unwrap();
    assert!(napi.complete(&rx));

    // 上下文已空闲，另一个 CPU 的轮询列表里还留着它
    rx.softnet(1).unwrap().list_napi(napi.clone());
    rx.net_rx_action(1).unwrap();

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert_eq!(napi.poll_cpu(), 0);
    assert_eq!(napi.state(), NapiState::Idle);
}
