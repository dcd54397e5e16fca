use alloc::{format, string::String, vec::Vec};
use core::sync::atomic::Ordering;

use super::{TCP_ACK, count_ipv4, new_rx, tcp_segment};
use crate::{NapiState, NetDevice, NetDeviceFeatures, NetRx, NetRxConfig, NetRxError, SoftnetStat};

#[test]
fn test_backlog_limit() {
    let rx = new_rx();
    rx.config().set_netdev_max_backlog(2).unwrap();

    assert_eq!(rx.netif_rx(0, tcp_segment(1, 1, TCP_ACK, b"a")), Ok(true));
    assert_eq!(rx.netif_rx(0, tcp_segment(2, 2, TCP_ACK, b"b")), Ok(true));
    assert_eq!(rx.netif_rx(0, tcp_segment(3, 3, TCP_ACK, b"c")), Ok(false));

    let sd = rx.softnet(0).unwrap();
    assert_eq!(sd.input_len(), 2);
    assert_eq!(sd.stat().dropped, 1);
    assert_eq!(sd.stat().input_queue_tail, 2);
    // 第一个报文调度了 backlog
    assert_eq!(sd.backlog().state(), NapiState::Scheduled);
    assert_eq!(sd.poll_list_len(), 1);
}

#[test]
fn test_backlog_processed_by_net_rx_action() {
    let rx = new_rx();
    let count = count_ipv4(&rx);
    for i in 0..3 {
        rx.netif_rx(0, tcp_segment(i, i as u32, TCP_ACK, b"x")).unwrap();
    }

    assert_eq!(rx.net_rx_action(0), Ok(3));
    assert_eq!(count.load(Ordering::Relaxed), 3);

    let sd = rx.softnet(0).unwrap();
    let stat = sd.stat();
    assert_eq!(stat.processed, 3);
    assert_eq!(stat.polls, 1);
    assert_eq!(stat.backlog_len, 0);
    assert_eq!(stat.input_queue_head, stat.input_queue_tail);
    assert_eq!(sd.backlog().state(), NapiState::Idle);
    assert_eq!(sd.poll_list_len(), 0);
}

#[test]
fn test_backlog_quota_repolls() {
    let rx = new_rx();
    let count = count_ipv4(&rx);
    rx.config().set_dev_weight(2).unwrap();
    for i in 0..5 {
        rx.netif_rx(0, tcp_segment(i, i as u32, TCP_ACK, b"x")).unwrap();
    }

    let sd = rx.softnet(0).unwrap();
    assert_eq!(rx.net_rx_action(0), Ok(2));
    assert_eq!(sd.backlog().state(), NapiState::Scheduled);
    assert_eq!(sd.poll_list_len(), 1);

    assert_eq!(rx.net_rx_action(0), Ok(2));
    assert_eq!(rx.net_rx_action(0), Ok(1));
    assert_eq!(count.load(Ordering::Relaxed), 5);
    assert_eq!(sd.backlog().state(), NapiState::Idle);
    assert_eq!(sd.poll_list_len(), 0);
    // 空列表上再次运行什么也不做
    assert_eq!(rx.net_rx_action(0), Ok(0));
}

#[test]
fn test_budget_exhaustion_counts_time_squeeze() {
    let rx = new_rx();
    rx.config().set_netdev_budget(2).unwrap();
    rx.config().set_dev_weight(2).unwrap();
    count_ipv4(&rx);
    for i in 0..4 {
        rx.netif_rx(0, tcp_segment(i, i as u32, TCP_ACK, b"x")).unwrap();
    }

    assert_eq!(rx.net_rx_action(0), Ok(2));
    let sd = rx.softnet(0).unwrap();
    assert!(sd.stat().time_squeeze >= 1);
    assert_eq!(sd.poll_list_len(), 1);
}

#[test]
fn test_remote_enqueue_kicks_target() {
    let rx = NetRx::with_cpus(2, NetRxConfig::new()).unwrap();
    let count = count_ipv4(&rx);

    assert_eq!(rx.enqueue_to_backlog(tcp_segment(1, 1, TCP_ACK, b"x"), 1, 0), Ok(true));
    assert_eq!(rx.enqueue_to_backlog(tcp_segment(2, 2, TCP_ACK, b"x"), 1, 0), Ok(true));

    let target = rx.softnet(1).unwrap();
    // 目标 CPU 的轮询列表在它自己的软中断里才被修改
    assert_eq!(target.poll_list_len(), 0);
    assert_eq!(target.stat().received_rps, 1);
    assert_eq!(rx.softnet(0).unwrap().stat().received_rps, 0);

    assert_eq!(rx.net_rx_action(1), Ok(2));
    assert_eq!(count.load(Ordering::Relaxed), 2);
    assert_eq!(target.backlog().state(), NapiState::Idle);
}

#[test]
fn test_invalid_cpu() {
    let rx = new_rx();
    assert_eq!(
        rx.enqueue_to_backlog(tcp_segment(1, 1, TCP_ACK, b"x"), 3, 0),
        Err(NetRxError::InvalidCpu)
    );
    assert_eq!(rx.net_rx_action(1), Err(NetRxError::InvalidCpu));
    assert!(rx.softnet(1).is_err());
    assert!(NetRx::with_cpus(0, NetRxConfig::new()).is_err());
}

#[test]
fn test_stopped_device_drops() {
    let rx = new_rx();
    let dev = NetDevice::new("sntest0", NetDeviceFeatures::empty());
    let skb = tcp_segment(1, 1, TCP_ACK, b"x").with_dev(dev.clone());
    assert_eq!(rx.netif_rx(0, skb), Ok(false));
    assert_eq!(dev.stats().snapshot().rx_dropped, 1);

    dev.open();
    let skb = tcp_segment(2, 2, TCP_ACK, b"x").with_dev(dev.clone());
    assert_eq!(rx.netif_rx(0, skb), Ok(true));
}

#[test]
fn test_no_handler_counted_on_device() {
    let rx = new_rx();
    let dev = NetDevice::new("sntest1", NetDeviceFeatures::empty());
    dev.open();
    rx.netif_rx(0, tcp_segment(1, 1, TCP_ACK, b"x").with_dev(dev.clone())).unwrap();
    rx.net_rx_action(0).unwrap();

    let stats = dev.stats().snapshot();
    assert_eq!(stats.rx_nohandler, 1);
    assert_eq!(stats.rx_packets, 0);
}

#[test]
fn test_drain() {
    let rx = new_rx();
    for i in 0..3 {
        rx.netif_rx(0, tcp_segment(i, i as u32, TCP_ACK, b"x")).unwrap();
    }
    let sd = rx.softnet(0).unwrap();
    assert_eq!(sd.queue_depth(), 3);

    let ids: Vec<u16> = sd
        .drain()
        .map(|skb| u16::from_be_bytes([skb.data()[4], skb.data()[5]]))
        .collect();
    assert_eq!(ids, [0, 1, 2]);
    assert_eq!(sd.queue_depth(), 0);
    assert_eq!(sd.backlog_len(), 0);
}

#[test]
fn test_flow_limit_drops_dominant_flow() {
    let rx = new_rx();
    rx.set_flow_limit_cpu_bitmap(1);
    assert_eq!(rx.config().flow_limit_cpu_bitmap(), 1);

    let mut accepted = 0;
    for i in 0..600u32 {
        let mut skb = tcp_segment(i as u16, i, TCP_ACK, b"");
        skb.hash = 0x55;
        if rx.netif_rx(0, skb).unwrap() {
            accepted += 1;
        }
    }
    // 队列过半之后，同一个流最多再占半个历史窗口
    assert_eq!(accepted, 500 + 64);
    let stat = rx.softnet(0).unwrap().stat();
    assert_eq!(stat.flow_limit_count, 36);
    assert_eq!(stat.dropped, 36);

    rx.set_flow_limit_cpu_bitmap(0);
    assert_eq!(rx.softnet(0).unwrap().stat().flow_limit_count, 0);
}

#[test]
fn test_softnet_stat_format() {
    let stat = SoftnetStat {
        cpu: 1,
        processed: 0x10,
        dropped: 2,
        time_squeeze: 3,
        received_rps: 4,
        flow_limit_count: 5,
        backlog_len: 6,
        ..Default::default()
    };
    assert_eq!(
        format!("{}", stat),
        "00000010 00000002 00000003 00000000 00000000 00000000 00000000 00000000 00000000 \
         00000004 00000005 00000006 00000001\n"
    );
}

#[test]
fn test_softnet_stat_text_one_line_per_cpu() {
    let rx = NetRx::with_cpus(3, NetRxConfig::new()).unwrap();
    let text: String = rx.softnet_stat_text();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[2].ends_with(" 00000002"));
    assert!(lines.iter().all(|line| line.split(' ').count() == 13));
}
