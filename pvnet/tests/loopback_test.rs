//! End-to-end tests: link + device over the loopback netback
//!
//! Covers the resolution flow a guest sees on a fresh interface:
//! 1. Gratuitous ARP on attach
//! 2. ARP request on the first send to the gateway
//! 3. Queued datagram flushed once the reply arrives
//! 4. Echoed datagram delivered back up

mod harness;

use std::net::Ipv4Addr;
use std::time::Duration;

use harness::packets::{
    arp_reply, arp_request, ethernet_frame, ipv4_packet, parse_arp, parse_ipv4, split_ipv4,
};
use harness::{GATEWAY_IP, GATEWAY_MAC, GUEST_IP, GUEST_MAC, Stack, WAIT, test_config, wait_until};
use pvnet::loopback::GatewayPeer;
use pvnet::{EtherType, HardwareAddress, LinkEndpoint, Route};
use smoltcp::wire::ArpOperation;

fn gateway() -> Option<Box<dyn pvnet::loopback::Peer>> {
    Some(Box::new(GatewayPeer::new(
        HardwareAddress(GATEWAY_MAC),
        GATEWAY_IP,
    )))
}

fn send_to(stack: &Stack, remote: Ipv4Addr, payload: &[u8]) {
    let packet = ipv4_packet(GUEST_IP, remote, payload);
    let (header, body) = split_ipv4(&packet);
    stack
        .link
        .write_packet(
            &Route::new(GUEST_IP, remote),
            header,
            body,
            EtherType::IPV4,
        )
        .expect("write_packet");
}

#[test]
fn test_attach_announces_once() {
    let _ = tracing_subscriber::fmt::try_init();

    let stack = Stack::start(&test_config(), None);

    let announce = parse_arp(&stack.transmitted()).expect("gratuitous ARP");
    assert_eq!(announce.eth_dst, [0xff; 6]);
    assert_eq!(announce.eth_src, GUEST_MAC);
    assert_eq!(announce.operation, ArpOperation::Request);
    assert_eq!(announce.sender_mac, GUEST_MAC);
    assert_eq!(announce.sender_ip, GUEST_IP);
    assert_eq!(announce.target_mac, GUEST_MAC);
    assert_eq!(announce.target_ip, GUEST_IP);

    assert!(stack.link.attach(stack.dispatcher.clone()).is_err());
    stack.assert_quiet(Duration::from_millis(100));
}

#[test]
fn test_gateway_resolution_and_echo() {
    let _ = tracing_subscriber::fmt::try_init();

    let stack = Stack::start(&test_config(), gateway());
    stack.transmitted(); // gratuitous ARP

    send_to(&stack, GATEWAY_IP, b"hello gateway");

    // Cache miss: broadcast request for the gateway
    let request = parse_arp(&stack.transmitted()).expect("ARP request");
    assert_eq!(request.eth_dst, [0xff; 6]);
    assert_eq!(request.operation, ArpOperation::Request);
    assert_eq!(request.sender_mac, GUEST_MAC);
    assert_eq!(request.sender_ip, GUEST_IP);
    assert_eq!(request.target_mac, [0; 6]);
    assert_eq!(request.target_ip, GATEWAY_IP);

    // The gateway's reply releases the queued datagram
    let datagram = parse_ipv4(&stack.transmitted()).expect("queued datagram");
    assert_eq!(datagram.eth_dst, GATEWAY_MAC);
    assert_eq!(datagram.eth_src, GUEST_MAC);
    assert_eq!(datagram.src_ip, GUEST_IP);
    assert_eq!(datagram.dst_ip, GATEWAY_IP);
    assert_eq!(datagram.payload, b"hello gateway");

    assert_eq!(
        stack.link.arp_table().lookup(GATEWAY_IP),
        Some(HardwareAddress(GATEWAY_MAC))
    );

    // Echo comes back up with addresses swapped
    let echo = stack.dispatcher.next(WAIT).expect("echo delivered");
    assert_eq!(echo.link, HardwareAddress(GUEST_MAC));
    assert_eq!(echo.source, HardwareAddress(GATEWAY_MAC));
    assert_eq!(echo.protocol, EtherType::IPV4);
    let packet = smoltcp::wire::Ipv4Packet::new_checked(&echo.packet[..]).unwrap();
    assert_eq!(packet.src_addr(), GATEWAY_IP);
    assert_eq!(packet.dst_addr(), GUEST_IP);
    assert_eq!(packet.payload(), b"hello gateway");

    // Resolved now: the next send goes straight out
    send_to(&stack, GATEWAY_IP, b"second");
    let datagram = parse_ipv4(&stack.transmitted()).expect("direct datagram");
    assert_eq!(datagram.eth_dst, GATEWAY_MAC);
    assert_eq!(datagram.payload, b"second");
}

#[test]
fn test_queued_packets_flush_in_order() {
    let _ = tracing_subscriber::fmt::try_init();

    let stack = Stack::start(&test_config(), None);
    stack.transmitted();

    for i in 0..3u8 {
        send_to(&stack, GATEWAY_IP, &[b'a' + i; 4]);
        let request = parse_arp(&stack.transmitted()).expect("ARP request per miss");
        assert_eq!(request.target_ip, GATEWAY_IP);
    }
    assert_eq!(stack.link.arp_table().pending_len(GATEWAY_IP), 3);

    stack
        .netback
        .inject(arp_reply(GATEWAY_MAC, GATEWAY_IP, GUEST_MAC, GUEST_IP));

    for i in 0..3u8 {
        let datagram = parse_ipv4(&stack.transmitted()).expect("flushed datagram");
        assert_eq!(datagram.eth_dst, GATEWAY_MAC);
        assert_eq!(datagram.payload, vec![b'a' + i; 4]);
    }
    assert_eq!(stack.link.arp_table().pending_len(GATEWAY_IP), 0);
    stack.assert_quiet(Duration::from_millis(100));
}

#[test]
fn test_inbound_request_answered_and_learned() {
    let _ = tracing_subscriber::fmt::try_init();

    let stack = Stack::start(&test_config(), None);
    stack.transmitted();

    let neighbor_mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    let neighbor_ip = Ipv4Addr::new(10, 0, 2, 99);
    stack
        .netback
        .inject(arp_request(neighbor_mac, neighbor_ip, GUEST_IP));

    let reply = parse_arp(&stack.transmitted()).expect("ARP reply");
    assert_eq!(reply.eth_dst, neighbor_mac);
    assert_eq!(reply.operation, ArpOperation::Reply);
    assert_eq!(reply.sender_mac, GUEST_MAC);
    assert_eq!(reply.sender_ip, GUEST_IP);
    assert_eq!(reply.target_mac, neighbor_mac);
    assert_eq!(reply.target_ip, neighbor_ip);

    // Learned from the request: no resolution needed
    send_to(&stack, neighbor_ip, b"direct");
    let datagram = parse_ipv4(&stack.transmitted()).expect("datagram");
    assert_eq!(datagram.eth_dst, neighbor_mac);
}

#[test]
fn test_request_for_other_host_is_ignored() {
    let _ = tracing_subscriber::fmt::try_init();

    let stack = Stack::start(&test_config(), None);
    stack.transmitted();

    let neighbor_mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    let neighbor_ip = Ipv4Addr::new(10, 0, 2, 99);
    stack.netback.inject(arp_request(
        neighbor_mac,
        neighbor_ip,
        Ipv4Addr::new(10, 0, 2, 50),
    ));

    stack.assert_quiet(Duration::from_millis(150));
    assert!(wait_until(WAIT, || {
        stack.link.arp_table().lookup(neighbor_ip) == Some(HardwareAddress(neighbor_mac))
    }));
}

#[test]
fn test_other_ethertypes_delivered_up() {
    let _ = tracing_subscriber::fmt::try_init();

    let stack = Stack::start(&test_config(), None);
    stack.transmitted();

    let payload = [0x60, 0x00, 0x00, 0x00, 0x00, 0x08, 0x3a, 0xff];
    stack
        .netback
        .inject(ethernet_frame(GUEST_MAC, GATEWAY_MAC, 0x86dd, &payload));

    let delivery = stack.dispatcher.next(WAIT).expect("IPv6 frame delivered");
    assert_eq!(delivery.protocol, EtherType::IPV6);
    assert_eq!(delivery.source, HardwareAddress(GATEWAY_MAC));
    assert_eq!(delivery.packet, payload);
}

#[test]
fn test_truncated_frames_dropped() {
    let _ = tracing_subscriber::fmt::try_init();

    let stack = Stack::start(&test_config(), None);
    stack.transmitted();

    stack.netback.inject(vec![0xff; 10]);
    let mut short_arp = arp_reply(GATEWAY_MAC, GATEWAY_IP, GUEST_MAC, GUEST_IP);
    short_arp.truncate(30);
    stack.netback.inject(short_arp);

    // A well-formed frame after the junk still arrives
    stack
        .netback
        .inject(ethernet_frame(GUEST_MAC, GATEWAY_MAC, 0x0800, b"after"));
    let delivery = stack.dispatcher.next(WAIT).expect("valid frame delivered");
    assert_eq!(delivery.packet, b"after");
    assert_eq!(stack.dispatcher.pending(), 0);
    assert_eq!(stack.link.arp_table().cache_len(), 0);
}

#[test]
fn test_unanswered_resolution_times_out() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = test_config();
    config.arp.resolution_timeout_ms = Some(100);

    let stack = Stack::start(&config, None);
    stack.transmitted();

    send_to(&stack, GATEWAY_IP, b"one");
    send_to(&stack, GATEWAY_IP, b"two");

    let (remote, dropped) = stack
        .dispatcher
        .next_failure(WAIT)
        .expect("resolution failure reported");
    assert_eq!(remote, GATEWAY_IP);
    assert_eq!(dropped, 2);
    assert_eq!(stack.link.arp_table().pending_len(GATEWAY_IP), 0);

    // A late reply has nothing left to flush
    stack
        .netback
        .inject(arp_reply(GATEWAY_MAC, GATEWAY_IP, GUEST_MAC, GUEST_IP));
    assert!(wait_until(WAIT, || {
        stack.link.arp_table().lookup(GATEWAY_IP).is_some()
    }));
    // Two ARP requests, then nothing
    stack.transmitted();
    stack.transmitted();
    stack.assert_quiet(Duration::from_millis(100));
}

#[test]
fn test_resolution_times_out_under_steady_traffic() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = test_config();
    config.device.housekeeping_interval_ms = 100;
    config.arp.resolution_timeout_ms = Some(150);

    let stack = Stack::start(&config, None);
    stack.transmitted();

    let unreachable = Ipv4Addr::new(10, 0, 2, 99);
    send_to(&stack, unreachable, b"lost");
    assert_eq!(stack.link.arp_table().pending_len(unreachable), 1);

    // Inbound frames every 30ms keep the event channel signalled
    let inbound = ipv4_packet(GATEWAY_IP, GUEST_IP, b"busy");
    let frame = ethernet_frame(GUEST_MAC, GATEWAY_MAC, 0x0800, &inbound);
    let mut failure = None;
    for _ in 0..70 {
        stack.netback.inject(frame.clone());
        failure = stack.dispatcher.next_failure(Duration::from_millis(30));
        if failure.is_some() {
            break;
        }
    }

    assert_eq!(failure, Some((unreachable, 1)));
    assert_eq!(stack.link.arp_table().pending_len(unreachable), 0);
    assert!(stack.dispatcher.next(WAIT).is_some());
}

#[test]
fn test_link_properties() {
    let stack = Stack::start(&test_config(), None);
    assert_eq!(stack.link.mtu(), 1500);
    assert_eq!(stack.link.max_header_length(), 14);
    assert_eq!(stack.link.link_address(), HardwareAddress(GUEST_MAC));
}
