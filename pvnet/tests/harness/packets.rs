//! Packet building utilities for tests
//!
//! Frames are built with `smoltcp::wire` so they do not share code with the
//! crate's own codec.

use std::net::Ipv4Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Packet, Ipv4Repr,
};

/// Build a raw Ethernet frame
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src),
        dst_addr: EthernetAddress::from_bytes(&dst),
        ethertype: EthernetProtocol::from(ethertype),
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

fn arp_frame(dst: EthernetAddress, src: [u8; 6], repr: ArpRepr) -> Vec<u8> {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src),
        dst_addr: dst,
        ethertype: EthernetProtocol::Arp,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);

    let mut arp_packet = ArpPacket::new_unchecked(frame.payload_mut());
    repr.emit(&mut arp_packet);

    buffer
}

/// Build a broadcast ARP request
pub fn arp_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress::from_bytes(&sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress::from_bytes(&[0; 6]),
        target_protocol_addr: target_ip,
    };
    arp_frame(EthernetAddress::BROADCAST, sender_mac, repr)
}

/// Build a unicast ARP reply
pub fn arp_reply(
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: EthernetAddress::from_bytes(&sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress::from_bytes(&target_mac),
        target_protocol_addr: target_ip,
    };
    arp_frame(EthernetAddress::from_bytes(&target_mac), sender_mac, repr)
}

/// Parsed ARP message with its Ethernet addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpFrame {
    pub eth_dst: [u8; 6],
    pub eth_src: [u8; 6],
    pub operation: ArpOperation,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP message from an Ethernet frame
pub fn parse_arp(frame: &[u8]) -> Option<ArpFrame> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }

    let arp = ArpPacket::new_checked(eth.payload()).ok()?;
    match ArpRepr::parse(&arp).ok()? {
        ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => Some(ArpFrame {
            eth_dst: eth.dst_addr().0,
            eth_src: eth.src_addr().0,
            operation,
            sender_mac: source_hardware_addr.0,
            sender_ip: source_protocol_addr,
            target_mac: target_hardware_addr.0,
            target_ip: target_protocol_addr,
        }),
        _ => None,
    }
}

/// Build an IPv4 packet (header + payload) with a valid checksum
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Unknown(253),
        payload_len: payload.len(),
        hop_limit: 64,
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut packet = Ipv4Packet::new_unchecked(&mut buffer);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    packet.payload_mut().copy_from_slice(payload);
    buffer
}

/// Parsed IPv4 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Frame {
    pub eth_dst: [u8; 6],
    pub eth_src: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub payload: Vec<u8>,
}

/// Parse an IPv4 packet from an Ethernet frame
pub fn parse_ipv4(frame: &[u8]) -> Option<Ipv4Frame> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }

    let packet = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if !packet.verify_checksum() {
        return None;
    }

    Some(Ipv4Frame {
        eth_dst: eth.dst_addr().0,
        eth_src: eth.src_addr().0,
        src_ip: packet.src_addr(),
        dst_ip: packet.dst_addr(),
        payload: packet.payload().to_vec(),
    })
}

/// Split an IPv4 packet into header and payload
pub fn split_ipv4(packet: &[u8]) -> (&[u8], &[u8]) {
    let header_len = Ipv4Packet::new_unchecked(packet).header_len() as usize;
    packet.split_at(header_len)
}
