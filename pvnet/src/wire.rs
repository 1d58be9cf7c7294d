//! Ethernet and ARP wire formats
//!
//! Fixed-layout header encoding and decoding on top of `smoltcp::wire`.
//! Both headers are big-endian:
//!
//! ```text
//! Ethernet (14 bytes): dst[6] src[6] ethertype[2]
//! ARP      (28 bytes): hw_type[2] proto_type[2] hw_len[1] proto_len[1] opcode[2]
//!                      sender_hw[6] sender_ip[4] target_hw[6] target_ip[4]
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smoltcp::wire::{ArpHardware, ArpPacket, EthernetAddress, EthernetFrame, EthernetProtocol};
use thiserror::Error;

pub use smoltcp::wire::ArpOperation;

/// Ethernet header size
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// ARP packet size (for Ethernet + IPv4)
pub const ARP_MESSAGE_SIZE: usize = 28;

/// ARP hardware type for Ethernet
pub const ARP_HARDWARE_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const ARP_PROTOCOL_IPV4: u16 = 0x0800;

/// Wire codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated {layer}: {len} bytes")]
    Truncated { layer: &'static str, len: usize },

    #[error("unsupported ARP format: hw_type={hardware_type:#06x} proto_type={protocol_type:#06x} hw_len={hardware_len} proto_len={protocol_len}")]
    UnsupportedArp {
        hardware_type: u16,
        protocol_type: u16,
        hardware_len: u8,
        protocol_len: u8,
    },

    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("invalid hardware address: {0}")]
    InvalidHardwareAddress(String),
}

/// A 48-bit Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HardwareAddress(pub [u8; 6]);

impl HardwareAddress {
    /// Broadcast address `ff:ff:ff:ff:ff:ff`
    pub const BROADCAST: HardwareAddress = HardwareAddress([0xff; 6]);

    /// All-zero address, used as the unknown target of an ARP request
    pub const ZERO: HardwareAddress = HardwareAddress([0; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set (includes broadcast)
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for HardwareAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| WireError::InvalidHardwareAddress(s.to_string()))?;
            if part.len() != 2 {
                return Err(WireError::InvalidHardwareAddress(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| WireError::InvalidHardwareAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(WireError::InvalidHardwareAddress(s.to_string()));
        }
        Ok(HardwareAddress(octets))
    }
}

impl TryFrom<String> for HardwareAddress {
    type Error = WireError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HardwareAddress> for String {
    fn from(addr: HardwareAddress) -> Self {
        addr.to_string()
    }
}

impl From<EthernetAddress> for HardwareAddress {
    fn from(addr: EthernetAddress) -> Self {
        HardwareAddress(addr.0)
    }
}

impl From<HardwareAddress> for EthernetAddress {
    fn from(addr: HardwareAddress) -> Self {
        EthernetAddress(addr.0)
    }
}

/// Ethernet frame type / network protocol number.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EtherType(pub u16);

impl EtherType {
    pub const IPV4: EtherType = EtherType(0x0800);
    pub const ARP: EtherType = EtherType(0x0806);
    pub const IPV6: EtherType = EtherType(0x86dd);
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Debug for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EtherType::IPV4 => f.write_str("IPv4"),
            EtherType::ARP => f.write_str("ARP"),
            EtherType::IPV6 => f.write_str("IPv6"),
            other => write!(f, "EtherType({other})"),
        }
    }
}

/// Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub destination: HardwareAddress,
    pub source: HardwareAddress,
    pub ethertype: EtherType,
}

impl EthernetHeader {
    /// Parse the header at the start of `frame`, returning it with the payload
    /// that follows.
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let parsed = EthernetFrame::new_checked(frame).map_err(|_| WireError::Truncated {
            layer: "ethernet header",
            len: frame.len(),
        })?;

        let header = EthernetHeader {
            destination: parsed.dst_addr().into(),
            source: parsed.src_addr().into(),
            ethertype: EtherType(u16::from(parsed.ethertype())),
        };

        Ok((header, &frame[ETHERNET_HEADER_SIZE..]))
    }

    /// Write the header into the first 14 bytes of `buf`.
    pub fn emit(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < ETHERNET_HEADER_SIZE {
            return Err(WireError::BufferTooSmall {
                needed: ETHERNET_HEADER_SIZE,
                available: buf.len(),
            });
        }

        let mut frame = EthernetFrame::new_unchecked(&mut buf[..ETHERNET_HEADER_SIZE]);
        frame.set_dst_addr(self.destination.into());
        frame.set_src_addr(self.source.into());
        frame.set_ethertype(EthernetProtocol::from(self.ethertype.0));
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; ETHERNET_HEADER_SIZE] {
        let mut bytes = [0u8; ETHERNET_HEADER_SIZE];
        // Cannot fail: the array is exactly one header long
        let _ = self.emit(&mut bytes);
        bytes
    }
}

/// ARP message for any hardware/protocol pair whose address sizes are 6 and 4.
///
/// The fixed fields are kept so that decoding preserves exactly what was on
/// the wire; [`ArpMessage::stamp_ethernet_ipv4`] resets them before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpMessage {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub hardware_len: u8,
    pub protocol_len: u8,
    pub operation: ArpOperation,
    pub sender_hardware: HardwareAddress,
    pub sender_ip: Ipv4Addr,
    pub target_hardware: HardwareAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpMessage {
    /// Request for `target_ip`, with the target hardware address left zero.
    pub fn request(sender_hardware: HardwareAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self::ethernet_ipv4(
            ArpOperation::Request,
            sender_hardware,
            sender_ip,
            HardwareAddress::ZERO,
            target_ip,
        )
    }

    /// Gratuitous announcement: sender and target are both our own identity.
    pub fn announcement(hardware: HardwareAddress, ip: Ipv4Addr) -> Self {
        Self::ethernet_ipv4(ArpOperation::Request, hardware, ip, hardware, ip)
    }

    pub fn reply(
        sender_hardware: HardwareAddress,
        sender_ip: Ipv4Addr,
        target_hardware: HardwareAddress,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self::ethernet_ipv4(
            ArpOperation::Reply,
            sender_hardware,
            sender_ip,
            target_hardware,
            target_ip,
        )
    }

    fn ethernet_ipv4(
        operation: ArpOperation,
        sender_hardware: HardwareAddress,
        sender_ip: Ipv4Addr,
        target_hardware: HardwareAddress,
        target_ip: Ipv4Addr,
    ) -> Self {
        ArpMessage {
            hardware_type: ARP_HARDWARE_ETHERNET,
            protocol_type: ARP_PROTOCOL_IPV4,
            hardware_len: 6,
            protocol_len: 4,
            operation,
            sender_hardware,
            sender_ip,
            target_hardware,
            target_ip,
        }
    }

    /// Reset the fixed fields to Ethernet/IPv4.
    pub fn stamp_ethernet_ipv4(&mut self) {
        self.hardware_type = ARP_HARDWARE_ETHERNET;
        self.protocol_type = ARP_PROTOCOL_IPV4;
        self.hardware_len = 6;
        self.protocol_len = 4;
    }

    pub fn is_ethernet_ipv4(&self) -> bool {
        self.hardware_type == ARP_HARDWARE_ETHERNET
            && self.protocol_type == ARP_PROTOCOL_IPV4
            && self.hardware_len == 6
            && self.protocol_len == 4
    }

    /// Parse an ARP message from an Ethernet payload.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let packet = ArpPacket::new_checked(data).map_err(|_| WireError::Truncated {
            layer: "arp message",
            len: data.len(),
        })?;

        let hardware_type = u16::from(packet.hardware_type());
        let protocol_type = u16::from(packet.protocol_type());
        let hardware_len = packet.hardware_len();
        let protocol_len = packet.protocol_len();

        if hardware_len != 6 || protocol_len != 4 {
            return Err(WireError::UnsupportedArp {
                hardware_type,
                protocol_type,
                hardware_len,
                protocol_len,
            });
        }

        Ok(ArpMessage {
            hardware_type,
            protocol_type,
            hardware_len,
            protocol_len,
            operation: packet.operation(),
            sender_hardware: hardware_address(packet.source_hardware_addr()),
            sender_ip: ipv4_address(packet.source_protocol_addr()),
            target_hardware: hardware_address(packet.target_hardware_addr()),
            target_ip: ipv4_address(packet.target_protocol_addr()),
        })
    }

    /// Write the message into the first 28 bytes of `buf`.
    pub fn emit(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < ARP_MESSAGE_SIZE {
            return Err(WireError::BufferTooSmall {
                needed: ARP_MESSAGE_SIZE,
                available: buf.len(),
            });
        }

        let mut packet = ArpPacket::new_unchecked(&mut buf[..ARP_MESSAGE_SIZE]);
        packet.set_hardware_type(ArpHardware::from(self.hardware_type));
        packet.set_protocol_type(EthernetProtocol::from(self.protocol_type));
        // Lengths first: the address field offsets depend on them
        packet.set_hardware_len(6);
        packet.set_protocol_len(4);
        packet.set_operation(self.operation);
        packet.set_source_hardware_addr(&self.sender_hardware.0);
        packet.set_source_protocol_addr(&self.sender_ip.octets());
        packet.set_target_hardware_addr(&self.target_hardware.0);
        packet.set_target_protocol_addr(&self.target_ip.octets());
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; ARP_MESSAGE_SIZE] {
        let mut bytes = [0u8; ARP_MESSAGE_SIZE];
        let _ = self.emit(&mut bytes);
        bytes
    }
}

fn hardware_address(bytes: &[u8]) -> HardwareAddress {
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&bytes[..6]);
    HardwareAddress(octets)
}

fn ipv4_address(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}
