//! Ethernet/ARP link endpoint
//!
//! Sits between a network stack and an [`EthernetLink`] device:
//! - Outbound packets get an Ethernet header addressed to the next hop's
//!   resolved hardware address. Unresolved packets are queued and an ARP
//!   request is broadcast.
//! - Inbound frames are demultiplexed by ethertype. ARP is handled here;
//!   everything else goes up to the attached [`NetworkDispatcher`].
//!
//! Every ARP message seen updates the cache. A reply additionally drains the
//! packets queued for its sender.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::arp::{ArpTable, PendingPacket, Resolution};
use crate::config::ArpConfig;
use crate::endpoint::{
    EthernetDispatcher, EthernetLink, LinkEndpoint, LinkError, NetworkDispatcher, Route,
};
use crate::wire::{
    ARP_MESSAGE_SIZE, ArpMessage, ArpOperation, ETHERNET_HEADER_SIZE, EtherType, EthernetHeader,
    HardwareAddress,
};

/// Largest network-layer payload
pub const MTU: usize = 1500;

pub struct EtharpLink<L: EthernetLink> {
    mac: HardwareAddress,
    ip: Ipv4Addr,
    lower: Arc<L>,
    arp: ArpTable,
    dispatcher: Mutex<Option<Arc<dyn NetworkDispatcher>>>,
    this: Weak<EtharpLink<L>>,
}

impl<L: EthernetLink + 'static> EtharpLink<L> {
    pub fn new(ip: Ipv4Addr, lower: Arc<L>, config: &ArpConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            mac: lower.hardware_address(),
            ip,
            lower,
            arp: ArpTable::from_config(config),
            dispatcher: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn arp_table(&self) -> &ArpTable {
        &self.arp
    }

    fn dispatcher(&self) -> Option<Arc<dyn NetworkDispatcher>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Detach from the lower link, stopping inbound delivery.
    pub fn shutdown(&self) -> Result<(), LinkError> {
        info!(ip = %self.ip, "Link shutting down");
        self.lower.detach()
    }

    fn transmit(
        &self,
        destination: HardwareAddress,
        header: &[u8],
        payload: &[u8],
        protocol: EtherType,
    ) -> Result<(), LinkError> {
        let ethernet = EthernetHeader {
            destination,
            source: self.mac,
            ethertype: protocol,
        }
        .to_bytes();

        trace!(
            dst = %destination,
            ?protocol,
            len = header.len() + payload.len(),
            "TX packet"
        );
        self.lower
            .write_ethernet_frame(&[&ethernet[..], header, payload])
    }

    fn send_arp(&self, destination: HardwareAddress, mut message: ArpMessage) -> Result<(), LinkError> {
        message.stamp_ethernet_ipv4();
        let ethernet = EthernetHeader {
            destination,
            source: self.mac,
            ethertype: EtherType::ARP,
        }
        .to_bytes();
        let body = message.to_bytes();

        self.lower.write_ethernet_frame(&[&ethernet[..], &body[..]])
    }

    fn send_gratuitous_arp(&self) -> Result<(), LinkError> {
        debug!(mac = %self.mac, ip = %self.ip, "Sending gratuitous ARP");
        self.send_arp(
            HardwareAddress::BROADCAST,
            ArpMessage::announcement(self.mac, self.ip),
        )
    }

    fn handle_arp(&self, payload: &[u8]) {
        let message = match ArpMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Dropping malformed ARP message");
                return;
            }
        };
        if !message.is_ethernet_ipv4() {
            debug!(
                hardware_type = message.hardware_type,
                protocol_type = message.protocol_type,
                "Dropping non Ethernet/IPv4 ARP message"
            );
            return;
        }

        match message.operation {
            ArpOperation::Request => {
                self.arp.learn(message.sender_ip, message.sender_hardware);
                if message.target_ip == self.ip {
                    self.answer(&message);
                }
            }
            ArpOperation::Reply => {
                let pending = self
                    .arp
                    .learn_and_take_pending(message.sender_ip, message.sender_hardware);
                debug!(
                    ip = %message.sender_ip,
                    mac = %message.sender_hardware,
                    pending = pending.len(),
                    "ARP reply"
                );
                for packet in pending {
                    self.resend(packet);
                }
            }
            other => {
                self.arp.learn(message.sender_ip, message.sender_hardware);
                trace!(operation = ?other, "Ignoring ARP operation");
            }
        }
    }

    fn answer(&self, request: &ArpMessage) {
        debug!(
            requester_ip = %request.sender_ip,
            requester_mac = %request.sender_hardware,
            "Answering ARP request"
        );
        let reply = ArpMessage::reply(
            self.mac,
            self.ip,
            request.sender_hardware,
            request.sender_ip,
        );
        if let Err(e) = self.send_arp(request.sender_hardware, reply) {
            warn!(error = %e, "Failed to send ARP reply");
        }
    }

    fn resend(&self, packet: PendingPacket) {
        let result = self.write_packet(
            &packet.route,
            &packet.header,
            &packet.payload,
            packet.protocol,
        );
        if let Err(e) = result {
            warn!(remote = %packet.route.remote_address, error = %e, "Failed to send queued packet");
        }
    }

    /// Run ARP expiry and report timed-out resolutions.
    fn expire(&self) {
        let expired = self.arp.expire(Instant::now());
        if expired.evicted > 0 {
            debug!(evicted = expired.evicted, "ARP cache entries expired");
        }

        for (remote, packets) in expired.failed {
            let dropped = packets.len();
            warn!(%remote, dropped, "Address resolution timed out");
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher.resolution_failed(LinkError::ResolutionFailed { remote, dropped });
            }
        }
    }
}

impl<L: EthernetLink + 'static> LinkEndpoint for EtharpLink<L> {
    fn mtu(&self) -> usize {
        MTU
    }

    fn max_header_length(&self) -> usize {
        ETHERNET_HEADER_SIZE
    }

    fn link_address(&self) -> HardwareAddress {
        self.mac
    }

    fn write_packet(
        &self,
        route: &Route,
        header: &[u8],
        payload: &[u8],
        protocol: EtherType,
    ) -> Result<(), LinkError> {
        let len = header.len() + payload.len();
        if len > MTU {
            return Err(LinkError::PacketTooLarge { len, mtu: MTU });
        }

        let remote = route.remote_address;
        let resolution = self.arp.resolve_or_enqueue(remote, || {
            PendingPacket::new(route, header, payload, protocol)
        });

        match resolution {
            Resolution::Resolved(destination) => {
                self.transmit(destination, header, payload, protocol)
            }
            Resolution::Queued { displaced } => {
                if displaced.is_some() {
                    debug!(%remote, "Pending queue full, dropped oldest packet");
                }
                debug!(%remote, "ARP miss, sending request");
                if let Err(e) = self.send_arp(
                    HardwareAddress::BROADCAST,
                    ArpMessage::request(self.mac, self.ip, remote),
                ) {
                    warn!(%remote, error = %e, "Failed to send ARP request");
                }
                Ok(())
            }
        }
    }

    fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>) -> Result<(), LinkError> {
        // Held until the lower link is attached so a failed attempt leaves
        // the link unattached and frames wait for the dispatcher
        let mut slot = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(LinkError::AlreadyAttached);
        }
        let Some(this) = self.this.upgrade() else {
            // Only reachable while the last Arc is being dropped
            return Err(LinkError::AlreadyAttached);
        };

        self.send_gratuitous_arp()?;
        self.lower.attach(this)?;
        *slot = Some(dispatcher);
        drop(slot);

        info!(mac = %self.mac, ip = %self.ip, "Link attached");
        Ok(())
    }
}

impl<L: EthernetLink + 'static> EthernetDispatcher for EtharpLink<L> {
    fn deliver_ethernet_frame(&self, frame: &[u8]) {
        let (header, payload) = match EthernetHeader::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Dropping truncated frame");
                return;
            }
        };

        trace!(
            src = %header.source,
            dst = %header.destination,
            ethertype = ?header.ethertype,
            len = payload.len(),
            "RX frame"
        );

        if header.ethertype == EtherType::ARP {
            if payload.len() < ARP_MESSAGE_SIZE {
                debug!(len = payload.len(), "Dropping truncated ARP message");
                return;
            }
            self.handle_arp(payload);
            return;
        }

        match self.dispatcher() {
            Some(dispatcher) => {
                dispatcher.deliver_network_packet(self, header.source, header.ethertype, payload)
            }
            None => debug!(ethertype = ?header.ethertype, "No dispatcher attached, dropping"),
        }
    }

    fn tick(&self) {
        self.expire();
    }
}
