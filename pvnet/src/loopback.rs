//! In-process netback simulation
//!
//! Plays the privileged backend half of the split device so the front end can
//! run without a hypervisor: a grant table that enforces access rights, the
//! backend side of both rings, and the peer end of the event channel.
//!
//! Frames the guest transmits are recorded and optionally handed to a
//! [`Peer`], whose answers are delivered back through the RX ring.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use smoltcp::wire::Ipv4Packet;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::device::{DeviceError, DeviceResources};
use crate::evtchn::{EventChannel, EventFdChannel};
use crate::hypervisor::{DomainId, GrantRef, GrantTable, HypervisorError, PAGE_SIZE, PageFrame};
use crate::ring::{
    BackRing, NETIF_RSP_ERROR, NETIF_RSP_OKAY, RxRequest, RxResponse, RxSharedRing, TxRequest,
    TxResponse, TxSharedRing,
};
use crate::wire::{ArpMessage, ArpOperation, ETHERNET_HEADER_SIZE, EtherType, EthernetHeader, HardwareAddress};

/// First grant reference handed out; lower ones are reserved
const FIRST_GRANT: u32 = 8;

/// Upper bound on simultaneously active grants
const MAX_GRANTS: usize = 4096;

/// Backend wake-up interval when nothing signals it
const BACKEND_POLL: Duration = Duration::from_millis(50);

struct Grant {
    domain: DomainId,
    frame: PageFrame,
    readonly: bool,
}

#[derive(Default)]
struct GrantState {
    next: u32,
    active: HashMap<u32, Grant>,
    fail_next: u32,
}

/// Grant table that tracks grants in memory and enforces their rights.
#[derive(Default)]
pub struct SimGrantTable {
    state: Mutex<GrantState>,
}

impl SimGrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GrantState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` grant operations fail.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn active_grants(&self) -> usize {
        self.lock().active.len()
    }

    /// Whether `gref` is active and allows `domain` to write.
    pub fn is_writable(&self, gref: GrantRef) -> Option<bool> {
        self.lock().active.get(&gref.0).map(|g| !g.readonly)
    }

    fn map(&self, domain: DomainId, gref: GrantRef, write: bool) -> Result<PageFrame, HypervisorError> {
        let state = self.lock();
        let grant = state
            .active
            .get(&gref.0)
            .ok_or(HypervisorError::UnknownGrant(gref))?;

        if grant.domain != domain {
            return Err(HypervisorError::AccessDenied {
                gref,
                access: "foreign domain",
            });
        }
        if write && grant.readonly {
            return Err(HypervisorError::AccessDenied {
                gref,
                access: "write",
            });
        }
        Ok(grant.frame.clone())
    }

    /// Read through a grant as `domain`.
    pub fn read(&self, domain: DomainId, gref: GrantRef, offset: usize, len: usize) -> Result<Vec<u8>, HypervisorError> {
        self.map(domain, gref, false)?.to_vec(offset, len)
    }

    /// Write through a grant as `domain`.
    pub fn write(&self, domain: DomainId, gref: GrantRef, offset: usize, bytes: &[u8]) -> Result<(), HypervisorError> {
        self.map(domain, gref, true)?.write(offset, bytes)
    }
}

impl GrantTable for SimGrantTable {
    fn grant_access(&self, domain: DomainId, frame: &PageFrame, readonly: bool) -> Result<GrantRef, HypervisorError> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(HypervisorError::GrantFailed("injected failure".into()));
        }
        if state.active.len() >= MAX_GRANTS {
            return Err(HypervisorError::GrantTableFull);
        }

        if state.next < FIRST_GRANT {
            state.next = FIRST_GRANT;
        }
        let gref = state.next;
        state.next = state.next.wrapping_add(1).max(FIRST_GRANT);
        state.active.insert(
            gref,
            Grant {
                domain,
                frame: frame.clone(),
                readonly,
            },
        );
        Ok(GrantRef(gref))
    }

    fn end_access(&self, gref: GrantRef) -> Result<(), HypervisorError> {
        match self.lock().active.remove(&gref.0) {
            Some(_) => Ok(()),
            None => Err(HypervisorError::UnknownGrant(gref)),
        }
    }
}

/// A host on the far side of the backend.
pub trait Peer: Send {
    /// Frames to deliver to the guest in answer to one transmitted frame.
    fn on_frame(&mut self, frame: &[u8]) -> Vec<Vec<u8>>;
}

/// Answers ARP for its address and echoes IPv4 datagrams sent to it.
pub struct GatewayPeer {
    mac: HardwareAddress,
    ip: Ipv4Addr,
}

impl GatewayPeer {
    pub fn new(mac: HardwareAddress, ip: Ipv4Addr) -> Self {
        Self { mac, ip }
    }

    fn answer_arp(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let request = ArpMessage::parse(payload).ok()?;
        if request.operation != ArpOperation::Request || request.target_ip != self.ip {
            return None;
        }

        let reply = ArpMessage::reply(self.mac, self.ip, request.sender_hardware, request.sender_ip);
        let header = EthernetHeader {
            destination: request.sender_hardware,
            source: self.mac,
            ethertype: EtherType::ARP,
        };
        Some([&header.to_bytes()[..], &reply.to_bytes()[..]].concat())
    }

    fn echo(&self, source: HardwareAddress, frame: &[u8]) -> Vec<u8> {
        let mut echoed = frame.to_vec();
        let header = EthernetHeader {
            destination: source,
            source: self.mac,
            ethertype: EtherType::IPV4,
        };
        echoed[..ETHERNET_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        if let Ok(mut packet) = Ipv4Packet::new_checked(&mut echoed[ETHERNET_HEADER_SIZE..]) {
            let src = packet.src_addr();
            let dst = packet.dst_addr();
            packet.set_src_addr(dst);
            packet.set_dst_addr(src);
            packet.fill_checksum();
        }
        echoed
    }
}

impl Peer for GatewayPeer {
    fn on_frame(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let Ok((header, payload)) = EthernetHeader::parse(frame) else {
            return Vec::new();
        };

        match header.ethertype {
            EtherType::ARP => self.answer_arp(payload).into_iter().collect(),
            EtherType::IPV4 if header.destination == self.mac => vec![self.echo(header.source, frame)],
            _ => Vec::new(),
        }
    }
}

/// Something to place in the next RX slot.
enum Inbound {
    Frame(Vec<u8>),
    Status(i16),
}

struct Backend {
    domain: DomainId,
    grants: Arc<SimGrantTable>,
    events: EventFdChannel,
    shutdown: AtomicBool,
    tx_paused: AtomicBool,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    transmitted: Sender<Vec<u8>>,
}

/// Simulated backend driving the other half of the rings.
pub struct LoopbackNetback {
    backend: Arc<Backend>,
    transmitted: Receiver<Vec<u8>>,
    handle: Option<JoinHandle<()>>,
}

impl LoopbackNetback {
    /// Create rings, grant table and event channel, start the backend and
    /// return the resources the front end is built from.
    pub fn new(config: &Config, peer: Option<Box<dyn Peer>>) -> Result<(Self, DeviceResources), DeviceError> {
        let ring_size = config.device.ring_size;
        let rx_ring = Arc::new(RxSharedRing::new(ring_size)?);
        let tx_ring = Arc::new(TxSharedRing::new(ring_size)?);
        let grants = Arc::new(SimGrantTable::new());
        let (front_events, back_events) = EventFdChannel::pair()?;
        let domain = config.interface.backend_domain();

        let (inbound_tx, inbound_rx) = unbounded();
        let (transmitted_tx, transmitted_rx) = unbounded();

        let backend = Arc::new(Backend {
            domain,
            grants: grants.clone(),
            events: back_events,
            shutdown: AtomicBool::new(false),
            tx_paused: AtomicBool::new(false),
            inbound_tx,
            inbound_rx,
            transmitted: transmitted_tx,
        });

        let handle = {
            let backend = backend.clone();
            let rx = BackRing::new(rx_ring.clone());
            let tx = BackRing::new(tx_ring.clone());
            thread::Builder::new()
                .name("pvnet-netback".to_string())
                .spawn(move || backend.run(rx, tx, peer))
                .map_err(|e| DeviceError::TransportFailed(format!("spawn netback: {e}")))?
        };

        info!(%domain, ring_size, "Loopback netback started");

        let resources = DeviceResources {
            backend_domain: domain,
            grant_table: grants,
            event_channel: Arc::new(front_events),
            rx_ring,
            tx_ring,
        };

        Ok((
            Self {
                backend,
                transmitted: transmitted_rx,
                handle: Some(handle),
            },
            resources,
        ))
    }

    pub fn grant_table(&self) -> &Arc<SimGrantTable> {
        &self.backend.grants
    }

    /// Frames the guest transmitted, in order.
    pub fn transmitted(&self) -> &Receiver<Vec<u8>> {
        &self.transmitted
    }

    /// Deliver `frame` to the guest.
    pub fn inject(&self, frame: Vec<u8>) {
        self.push_inbound(Inbound::Frame(frame));
    }

    /// Answer the next RX request with a bare status and no payload.
    pub fn inject_rx_status(&self, status: i16) {
        self.push_inbound(Inbound::Status(status));
    }

    /// Stop (or resume) consuming TX requests.
    pub fn pause_tx(&self, paused: bool) {
        self.backend.tx_paused.store(paused, Ordering::SeqCst);
        let _ = self.backend.events.wake_local();
    }

    fn push_inbound(&self, inbound: Inbound) {
        let _ = self.backend.inbound_tx.send(inbound);
        let _ = self.backend.events.wake_local();
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.shutdown.store(true, Ordering::SeqCst);
            let _ = self.backend.events.wake_local();
            if handle.join().is_err() {
                error!("Netback thread panicked");
            }
        }
    }
}

impl Drop for LoopbackNetback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Backend {
    fn run(
        &self,
        mut rx: BackRing<RxRequest, RxResponse>,
        mut tx: BackRing<TxRequest, TxResponse>,
        mut peer: Option<Box<dyn Peer>>,
    ) {
        let mut backlog: VecDeque<Inbound> = VecDeque::new();

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.events.wait(Some(BACKEND_POLL)) {
                error!(error = %e, "Netback event channel failed");
                return;
            }

            backlog.extend(self.inbound_rx.try_iter());

            if let Err(e) = self.service(&mut rx, &mut tx, &mut backlog, &mut peer) {
                error!(error = %e, "Netback ring failure");
                return;
            }
        }
        debug!("Netback stopped");
    }

    fn service(
        &self,
        rx: &mut BackRing<RxRequest, RxResponse>,
        tx: &mut BackRing<TxRequest, TxResponse>,
        backlog: &mut VecDeque<Inbound>,
        peer: &mut Option<Box<dyn Peer>>,
    ) -> Result<(), DeviceError> {
        loop {
            let paused = self.tx_paused.load(Ordering::SeqCst);
            let mut notify = false;

            if !paused {
                while let Some(request) = tx.next_request()? {
                    let status = self.transmit(&request, backlog, peer);
                    tx.queue_response(TxResponse {
                        id: request.id,
                        status,
                    })?;
                }
                notify |= tx.push_responses();
            }

            while !backlog.is_empty() {
                let Some(request) = rx.next_request()? else {
                    break;
                };
                let status = match backlog.pop_front() {
                    Some(Inbound::Frame(frame)) => self.receive(&request, &frame),
                    Some(Inbound::Status(status)) => status,
                    None => break,
                };
                rx.queue_response(RxResponse {
                    id: request.id,
                    offset: 0,
                    flags: 0,
                    status,
                })?;
            }
            notify |= rx.push_responses();

            if notify {
                self.events.notify()?;
            }

            let tx_more = !paused && tx.final_check_for_requests();
            let rx_more = !backlog.is_empty() && rx.final_check_for_requests();
            if !tx_more && !rx_more {
                return Ok(());
            }
        }
    }

    fn transmit(
        &self,
        request: &TxRequest,
        backlog: &mut VecDeque<Inbound>,
        peer: &mut Option<Box<dyn Peer>>,
    ) -> i16 {
        let frame = match self.grants.read(
            self.domain,
            request.gref,
            request.offset as usize,
            request.size as usize,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(id = request.id, gref = %request.gref, error = %e, "TX grant read failed");
                return NETIF_RSP_ERROR;
            }
        };

        trace!(id = request.id, len = frame.len(), "Netback TX");
        if let Some(peer) = peer.as_mut() {
            backlog.extend(peer.on_frame(&frame).into_iter().map(Inbound::Frame));
        }
        let _ = self.transmitted.send(frame);
        NETIF_RSP_OKAY
    }

    fn receive(&self, request: &RxRequest, frame: &[u8]) -> i16 {
        if frame.len() > PAGE_SIZE || frame.len() > i16::MAX as usize {
            warn!(len = frame.len(), "Inbound frame larger than a page");
            return NETIF_RSP_ERROR;
        }

        match self.grants.write(self.domain, request.gref, 0, frame) {
            Ok(()) => {
                trace!(id = request.id, len = frame.len(), "Netback RX");
                frame.len() as i16
            }
            Err(e) => {
                warn!(id = request.id, gref = %request.gref, error = %e, "RX grant write failed");
                NETIF_RSP_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATEWAY_MAC: HardwareAddress = HardwareAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 1);
    const GUEST_MAC: HardwareAddress = HardwareAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 20);

    #[test]
    fn test_grant_rights_enforced() {
        let grants = SimGrantTable::new();
        let frame = PageFrame::new(1);
        let backend = DomainId(0);

        let ro = grants.grant_access(backend, &frame, true).unwrap();
        assert!(ro.0 >= FIRST_GRANT);
        assert_eq!(grants.is_writable(ro), Some(false));
        assert!(grants.read(backend, ro, 0, 4).is_ok());
        assert!(matches!(
            grants.write(backend, ro, 0, b"x"),
            Err(HypervisorError::AccessDenied { access: "write", .. })
        ));
        assert!(matches!(
            grants.read(DomainId(3), ro, 0, 4),
            Err(HypervisorError::AccessDenied { .. })
        ));

        let rw = grants.grant_access(backend, &frame, false).unwrap();
        grants.write(backend, rw, 10, b"abc").unwrap();
        assert_eq!(frame.to_vec(10, 3).unwrap(), b"abc");

        grants.end_access(ro).unwrap();
        grants.end_access(rw).unwrap();
        assert_eq!(grants.active_grants(), 0);
        assert!(matches!(
            grants.read(backend, rw, 0, 1),
            Err(HypervisorError::UnknownGrant(_))
        ));
        assert!(grants.end_access(rw).is_err());
    }

    #[test]
    fn test_fail_next_injects_failures() {
        let grants = SimGrantTable::new();
        let frame = PageFrame::new(1);
        grants.fail_next(2);

        assert!(grants.grant_access(DomainId(0), &frame, false).is_err());
        assert!(grants.grant_access(DomainId(0), &frame, false).is_err());
        assert!(grants.grant_access(DomainId(0), &frame, false).is_ok());
    }

    #[test]
    fn test_gateway_answers_arp_for_its_ip() {
        let mut peer = GatewayPeer::new(GATEWAY_MAC, GATEWAY_IP);

        let request = ArpMessage::request(GUEST_MAC, GUEST_IP, GATEWAY_IP);
        let header = EthernetHeader {
            destination: HardwareAddress::BROADCAST,
            source: GUEST_MAC,
            ethertype: EtherType::ARP,
        };
        let frame = [&header.to_bytes()[..], &request.to_bytes()[..]].concat();

        let replies = peer.on_frame(&frame);
        assert_eq!(replies.len(), 1);
        let (eth, payload) = EthernetHeader::parse(&replies[0]).unwrap();
        assert_eq!(eth.destination, GUEST_MAC);
        assert_eq!(eth.source, GATEWAY_MAC);
        assert_eq!(
            ArpMessage::parse(payload).unwrap(),
            ArpMessage::reply(GATEWAY_MAC, GATEWAY_IP, GUEST_MAC, GUEST_IP)
        );

        // Requests for other addresses and announcements are ignored
        let other = ArpMessage::request(GUEST_MAC, GUEST_IP, Ipv4Addr::new(10, 0, 2, 9));
        let frame = [&header.to_bytes()[..], &other.to_bytes()[..]].concat();
        assert!(peer.on_frame(&frame).is_empty());

        let announce = ArpMessage::announcement(GUEST_MAC, GUEST_IP);
        let frame = [&header.to_bytes()[..], &announce.to_bytes()[..]].concat();
        assert!(peer.on_frame(&frame).is_empty());
    }

    #[test]
    fn test_gateway_echoes_ipv4() {
        let mut peer = GatewayPeer::new(GATEWAY_MAC, GATEWAY_IP);

        let header = EthernetHeader {
            destination: GATEWAY_MAC,
            source: GUEST_MAC,
            ethertype: EtherType::IPV4,
        };
        let mut ip = vec![0u8; 24];
        {
            let mut packet = Ipv4Packet::new_unchecked(&mut ip[..]);
            packet.set_version(4);
            packet.set_header_len(20);
            packet.set_total_len(24);
            packet.set_hop_limit(64);
            packet.set_next_header(smoltcp::wire::IpProtocol::Udp);
            packet.set_src_addr(GUEST_IP);
            packet.set_dst_addr(GATEWAY_IP);
            packet.fill_checksum();
        }
        let frame = [&header.to_bytes()[..], &ip[..]].concat();

        let echoed = peer.on_frame(&frame);
        assert_eq!(echoed.len(), 1);
        let (eth, payload) = EthernetHeader::parse(&echoed[0]).unwrap();
        assert_eq!(eth.destination, GUEST_MAC);
        assert_eq!(eth.source, GATEWAY_MAC);
        let packet = Ipv4Packet::new_checked(payload).unwrap();
        assert_eq!(packet.src_addr(), GATEWAY_IP);
        assert_eq!(packet.dst_addr(), GUEST_IP);
        assert!(packet.verify_checksum());

        // Not addressed to the gateway
        let stray = EthernetHeader {
            destination: HardwareAddress([0x02, 0, 0, 0, 0, 0x42]),
            ..header
        };
        let frame = [&stray.to_bytes()[..], &ip[..]].concat();
        assert!(peer.on_frame(&frame).is_empty());
    }
}
