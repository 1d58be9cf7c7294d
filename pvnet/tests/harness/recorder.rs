//! Dispatchers that record what the link layers hand up

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use pvnet::{EtherType, EthernetDispatcher, HardwareAddress, LinkEndpoint, LinkError, NetworkDispatcher};

/// One packet delivered to the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub link: HardwareAddress,
    pub source: HardwareAddress,
    pub protocol: EtherType,
    pub packet: Vec<u8>,
}

/// Network dispatcher that queues every delivery and resolution failure
pub struct RecordingDispatcher {
    deliveries: (Sender<Delivery>, Receiver<Delivery>),
    failures: (Sender<(Ipv4Addr, usize)>, Receiver<(Ipv4Addr, usize)>),
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deliveries: unbounded(),
            failures: unbounded(),
        })
    }

    pub fn next(&self, timeout: Duration) -> Option<Delivery> {
        self.deliveries.1.recv_timeout(timeout).ok()
    }

    pub fn next_failure(&self, timeout: Duration) -> Option<(Ipv4Addr, usize)> {
        self.failures.1.recv_timeout(timeout).ok()
    }

    pub fn pending(&self) -> usize {
        self.deliveries.1.len()
    }
}

impl NetworkDispatcher for RecordingDispatcher {
    fn deliver_network_packet(
        &self,
        endpoint: &dyn LinkEndpoint,
        source: HardwareAddress,
        protocol: EtherType,
        packet: &[u8],
    ) {
        let _ = self.deliveries.0.send(Delivery {
            link: endpoint.link_address(),
            source,
            protocol,
            packet: packet.to_vec(),
        });
    }

    fn resolution_failed(&self, error: LinkError) {
        if let LinkError::ResolutionFailed { remote, dropped } = error {
            let _ = self.failures.0.send((remote, dropped));
        }
    }
}

/// Ethernet dispatcher that queues raw frames and counts housekeeping ticks
pub struct FrameRecorder {
    frames: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    ticks: AtomicUsize,
}

impl FrameRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: unbounded(),
            ticks: AtomicUsize::new(0),
        })
    }

    pub fn next(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.frames.1.recv_timeout(timeout).ok()
    }

    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl EthernetDispatcher for FrameRecorder {
    fn deliver_ethernet_frame(&self, frame: &[u8]) {
        let _ = self.frames.0.send(frame.to_vec());
    }

    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}
