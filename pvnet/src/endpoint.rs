//! Link-layer capability interfaces
//!
//! Two layers meet here:
//! - [`EthernetLink`] / [`EthernetDispatcher`]: raw Ethernet frames between the
//!   transport device and the Ethernet/ARP layer.
//! - [`LinkEndpoint`] / [`NetworkDispatcher`]: network-layer packets between the
//!   Ethernet/ARP layer and the IP stack.

use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;

use crate::device::DeviceError;
use crate::wire::{EtherType, HardwareAddress};

/// Link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Packet too large: {len} bytes exceeds MTU {mtu}")]
    PacketTooLarge { len: usize, mtu: usize },

    #[error("Link already attached")]
    AlreadyAttached,

    #[error("Address resolution for {remote} timed out, {dropped} packet(s) dropped")]
    ResolutionFailed { remote: Ipv4Addr, dropped: usize },
}

/// Addressing of one outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub local_address: Ipv4Addr,
    /// Next hop whose hardware address is resolved
    pub remote_address: Ipv4Addr,
}

impl Route {
    pub fn new(local_address: Ipv4Addr, remote_address: Ipv4Addr) -> Self {
        Self {
            local_address,
            remote_address,
        }
    }
}

/// What a network stack sees of one interface.
pub trait LinkEndpoint: Send + Sync {
    /// Largest network-layer payload
    fn mtu(&self) -> usize;

    /// Bytes of link header prepended to every packet
    fn max_header_length(&self) -> usize;

    fn link_address(&self) -> HardwareAddress;

    /// Send `header` followed by `payload` to `route.remote_address`.
    fn write_packet(
        &self,
        route: &Route,
        header: &[u8],
        payload: &[u8],
        protocol: EtherType,
    ) -> Result<(), LinkError>;

    /// Start delivering inbound packets to `dispatcher`.
    fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>) -> Result<(), LinkError>;
}

/// Receives network-layer packets from a link endpoint.
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(
        &self,
        endpoint: &dyn LinkEndpoint,
        source: HardwareAddress,
        protocol: EtherType,
        packet: &[u8],
    );

    /// Queued packets were dropped because their next hop never resolved.
    fn resolution_failed(&self, _error: LinkError) {}
}

/// A device that sends and receives whole Ethernet frames.
pub trait EthernetLink: Send + Sync {
    fn hardware_address(&self) -> HardwareAddress;

    /// Send one frame gathered from `parts`.
    fn write_ethernet_frame(&self, parts: &[&[u8]]) -> Result<(), LinkError>;

    /// Start delivering inbound frames to `dispatcher`.
    fn attach(&self, dispatcher: Arc<dyn EthernetDispatcher>) -> Result<(), LinkError>;

    /// Stop delivering frames.
    fn detach(&self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Receives raw Ethernet frames from a device.
pub trait EthernetDispatcher: Send + Sync {
    fn deliver_ethernet_frame(&self, frame: &[u8]);

    /// Periodic housekeeping while the link is idle.
    fn tick(&self) {}
}
