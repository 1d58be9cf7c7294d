//! Link layer of a paravirtualized guest network stack.
//!
//! The [`device`] drives the front-end half of a split network device over
//! shared descriptor rings; the [`link`] layer on top speaks Ethernet and
//! resolves IPv4 next hops with ARP. [`loopback`] simulates the backend so
//! the whole path runs in one process.

pub mod arp;
pub mod buffer;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod evtchn;
pub mod hypervisor;
pub mod link;
pub mod loopback;
pub mod ring;
pub mod wire;

pub use config::Config;
pub use device::{Device, DeviceError, DeviceResources};
pub use endpoint::{
    EthernetDispatcher, EthernetLink, LinkEndpoint, LinkError, NetworkDispatcher, Route,
};
pub use link::EtharpLink;
pub use wire::{EtherType, HardwareAddress};
