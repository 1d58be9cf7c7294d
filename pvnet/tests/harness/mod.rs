//! Test harness for loopback integration tests
//!
//! Wires a device and link over the in-process netback.

#![allow(dead_code)]

pub mod packets;
pub mod recorder;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pvnet::loopback::{LoopbackNetback, Peer};
use pvnet::{Config, Device, EtharpLink, LinkEndpoint};

pub use recorder::{Delivery, FrameRecorder, RecordingDispatcher};

pub const GUEST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 20);
pub const GATEWAY_MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 1);

/// How long tests wait for an expected frame
pub const WAIT: Duration = Duration::from_secs(2);

/// Small rings and a short housekeeping interval
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.device.ring_size = 16;
    config.device.rx_buffers = 16;
    config.device.tx_buffers = 16;
    config.device.housekeeping_interval_ms = 20;
    config.device.tx_acquire_timeout_ms = Some(500);
    config
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Device + link + netback, attached to a recording dispatcher
pub struct Stack {
    pub netback: LoopbackNetback,
    pub device: Arc<Device>,
    pub link: Arc<EtharpLink<Device>>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

impl Stack {
    pub fn start(config: &Config, peer: Option<Box<dyn Peer>>) -> Self {
        let (netback, resources) = LoopbackNetback::new(config, peer).expect("start netback");
        let device = Arc::new(Device::new(config, resources).expect("create device"));
        let link = EtharpLink::new(config.interface.ip, device.clone(), &config.arp);
        let dispatcher = RecordingDispatcher::new();
        link.attach(dispatcher.clone()).expect("attach link");

        Self {
            netback,
            device,
            link,
            dispatcher,
        }
    }

    /// Next frame the guest put on the wire
    pub fn transmitted(&self) -> Vec<u8> {
        self.netback
            .transmitted()
            .recv_timeout(WAIT)
            .expect("expected a transmitted frame")
    }

    /// Assert nothing further is transmitted within `window`
    pub fn assert_quiet(&self, window: Duration) {
        if let Ok(frame) = self.netback.transmitted().recv_timeout(window) {
            panic!("unexpected frame transmitted: {frame:02x?}");
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let _ = self.link.shutdown();
    }
}
