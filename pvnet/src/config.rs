//! Runtime configuration
//!
//! Loaded from a JSON file; every field has a default so a partial (or empty)
//! document is valid.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hypervisor::DomainId;
use crate::wire::HardwareAddress;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interface: InterfaceConfig,
    pub device: DeviceConfig,
    pub arp: ArpConfig,
}

/// Identity of the guest interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    pub mac: HardwareAddress,
    pub ip: Ipv4Addr,
    /// Domain running the backend half of the device
    pub backend_domain: u16,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            mac: HardwareAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            ip: Ipv4Addr::new(10, 0, 2, 20),
            backend_domain: 0,
        }
    }
}

impl InterfaceConfig {
    pub fn backend_domain(&self) -> DomainId {
        DomainId(self.backend_domain)
    }
}

/// Transport device tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Slots per ring (power of two)
    pub ring_size: u32,
    pub rx_buffers: u16,
    pub tx_buffers: u16,
    /// How long `send_frame` waits for a free TX buffer; `None` waits forever
    pub tx_acquire_timeout_ms: Option<u64>,
    /// Consecutive failed RX refills tolerated before the device gives up
    pub grant_retry_limit: u32,
    /// Idle wait before the receive loop runs housekeeping
    pub housekeeping_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ring_size: 256,
            rx_buffers: 256,
            tx_buffers: 256,
            tx_acquire_timeout_ms: Some(1000),
            grant_retry_limit: 8,
            housekeeping_interval_ms: 1000,
        }
    }
}

impl DeviceConfig {
    pub fn tx_acquire_timeout(&self) -> Option<Duration> {
        self.tx_acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

/// Address resolution tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArpConfig {
    /// Cache entry lifetime since last update; `None` never evicts
    pub cache_ttl_secs: Option<u64>,
    /// How long queued packets wait for a reply; `None` waits forever
    pub resolution_timeout_ms: Option<u64>,
    pub max_pending_per_target: usize,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: Some(300),
            resolution_timeout_ms: Some(3000),
            max_pending_per_target: 64,
        }
    }
}

impl ArpConfig {
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    pub fn resolution_timeout(&self) -> Option<Duration> {
        self.resolution_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;

        if self.arp.max_pending_per_target == 0 {
            return Err(ConfigError::Invalid(
                "arp.max_pending_per_target must be at least 1".into(),
            ));
        }
        if self.interface.mac.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "interface.mac {} is a multicast address",
                self.interface.mac
            )));
        }
        Ok(())
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = self;
        if d.ring_size == 0 || !d.ring_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "device.ring_size {} is not a power of two",
                d.ring_size
            )));
        }
        for (name, count) in [("rx_buffers", d.rx_buffers), ("tx_buffers", d.tx_buffers)] {
            if count == 0 {
                return Err(ConfigError::Invalid(format!("device.{name} must be at least 1")));
            }
            if count as u32 > d.ring_size {
                return Err(ConfigError::Invalid(format!(
                    "device.{name} {count} exceeds ring_size {}",
                    d.ring_size
                )));
            }
        }
        if d.housekeeping_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "device.housekeeping_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
