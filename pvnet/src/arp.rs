//! Address resolution cache and pending transmit queue
//!
//! The cache and the per-target pending queues share one lock, so "look up or
//! enqueue" on the transmit path and "learn and drain" on the receive path can
//! never interleave: a packet queued for a target is either drained by the
//! reply that resolves it, or sees the fresh cache entry and is sent directly.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ArpConfig;
use crate::endpoint::Route;
use crate::wire::{EtherType, HardwareAddress};

/// A network-layer packet waiting for its next hop to resolve. Owns copies
/// of the caller's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPacket {
    pub route: Route,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    pub protocol: EtherType,
}

impl PendingPacket {
    pub fn new(route: &Route, header: &[u8], payload: &[u8], protocol: EtherType) -> Self {
        Self {
            route: *route,
            header: header.to_vec(),
            payload: payload.to_vec(),
            protocol,
        }
    }
}

/// Outcome of [`ArpTable::resolve_or_enqueue`].
#[derive(Debug)]
pub enum Resolution {
    Resolved(HardwareAddress),
    /// Packet queued. `displaced` is the oldest packet, dropped to stay
    /// within the per-target bound.
    Queued { displaced: Option<PendingPacket> },
}

/// Result of one expiry sweep.
#[derive(Debug, Default)]
pub struct Expired {
    pub evicted: usize,
    /// Targets whose resolution timed out, with the packets dropped
    pub failed: Vec<(Ipv4Addr, Vec<PendingPacket>)>,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    hardware: HardwareAddress,
    updated: Instant,
}

#[derive(Debug)]
struct PendingQueue {
    packets: VecDeque<PendingPacket>,
    since: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    cache: HashMap<Ipv4Addr, CacheEntry>,
    pending: HashMap<Ipv4Addr, PendingQueue>,
}

/// IPv4 to hardware address resolution state.
#[derive(Debug)]
pub struct ArpTable {
    tables: Mutex<Tables>,
    cache_ttl: Option<Duration>,
    resolution_timeout: Option<Duration>,
    max_pending: usize,
}

impl ArpTable {
    pub fn new(
        cache_ttl: Option<Duration>,
        resolution_timeout: Option<Duration>,
        max_pending: usize,
    ) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            cache_ttl,
            resolution_timeout,
            max_pending: max_pending.max(1),
        }
    }

    pub fn from_config(config: &ArpConfig) -> Self {
        Self::new(
            config.cache_ttl(),
            config.resolution_timeout(),
            config.max_pending_per_target,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, entry: &CacheEntry, now: Instant) -> bool {
        match self.cache_ttl {
            Some(ttl) => now.saturating_duration_since(entry.updated) > ttl,
            None => false,
        }
    }

    fn fresh(&self, tables: &Tables, ip: Ipv4Addr, now: Instant) -> Option<HardwareAddress> {
        tables
            .cache
            .get(&ip)
            .filter(|entry| !self.is_stale(entry, now))
            .map(|entry| entry.hardware)
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<HardwareAddress> {
        let tables = self.lock();
        self.fresh(&tables, ip, Instant::now())
    }

    /// Resolve `ip`, or queue the packet built by `packet` until it resolves.
    pub fn resolve_or_enqueue(
        &self,
        ip: Ipv4Addr,
        packet: impl FnOnce() -> PendingPacket,
    ) -> Resolution {
        let now = Instant::now();
        let mut tables = self.lock();

        if let Some(hardware) = self.fresh(&tables, ip, now) {
            return Resolution::Resolved(hardware);
        }

        let queue = tables.pending.entry(ip).or_insert_with(|| PendingQueue {
            packets: VecDeque::new(),
            since: now,
        });

        let displaced = if queue.packets.len() >= self.max_pending {
            queue.packets.pop_front()
        } else {
            None
        };
        queue.packets.push_back(packet());

        Resolution::Queued { displaced }
    }

    /// Insert or refresh a mapping.
    pub fn learn(&self, ip: Ipv4Addr, hardware: HardwareAddress) {
        let mut tables = self.lock();
        Self::upsert(&mut tables, ip, hardware);
    }

    /// Insert or refresh a mapping and take every packet queued for `ip`, in
    /// the order they were queued.
    pub fn learn_and_take_pending(
        &self,
        ip: Ipv4Addr,
        hardware: HardwareAddress,
    ) -> Vec<PendingPacket> {
        let mut tables = self.lock();
        Self::upsert(&mut tables, ip, hardware);
        tables
            .pending
            .remove(&ip)
            .map(|queue| queue.packets.into())
            .unwrap_or_default()
    }

    fn upsert(tables: &mut Tables, ip: Ipv4Addr, hardware: HardwareAddress) {
        let entry = CacheEntry {
            hardware,
            updated: Instant::now(),
        };
        if let Some(old) = tables.cache.insert(ip, entry)
            && old.hardware != hardware
        {
            debug!(%ip, old = %old.hardware, new = %hardware, "ARP entry changed");
        }
    }

    /// Packets queued for `ip`
    pub fn pending_len(&self, ip: Ipv4Addr) -> usize {
        self.lock()
            .pending
            .get(&ip)
            .map_or(0, |queue| queue.packets.len())
    }

    /// Entries in the cache, stale ones included until the next sweep
    pub fn cache_len(&self) -> usize {
        self.lock().cache.len()
    }

    /// Drop cache entries older than the TTL and pending queues older than the
    /// resolution timeout.
    pub fn expire(&self, now: Instant) -> Expired {
        let mut tables = self.lock();
        let mut expired = Expired::default();

        if self.cache_ttl.is_some() {
            let before = tables.cache.len();
            tables.cache.retain(|_, entry| !self.is_stale(entry, now));
            expired.evicted = before - tables.cache.len();
        }

        if let Some(timeout) = self.resolution_timeout {
            let timed_out: Vec<Ipv4Addr> = tables
                .pending
                .iter()
                .filter(|(_, queue)| now.saturating_duration_since(queue.since) > timeout)
                .map(|(ip, _)| *ip)
                .collect();

            for ip in timed_out {
                if let Some(queue) = tables.pending.remove(&ip) {
                    expired.failed.push((ip, queue.packets.into()));
                }
            }
        }

        expired
    }
}
