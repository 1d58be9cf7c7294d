//! Front-end network device
//!
//! Owns the RX and TX front rings, one buffer pool per direction and the
//! event channel shared with the backend.
//!
//! ## Grant lifecycle
//!
//! A buffer is granted to the backend exactly while a ring request references
//! it:
//!
//! ```text
//! TX:  acquire -> write frame -> grant (read-only) -> request
//!      response -> end grant -> release
//! RX:  acquire -> grant (writable) -> request
//!      response -> end grant -> copy out -> release -> refill
//! ```
//!
//! ## Receive loop
//!
//! `attach` starts a dedicated thread that alternates between two states:
//! - Idle: blocked in `EventChannel::wait` until the next housekeeping
//!   deadline. Each deadline runs the dispatcher's `tick`, whether the wait
//!   ended by timeout or by a notification.
//! - Draining: consume every RX and TX response, refill RX, then re-arm both
//!   rings. Repeats until neither ring reports pending work.
//!
//! Frames are delivered to the dispatcher without holding the RX lock, so the
//! dispatcher may transmit from the callback.

use std::net::Ipv4Addr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{Buffer, BufferPool, PoolError};
use crate::config::Config;
use crate::endpoint::{EthernetDispatcher, EthernetLink, LinkError};
use crate::evtchn::EventChannel;
use crate::hypervisor::{DomainId, GrantTable, HypervisorError, PAGE_SIZE};
use crate::ring::{
    FrontRing, NETIF_RSP_NULL, NETIF_RSP_OKAY, RingError, RxRequest, RxResponse, RxSharedRing,
    TxRequest, TxResponse, TxSharedRing,
};
use crate::wire::HardwareAddress;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Frame too large: {len} bytes exceeds {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Device already attached")]
    AlreadyAttached,

    #[error("Invalid device configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Receive loop panicked")]
    LoopPanicked,
}

impl DeviceError {
    /// Whether the device can no longer move frames.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::TransportFailed(_)
                | DeviceError::LoopPanicked
                | DeviceError::Ring(RingError::Overrun { .. } | RingError::CorruptSlot { .. })
        )
    }

    /// Copy of a loop-terminating error for the fatal channel.
    fn duplicate(&self) -> DeviceError {
        match self {
            DeviceError::TransportFailed(reason) => DeviceError::TransportFailed(reason.clone()),
            DeviceError::LoopPanicked => DeviceError::LoopPanicked,
            DeviceError::Ring(e) => DeviceError::Ring(e.clone()),
            other => DeviceError::TransportFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// How often a blocked sender re-checks the TX ring for completions
const TX_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Everything the hypervisor hands the front end at setup.
pub struct DeviceResources {
    pub backend_domain: DomainId,
    pub grant_table: Arc<dyn GrantTable>,
    pub event_channel: Arc<dyn EventChannel>,
    pub rx_ring: Arc<RxSharedRing>,
    pub tx_ring: Arc<TxSharedRing>,
}

/// Snapshot of where every buffer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAccounting {
    pub rx_free: usize,
    pub rx_in_flight: usize,
    pub tx_free: usize,
    pub tx_in_flight: usize,
}

/// Buffers referenced by live ring requests, indexed by buffer id.
struct InFlight(Vec<Option<Buffer>>);

impl InFlight {
    fn new(capacity: usize) -> Self {
        Self((0..capacity).map(|_| None).collect())
    }

    fn insert(&mut self, buffer: Buffer) {
        let id = buffer.id() as usize;
        self.0[id] = Some(buffer);
    }

    fn take(&mut self, id: u16) -> Option<Buffer> {
        self.0.get_mut(id as usize).and_then(Option::take)
    }

    fn len(&self) -> usize {
        self.0.iter().filter(|b| b.is_some()).count()
    }
}

struct RxPath {
    ring: FrontRing<RxRequest, RxResponse>,
    in_flight: InFlight,
    /// Consecutive refills that stopped on a grant failure
    failed_refills: u32,
}

struct TxPath {
    ring: FrontRing<TxRequest, TxResponse>,
    in_flight: InFlight,
}

enum Refill {
    Complete,
    Stalled(HypervisorError),
}

struct Shared {
    mac: HardwareAddress,
    ip: Ipv4Addr,
    backend_domain: DomainId,
    grants: Arc<dyn GrantTable>,
    events: Arc<dyn EventChannel>,
    rx: Mutex<RxPath>,
    tx: Mutex<TxPath>,
    rx_pool: BufferPool,
    tx_pool: BufferPool,
    tx_acquire_timeout: Option<Duration>,
    housekeeping_interval: Duration,
    grant_retry_limit: u32,
    shutdown: AtomicBool,
    fatal_tx: Sender<DeviceError>,
    fatal_rx: Receiver<DeviceError>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Paravirtualized network device, front-end half.
pub struct Device {
    inner: Arc<Shared>,
    attached: AtomicBool,
    receive_loop: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Device {
    /// Build the device and hand every RX buffer to the backend.
    pub fn new(config: &Config, resources: DeviceResources) -> Result<Self> {
        let dev = &config.device;
        dev.validate()
            .map_err(|e| DeviceError::InvalidConfig(e.to_string()))?;

        let rx_size = resources.rx_ring.size();
        let tx_size = resources.tx_ring.size();
        if dev.rx_buffers as u32 > rx_size || dev.tx_buffers as u32 > tx_size {
            return Err(DeviceError::InvalidConfig(format!(
                "buffers (rx {}, tx {}) exceed ring sizes (rx {rx_size}, tx {tx_size})",
                dev.rx_buffers, dev.tx_buffers
            )));
        }

        let (fatal_tx, fatal_rx) = unbounded();

        let inner = Arc::new(Shared {
            mac: config.interface.mac,
            ip: config.interface.ip,
            backend_domain: resources.backend_domain,
            grants: resources.grant_table,
            events: resources.event_channel,
            rx: Mutex::new(RxPath {
                ring: FrontRing::new(resources.rx_ring),
                in_flight: InFlight::new(dev.rx_buffers as usize),
                failed_refills: 0,
            }),
            tx: Mutex::new(TxPath {
                ring: FrontRing::new(resources.tx_ring),
                in_flight: InFlight::new(dev.tx_buffers as usize),
            }),
            rx_pool: BufferPool::new("rx", dev.rx_buffers),
            tx_pool: BufferPool::new("tx", dev.tx_buffers),
            tx_acquire_timeout: dev.tx_acquire_timeout(),
            housekeeping_interval: dev.housekeeping_interval(),
            grant_retry_limit: dev.grant_retry_limit,
            shutdown: AtomicBool::new(false),
            fatal_tx,
            fatal_rx,
        });

        {
            let mut rx = lock(&inner.rx);
            if let Refill::Stalled(e) = inner.refill_rx(&mut rx)? {
                return Err(e.into());
            }
        }

        info!(
            mac = %inner.mac,
            ip = %inner.ip,
            backend = %inner.backend_domain,
            rx_buffers = dev.rx_buffers,
            tx_buffers = dev.tx_buffers,
            "Network device initialized"
        );

        Ok(Self {
            inner,
            attached: AtomicBool::new(false),
            receive_loop: Mutex::new(None),
        })
    }

    pub fn mac(&self) -> HardwareAddress {
        self.inner.mac
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.inner.ip
    }

    /// Transmit one frame gathered from `parts`.
    pub fn send_frame(&self, parts: &[&[u8]]) -> Result<()> {
        self.inner.send_frame(parts)
    }

    /// Start the receive loop. Only the first call succeeds.
    pub fn attach(&self, dispatcher: Arc<dyn EthernetDispatcher>) -> Result<()> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::AlreadyAttached);
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("pvnet-rx".to_string())
            .spawn(move || inner.run(dispatcher))
            .map_err(|e| DeviceError::TransportFailed(format!("spawn receive loop: {e}")))?;

        *lock(&self.receive_loop) = Some(handle);
        Ok(())
    }

    /// Stop the receive loop and return how it ended.
    pub fn shutdown(&self) -> Result<()> {
        let Some(handle) = lock(&self.receive_loop).take() else {
            return Ok(());
        };

        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.events.wake_local()?;

        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(DeviceError::LoopPanicked),
        }
    }

    /// Fatal errors raised by the receive loop.
    pub fn fatal_errors(&self) -> Receiver<DeviceError> {
        self.inner.fatal_rx.clone()
    }

    pub fn buffer_accounting(&self) -> BufferAccounting {
        let rx_in_flight = lock(&self.inner.rx).in_flight.len();
        let tx_in_flight = lock(&self.inner.tx).in_flight.len();
        BufferAccounting {
            rx_free: self.inner.rx_pool.available(),
            rx_in_flight,
            tx_free: self.inner.tx_pool.available(),
            tx_in_flight,
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let handle = lock(&self.receive_loop).take();
        if let Some(handle) = handle {
            self.inner.shutdown.store(true, Ordering::SeqCst);
            let _ = self.inner.events.wake_local();
            // The loop thread itself may drop the last reference
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl EthernetLink for Device {
    fn hardware_address(&self) -> HardwareAddress {
        self.inner.mac
    }

    fn write_ethernet_frame(&self, parts: &[&[u8]]) -> std::result::Result<(), LinkError> {
        Ok(self.send_frame(parts)?)
    }

    fn attach(&self, dispatcher: Arc<dyn EthernetDispatcher>) -> std::result::Result<(), LinkError> {
        match Device::attach(self, dispatcher) {
            Err(DeviceError::AlreadyAttached) => Err(LinkError::AlreadyAttached),
            other => Ok(other?),
        }
    }

    fn detach(&self) -> std::result::Result<(), LinkError> {
        Ok(self.shutdown()?)
    }
}

impl Shared {
    fn send_frame(&self, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > PAGE_SIZE {
            return Err(DeviceError::FrameTooLarge {
                len,
                max: PAGE_SIZE,
            });
        }

        let buffer = match self.tx_pool.try_acquire() {
            Some(buffer) => buffer,
            None => self.acquire_tx()?,
        };

        self.submit_tx(buffer, parts, len as u16)
    }

    /// Wait for a TX buffer, reaping completions ourselves while waiting. The
    /// caller may be the receive loop's own dispatcher, in which case nobody
    /// else would reap.
    fn acquire_tx(&self) -> Result<Buffer> {
        let deadline = self.tx_acquire_timeout.map(|t| Instant::now() + t);

        loop {
            self.reap_tx()?;
            if let Some(buffer) = self.tx_pool.try_acquire() {
                return Ok(buffer);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Exhausted {
                            pool: self.tx_pool.name(),
                            waited: self.tx_acquire_timeout,
                        }
                        .into());
                    }
                    (deadline - now).min(TX_REAP_INTERVAL)
                }
                None => TX_REAP_INTERVAL,
            };

            if let Ok(buffer) = self.tx_pool.acquire(Some(slice)) {
                return Ok(buffer);
            }
        }
    }

    fn submit_tx(&self, mut buffer: Buffer, parts: &[&[u8]], len: u16) -> Result<()> {
        if let Err(e) = buffer.frame().write_parts(0, parts) {
            self.tx_pool.release(buffer);
            return Err(e.into());
        }

        let gref = match self
            .grants
            .grant_access(self.backend_domain, buffer.frame(), true)
        {
            Ok(gref) => gref,
            Err(e) => {
                self.tx_pool.release(buffer);
                return Err(e.into());
            }
        };
        buffer.set_grant(gref);

        let request = TxRequest {
            gref,
            offset: 0,
            flags: 0,
            id: buffer.id(),
            size: len,
        };

        let notify = {
            let mut tx = lock(&self.tx);
            if let Err(e) = tx.ring.queue_request(request) {
                drop(tx);
                self.end_grant(&mut buffer);
                self.tx_pool.release(buffer);
                return Err(e.into());
            }
            tx.in_flight.insert(buffer);
            tx.ring.push_requests()
        };

        trace!(id = request.id, %gref, len, "TX request queued");

        if notify {
            self.events.notify()?;
        }
        Ok(())
    }

    /// Return completed TX buffers to the pool.
    fn reap_tx(&self) -> Result<usize> {
        let mut tx = lock(&self.tx);
        let mut reaped = 0;

        while let Some(rsp) = tx.ring.next_response()? {
            let Some(mut buffer) = tx.in_flight.take(rsp.id) else {
                warn!(id = rsp.id, "TX response for unknown buffer");
                continue;
            };
            if rsp.status != NETIF_RSP_OKAY {
                debug!(id = rsp.id, status = rsp.status, "TX not sent by backend");
            }
            self.end_grant(&mut buffer);
            self.tx_pool.release(buffer);
            reaped += 1;
        }

        Ok(reaped)
    }

    /// Consume RX responses, returning the payloads to deliver.
    fn collect_rx(&self, rx: &mut RxPath) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();

        while let Some(rsp) = rx.ring.next_response()? {
            let Some(mut buffer) = rx.in_flight.take(rsp.id) else {
                warn!(id = rsp.id, "RX response for unknown buffer");
                continue;
            };
            self.end_grant(&mut buffer);

            if rsp.status <= NETIF_RSP_NULL {
                debug!(id = rsp.id, status = rsp.status, "RX null response");
            } else {
                let offset = rsp.offset as usize;
                let len = rsp.status as usize;
                if offset + len > PAGE_SIZE {
                    warn!(id = rsp.id, offset, len, "RX response exceeds page");
                } else {
                    frames.push(buffer.frame().to_vec(offset, len)?);
                }
            }

            self.rx_pool.release(buffer);
        }

        Ok(frames)
    }

    /// Grant and submit every free RX buffer, then push and notify.
    fn refill_rx(&self, rx: &mut RxPath) -> Result<Refill> {
        let mut outcome = Refill::Complete;

        while let Some(mut buffer) = self.rx_pool.try_acquire() {
            let gref = match self
                .grants
                .grant_access(self.backend_domain, buffer.frame(), false)
            {
                Ok(gref) => gref,
                Err(e) => {
                    self.rx_pool.release(buffer);
                    outcome = Refill::Stalled(e);
                    break;
                }
            };
            buffer.set_grant(gref);

            let request = RxRequest {
                id: buffer.id(),
                gref,
            };
            if let Err(e) = rx.ring.queue_request(request) {
                self.end_grant(&mut buffer);
                self.rx_pool.release(buffer);
                return Err(e.into());
            }
            rx.in_flight.insert(buffer);
        }

        if rx.ring.push_requests() {
            self.events.notify()?;
        }
        Ok(outcome)
    }

    fn end_grant(&self, buffer: &mut Buffer) {
        if let Some(gref) = buffer.take_grant()
            && let Err(e) = self.grants.end_access(gref)
        {
            warn!(id = buffer.id(), %gref, error = %e, "Failed to end grant");
        }
    }

    fn run(&self, dispatcher: Arc<dyn EthernetDispatcher>) -> Result<()> {
        info!(mac = %self.mac, "Receive loop started");

        let result = match catch_unwind(AssertUnwindSafe(|| self.receive_loop(&*dispatcher))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => Err(DeviceError::TransportFailed(e.to_string())),
            Err(_) => Err(DeviceError::LoopPanicked),
        };

        match &result {
            Ok(()) => info!("Receive loop stopped"),
            Err(e) => {
                error!(error = %e, "Receive loop failed");
                let _ = self.fatal_tx.send(e.duplicate());
            }
        }
        result
    }

    fn receive_loop(&self, dispatcher: &dyn EthernetDispatcher) -> Result<()> {
        let mut next_tick = Instant::now() + self.housekeeping_interval;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            let until_tick = next_tick.saturating_duration_since(Instant::now());
            self.events.wait(Some(until_tick))?;
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            self.drain(dispatcher)?;

            // Runs on schedule even while notifications keep arriving
            let now = Instant::now();
            if now >= next_tick {
                dispatcher.tick();
                next_tick = now + self.housekeeping_interval;
            }
        }
    }

    fn drain(&self, dispatcher: &dyn EthernetDispatcher) -> Result<()> {
        loop {
            let frames = {
                let mut rx = lock(&self.rx);
                let frames = self.collect_rx(&mut rx)?;
                self.check_refill(&mut rx)?;
                frames
            };

            for frame in &frames {
                trace!(len = frame.len(), "RX frame");
                dispatcher.deliver_ethernet_frame(frame);
            }

            self.reap_tx()?;

            let rx_pending = lock(&self.rx).ring.check_for_responses();
            let tx_pending = lock(&self.tx).ring.check_for_responses();
            if !rx_pending && !tx_pending {
                return Ok(());
            }
        }
    }

    /// Refill RX, tolerating up to `grant_retry_limit` consecutive stalls.
    fn check_refill(&self, rx: &mut RxPath) -> Result<()> {
        match self.refill_rx(rx)? {
            Refill::Complete => {
                rx.failed_refills = 0;
                Ok(())
            }
            Refill::Stalled(e) => {
                rx.failed_refills += 1;
                if rx.failed_refills > self.grant_retry_limit {
                    return Err(DeviceError::TransportFailed(format!(
                        "RX refill failed {} consecutive times: {e}",
                        rx.failed_refills
                    )));
                }
                warn!(
                    attempt = rx.failed_refills,
                    limit = self.grant_retry_limit,
                    error = %e,
                    "RX refill stalled, retrying next cycle"
                );
                Ok(())
            }
        }
    }
}
