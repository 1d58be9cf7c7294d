//! Shared descriptor rings
//!
//! One [`SharedRing`] lives in memory both domains can reach. The guest drives
//! it through a [`FrontRing`] (produces requests, consumes responses) and the
//! backend through a [`BackRing`] (consumes requests, produces responses).
//!
//! Indices are free-running `u32` counters compared with wrapping arithmetic;
//! a slot is addressed by `index & (size - 1)`. Request `i` and response `i`
//! share slot `i`, so the front end cannot reuse a slot before it has consumed
//! the response written there.
//!
//! Notification suppression follows the event-index scheme: each side
//! publishes the index at which it wants to be woken (`req_event`,
//! `rsp_event`) and the producer only notifies when a push crosses it.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::hypervisor::GrantRef;

/// RX response status: backend dropped the packet
pub const NETIF_RSP_DROPPED: i16 = -2;
/// Response status: generic error
pub const NETIF_RSP_ERROR: i16 = -1;
/// TX response status: sent
pub const NETIF_RSP_OKAY: i16 = 0;
/// Response status: no payload. RX responses with status `<=` this carry no data.
pub const NETIF_RSP_NULL: i16 = 1;

/// Ring errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring size {0} is not a non-zero power of two")]
    InvalidSize(u32),

    #[error("ring full ({size} slots in flight)")]
    Full { size: u32 },

    #[error("{side} producer index {prod} is more than {size} ahead of consumer {cons}")]
    Overrun {
        side: &'static str,
        prod: u32,
        cons: u32,
        size: u32,
    },

    #[error("slot {index} does not hold the expected {expected}")]
    CorruptSlot { index: u32, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, RingError>;

/// RX request: an empty granted page the backend may fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRequest {
    pub id: u16,
    pub gref: GrantRef,
}

/// RX response: `status` is the received length when positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxResponse {
    pub id: u16,
    pub offset: u16,
    pub flags: u16,
    pub status: i16,
}

/// TX request: `size` bytes at `offset` in the granted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRequest {
    pub gref: GrantRef,
    pub offset: u16,
    pub flags: u16,
    pub id: u16,
    pub size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxResponse {
    pub id: u16,
    pub status: i16,
}

enum Slot<Req, Rsp> {
    Empty,
    Request(Req),
    Response(Rsp),
}

/// The shared page: indices plus slot array.
pub struct SharedRing<Req, Rsp> {
    req_prod: AtomicU32,
    req_event: AtomicU32,
    rsp_prod: AtomicU32,
    rsp_event: AtomicU32,
    slots: Box<[Mutex<Slot<Req, Rsp>>]>,
    mask: u32,
}

pub type RxSharedRing = SharedRing<RxRequest, RxResponse>;
pub type TxSharedRing = SharedRing<TxRequest, TxResponse>;

impl<Req, Rsp> SharedRing<Req, Rsp> {
    pub fn new(size: u32) -> Result<Self> {
        Self::starting_at(size, 0)
    }

    /// Ring whose indices all start at `start` (wrap-around coverage).
    pub(crate) fn starting_at(size: u32, start: u32) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RingError::InvalidSize(size));
        }

        let slots = (0..size).map(|_| Mutex::new(Slot::Empty)).collect();

        Ok(Self {
            req_prod: AtomicU32::new(start),
            req_event: AtomicU32::new(start.wrapping_add(1)),
            rsp_prod: AtomicU32::new(start),
            rsp_event: AtomicU32::new(start.wrapping_add(1)),
            slots,
            mask: size - 1,
        })
    }

    pub fn size(&self) -> u32 {
        self.mask + 1
    }

    fn slot(&self, index: u32) -> std::sync::MutexGuard<'_, Slot<Req, Rsp>> {
        self.slots[(index & self.mask) as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_span(&self, side: &'static str, prod: u32, cons: u32) -> Result<u32> {
        let span = prod.wrapping_sub(cons);
        if span > self.size() {
            return Err(RingError::Overrun {
                side,
                prod,
                cons,
                size: self.size(),
            });
        }
        Ok(span)
    }
}

impl<Req, Rsp> fmt::Debug for SharedRing<Req, Rsp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRing")
            .field("size", &self.size())
            .field("req_prod", &self.req_prod.load(Ordering::Relaxed))
            .field("req_event", &self.req_event.load(Ordering::Relaxed))
            .field("rsp_prod", &self.rsp_prod.load(Ordering::Relaxed))
            .field("rsp_event", &self.rsp_event.load(Ordering::Relaxed))
            .finish()
    }
}

/// Notify iff `event` lies in the half-open range `(old, new]`.
fn need_notify(event: u32, new: u32, old: u32) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

/// Guest side of a ring.
pub struct FrontRing<Req, Rsp> {
    shared: Arc<SharedRing<Req, Rsp>>,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl<Req, Rsp> FrontRing<Req, Rsp> {
    pub fn new(shared: Arc<SharedRing<Req, Rsp>>) -> Self {
        let req_prod_pvt = shared.req_prod.load(Ordering::Acquire);
        let rsp_cons = shared.rsp_prod.load(Ordering::Acquire);
        Self {
            shared,
            req_prod_pvt,
            rsp_cons,
        }
    }

    pub fn size(&self) -> u32 {
        self.shared.size()
    }

    /// Slots not occupied by an outstanding request or unconsumed response
    pub fn free_requests(&self) -> u32 {
        self.size() - self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Stage a request. It is invisible to the backend until `push_requests`.
    pub fn queue_request(&mut self, req: Req) -> Result<()> {
        if self.free_requests() == 0 {
            return Err(RingError::Full { size: self.size() });
        }

        let index = self.req_prod_pvt;
        let mut slot = self.shared.slot(index);
        if !matches!(*slot, Slot::Empty) {
            return Err(RingError::CorruptSlot {
                index,
                expected: "empty slot",
            });
        }
        *slot = Slot::Request(req);
        drop(slot);

        self.req_prod_pvt = index.wrapping_add(1);
        Ok(())
    }

    /// Publish staged requests. Returns true if the backend must be notified.
    pub fn push_requests(&mut self) -> bool {
        let old = self.shared.req_prod.load(Ordering::Relaxed);
        let new = self.req_prod_pvt;
        self.shared.req_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        need_notify(self.shared.req_event.load(Ordering::SeqCst), new, old)
    }

    pub fn unconsumed_responses(&self) -> u32 {
        self.shared
            .rsp_prod
            .load(Ordering::Acquire)
            .wrapping_sub(self.rsp_cons)
    }

    /// True if responses are pending. When none are, re-arm `rsp_event` and
    /// check again so a response published in between is not missed.
    pub fn check_for_responses(&mut self) -> bool {
        if self.unconsumed_responses() > 0 {
            return true;
        }
        self.shared
            .rsp_event
            .store(self.rsp_cons.wrapping_add(1), Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.unconsumed_responses() > 0
    }

    /// Consume the oldest published response.
    pub fn next_response(&mut self) -> Result<Option<Rsp>> {
        let prod = self.shared.rsp_prod.load(Ordering::Acquire);
        if self.shared.check_span("response", prod, self.rsp_cons)? == 0 {
            return Ok(None);
        }

        let index = self.rsp_cons;
        let mut slot = self.shared.slot(index);
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Response(rsp) => {
                self.rsp_cons = index.wrapping_add(1);
                Ok(Some(rsp))
            }
            other => {
                *slot = other;
                Err(RingError::CorruptSlot {
                    index,
                    expected: "response",
                })
            }
        }
    }
}

/// Backend side of a ring.
pub struct BackRing<Req, Rsp> {
    shared: Arc<SharedRing<Req, Rsp>>,
    rsp_prod_pvt: u32,
    req_cons: u32,
}

impl<Req, Rsp> BackRing<Req, Rsp> {
    pub fn new(shared: Arc<SharedRing<Req, Rsp>>) -> Self {
        let rsp_prod_pvt = shared.rsp_prod.load(Ordering::Acquire);
        let req_cons = shared.req_prod.load(Ordering::Acquire);
        Self {
            shared,
            rsp_prod_pvt,
            req_cons,
        }
    }

    pub fn size(&self) -> u32 {
        self.shared.size()
    }

    pub fn unconsumed_requests(&self) -> u32 {
        self.shared
            .req_prod
            .load(Ordering::Acquire)
            .wrapping_sub(self.req_cons)
    }

    /// Requests consumed but not yet answered
    pub fn outstanding(&self) -> u32 {
        self.req_cons.wrapping_sub(self.rsp_prod_pvt)
    }

    pub fn next_request(&mut self) -> Result<Option<Req>> {
        let prod = self.shared.req_prod.load(Ordering::Acquire);
        if self.shared.check_span("request", prod, self.req_cons)? == 0 {
            return Ok(None);
        }

        let index = self.req_cons;
        let mut slot = self.shared.slot(index);
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Request(req) => {
                self.req_cons = index.wrapping_add(1);
                Ok(Some(req))
            }
            other => {
                *slot = other;
                Err(RingError::CorruptSlot {
                    index,
                    expected: "request",
                })
            }
        }
    }

    /// Stage a response to the oldest unanswered request.
    pub fn queue_response(&mut self, rsp: Rsp) -> Result<()> {
        if self.outstanding() == 0 {
            return Err(RingError::Full { size: self.size() });
        }

        let index = self.rsp_prod_pvt;
        let mut slot = self.shared.slot(index);
        if !matches!(*slot, Slot::Empty) {
            return Err(RingError::CorruptSlot {
                index,
                expected: "empty slot",
            });
        }
        *slot = Slot::Response(rsp);
        drop(slot);

        self.rsp_prod_pvt = index.wrapping_add(1);
        Ok(())
    }

    /// Publish staged responses. Returns true if the front end must be notified.
    pub fn push_responses(&mut self) -> bool {
        let old = self.shared.rsp_prod.load(Ordering::Relaxed);
        let new = self.rsp_prod_pvt;
        self.shared.rsp_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        need_notify(self.shared.rsp_event.load(Ordering::SeqCst), new, old)
    }

    /// Counterpart of [`FrontRing::check_for_responses`] for requests.
    pub fn final_check_for_requests(&mut self) -> bool {
        if self.unconsumed_requests() > 0 {
            return true;
        }
        self.shared
            .req_event
            .store(self.req_cons.wrapping_add(1), Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.unconsumed_requests() > 0
    }
}
