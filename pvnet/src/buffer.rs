//! Page-backed buffer pool for ring I/O
//!
//! Every buffer is one shared page. A buffer is owned by exactly one place at
//! a time: the pool's free list, or the device's in-flight table while a ring
//! slot references it. Ownership moves with the value, so a buffer cannot be
//! handed out twice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::hypervisor::{GrantRef, PageFrame};

/// Guest frame numbers are unique across all pools in the process.
static NEXT_FRAME: AtomicU64 = AtomicU64::new(0x1000);

/// Buffer pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("{pool} pool exhausted after waiting {waited:?}")]
    Exhausted {
        pool: &'static str,
        waited: Option<Duration>,
    },
}

/// A page-backed buffer.
pub struct Buffer {
    id: u16,
    frame: PageFrame,
    grant: Option<GrantRef>,
}

impl Buffer {
    /// Pool-local id, also used as the ring request id
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn frame(&self) -> &PageFrame {
        &self.frame
    }

    /// Grant currently held by the backend, if any
    pub fn grant(&self) -> Option<GrantRef> {
        self.grant
    }

    pub fn set_grant(&mut self, gref: GrantRef) {
        self.grant = Some(gref);
    }

    pub fn take_grant(&mut self) -> Option<GrantRef> {
        self.grant.take()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("frame", &self.frame.number())
            .field("grant", &self.grant)
            .finish()
    }
}

/// Fixed-size pool of page-backed buffers.
pub struct BufferPool {
    name: &'static str,
    capacity: usize,
    free_tx: Sender<Buffer>,
    free_rx: Receiver<Buffer>,
}

impl BufferPool {
    /// Create a pool of `count` buffers with ids `0..count`.
    pub fn new(name: &'static str, count: u16) -> Self {
        let capacity = count as usize;
        let (free_tx, free_rx) = bounded(capacity);

        for id in 0..count {
            let frame = PageFrame::new(NEXT_FRAME.fetch_add(1, Ordering::Relaxed));
            // Cannot fail: the channel holds exactly `count` buffers
            let _ = free_tx.try_send(Buffer {
                id,
                frame,
                grant: None,
            });
        }

        debug!(pool = name, buffers = capacity, "Buffer pool created");

        Self {
            name,
            capacity,
            free_tx,
            free_rx,
        }
    }

    /// Take a buffer if one is free.
    pub fn try_acquire(&self) -> Option<Buffer> {
        match self.free_rx.try_recv() {
            Ok(buffer) => Some(buffer),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take a buffer, waiting until one is released or `timeout` elapses.
    /// `None` waits forever.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<Buffer, PoolError> {
        let result = match timeout {
            Some(timeout) => self.free_rx.recv_timeout(timeout),
            None => self
                .free_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        result.map_err(|_| PoolError::Exhausted {
            pool: self.name,
            waited: timeout,
        })
    }

    /// Return a buffer to the free list. Its grant must have been ended.
    pub fn release(&self, mut buffer: Buffer) {
        let live = buffer.take_grant();
        debug_assert!(
            live.is_none(),
            "{} buffer {} released with a live grant",
            self.name,
            buffer.id
        );
        if let Some(gref) = live {
            error!(
                pool = self.name,
                id = buffer.id,
                %gref,
                "Buffer released with a live grant, backend keeps access"
            );
        }

        if let Err(e) = self.free_tx.try_send(buffer) {
            // Only reachable if a buffer from another pool is released here
            warn!(pool = self.name, id = e.into_inner().id, "Free list overflow");
        }
    }

    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
