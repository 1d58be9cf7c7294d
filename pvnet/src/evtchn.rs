//! Event channels.
//!
//! An event channel is a one-bit interrupt line between two domains. The
//! userspace analog is a pair of cross-wired eventfds: `notify` signals the
//! peer's fd, `wait` blocks on our own.

use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::trace;

use crate::hypervisor::Result;

/// Signalling primitive shared with the backend.
pub trait EventChannel: Send + Sync {
    /// Block until the peer notifies us, `wake_local` is called, or `timeout`
    /// elapses (`None` waits forever). Returns `false` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;

    /// Signal the peer.
    fn notify(&self) -> Result<()>;

    /// Wake our own pending `wait` (used for cancellation).
    fn wake_local(&self) -> Result<()>;
}

/// Event channel endpoint backed by Linux eventfds.
pub struct EventFdChannel {
    inbound: Arc<EventFd>,
    outbound: Arc<EventFd>,
}

impl EventFdChannel {
    /// Create two connected endpoints: notifying one wakes the other.
    pub fn pair() -> Result<(EventFdChannel, EventFdChannel)> {
        let a = Arc::new(EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)?);
        let b = Arc::new(EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)?);

        Ok((
            EventFdChannel {
                inbound: a.clone(),
                outbound: b.clone(),
            },
            EventFdChannel {
                inbound: b,
                outbound: a,
            },
        ))
    }

    /// Clear a pending signal. EAGAIN means nothing was pending.
    fn consume(&self) -> Result<()> {
        match self.inbound.read() {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let mut ms = d.as_millis().min(i32::MAX as u128) as i32;
            // Sub-millisecond waits must not degrade into a busy poll
            if ms == 0 && !d.is_zero() {
                ms = 1;
            }
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

impl EventChannel for EventFdChannel {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut fds = [PollFd::new(self.inbound.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => Ok(false),
            Ok(_) => {
                self.consume()?;
                Ok(true)
            }
            Err(Errno::EINTR) => {
                trace!("event channel wait interrupted");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn notify(&self) -> Result<()> {
        self.outbound.write(1)?;
        Ok(())
    }

    fn wake_local(&self) -> Result<()> {
        self.inbound.write(1)?;
        Ok(())
    }
}
