//! Hypervisor capabilities consumed by the front-end.
//!
//! The grant table is the only way a page becomes visible to another domain.
//! A [`PageFrame`] is a handle to one shared page; clones refer to the same
//! memory, which is how the backend (or the loopback simulation) sees what the
//! guest wrote.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

/// Size of one shared page
pub const PAGE_SIZE: usize = 4096;

/// Hypervisor errors.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("grant table full")]
    GrantTableFull,

    #[error("grant reference {0} is not active")]
    UnknownGrant(GrantRef),

    #[error("grant reference {gref} does not permit {access} access")]
    AccessDenied { gref: GrantRef, access: &'static str },

    #[error("page access out of bounds: offset {offset} + {len} exceeds the page")]
    OutOfBounds { offset: usize, len: usize },

    #[error("grant operation failed: {0}")]
    GrantFailed(String),

    #[error("event channel: {0}")]
    EventChannel(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Domain identifier of a guest or driver domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DomainId(pub u16);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dom{}", self.0)
    }
}

/// Grant reference handed to the backend inside ring requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantRef(pub u32);

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One shared page.
#[derive(Clone)]
pub struct PageFrame {
    number: u64,
    data: Arc<Mutex<Box<[u8]>>>,
}

impl PageFrame {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            data: Arc::new(Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
        }
    }

    /// Guest frame number
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Whether two handles refer to the same memory
    pub fn same_page(&self, other: &PageFrame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn check_bounds(offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(()),
            _ => Err(HypervisorError::OutOfBounds { offset, len }),
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        Self::check_bounds(offset, buf.len())?;
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn to_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.write_parts(offset, &[bytes]).map(|_| ())
    }

    /// Gather `parts` contiguously starting at `offset`. Returns bytes written.
    pub fn write_parts(&self, offset: usize, parts: &[&[u8]]) -> Result<usize> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        Self::check_bounds(offset, total)?;

        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pos = offset;
        for part in parts {
            data[pos..pos + part.len()].copy_from_slice(part);
            pos += part.len();
        }
        Ok(total)
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

/// Grant table operations.
pub trait GrantTable: Send + Sync {
    /// Allow `domain` to access `frame`. A read-only grant lets the backend
    /// read the page but not write it.
    fn grant_access(&self, domain: DomainId, frame: &PageFrame, readonly: bool) -> Result<GrantRef>;

    /// Revoke a grant. The page is private to the guest again afterwards.
    fn end_access(&self, gref: GrantRef) -> Result<()>;
}
