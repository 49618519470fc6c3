//! Exclusive media-buffer ownership with allocation auditing.
//!
//! A [`MediaBuffer`] stands in for whatever the frame source hands the
//! pipeline (a mapped capture buffer, a decoded surface).  Ownership rules:
//!
//! - a buffer handle is exclusively owned by one [`Frame`](crate::Frame) at
//!   a time and is released exactly once, when that handle drops;
//! - fan-out requires an explicit [`share`](MediaBuffer::share) — there is
//!   no implicit duplication; the underlying storage is freed when the last
//!   shared handle goes away.
//!
//! [`BufferAudit`] counts creations and final releases so shutdown tests
//! can prove zero leaks across start/stop cycles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live-buffer accounting shared by every buffer a source hands out.
#[derive(Debug, Default)]
pub struct BufferAudit {
    created: AtomicU64,
    released: AtomicU64,
}

impl BufferAudit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Buffers currently alive (created minus fully released).
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.released())
    }
}

#[derive(Debug)]
struct BufferInner {
    width: u32,
    height: u32,
    data: Box<[u8]>,
    audit: Option<Arc<BufferAudit>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(audit) = &self.audit {
            audit.released.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Opaque ownable media handle.
#[derive(Debug)]
pub struct MediaBuffer {
    inner: Arc<BufferInner>,
}

impl MediaBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                width,
                height,
                data: data.into_boxed_slice(),
                audit: None,
            }),
        }
    }

    /// Create a buffer whose lifetime is tracked by `audit`.
    pub fn audited(width: u32, height: u32, data: Vec<u8>, audit: Arc<BufferAudit>) -> Self {
        audit.created.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::new(BufferInner {
                width,
                height,
                data: data.into_boxed_slice(),
                audit: Some(audit),
            }),
        }
    }

    /// Explicit shared handle for tree fan-out.  The storage is freed when
    /// the last handle drops.
    pub fn share(&self) -> MediaBuffer {
        MediaBuffer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Terminal disposition of this handle.  Equivalent to dropping it; the
    /// explicit form marks release sites in stage code.
    pub fn release(self) {}

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }
}
