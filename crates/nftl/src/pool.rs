//! Reusable low-level request shells.
//!
//! Building a request allocates a full page buffer; the pool keeps
//! returned shells around so steady-state I/O stops allocating. The pool
//! grows by a fixed increment when drained and refuses to grow past its
//! capacity, surfacing exhaustion to the caller instead of failing the
//! allocation silently.

use nftl_error::{FtlError, Result};
use nftl_llm::req::{LlmReq, ReqKind};
use nftl_types::{Geometry, LogAddr, PhysAddr};
use parking_lot::Mutex;

/// Shells preallocated at construction.
pub const DEFAULT_INITIAL: usize = 64;
/// Shells added per growth step.
pub const DEFAULT_INCREMENT: usize = 16;
/// Hard ceiling on live shells.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct PoolInner {
    free: Vec<LlmReq>,
    nr_total: usize,
}

/// Free-list pool of [`LlmReq`] shells.
#[derive(Debug)]
pub struct ReqPool {
    geo: Geometry,
    inner: Mutex<PoolInner>,
    increment: usize,
    capacity: usize,
}

impl ReqPool {
    #[must_use]
    pub fn new(geo: Geometry, initial: usize, increment: usize, capacity: usize) -> Self {
        let initial = initial.min(capacity);
        Self {
            geo,
            inner: Mutex::new(PoolInner {
                free: (0..initial).map(|_| Self::blank(&geo)).collect(),
                nr_total: initial,
            }),
            increment,
            capacity,
        }
    }

    #[must_use]
    pub fn with_defaults(geo: Geometry) -> Self {
        Self::new(geo, DEFAULT_INITIAL, DEFAULT_INCREMENT, DEFAULT_CAPACITY)
    }

    fn blank(geo: &Geometry) -> LlmReq {
        LlmReq::new(ReqKind::Read, LogAddr::empty(geo), PhysAddr::ZERO, geo)
    }

    /// Take one shell, growing the pool by its increment when drained.
    /// Fails with [`FtlError::PoolExhausted`] once every shell up to the
    /// capacity is in flight.
    pub fn get(&self) -> Result<LlmReq> {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.free.pop() {
            return Ok(req);
        }
        if inner.nr_total >= self.capacity {
            return Err(FtlError::PoolExhausted {
                capacity: self.capacity,
            });
        }
        let grow = self.increment.min(self.capacity - inner.nr_total).max(1);
        tracing::debug!(grow, total = inner.nr_total + grow, "request pool growing");
        for _ in 0..grow {
            inner.free.push(Self::blank(&self.geo));
        }
        inner.nr_total += grow;
        let req = inner.free.pop();
        req.ok_or(FtlError::PoolExhausted {
            capacity: self.capacity,
        })
    }

    /// Return a shell, scrubbing request state so the next user starts
    /// clean.
    pub fn put(&self, mut req: LlmReq) {
        req.kind = ReqKind::Read;
        req.logaddr = LogAddr::empty(&self.geo);
        req.phys = PhysAddr::ZERO;
        req.phys_w = None;
        req.data.fill(0);
        req.oob = nftl_types::oob::OobArea::new(self.geo.nr_subpages_per_page as usize);
        req.ret = 0;
        req.batch = None;
        self.inner.lock().free.push(req);
    }

    #[must_use]
    pub fn nr_total(&self) -> usize {
        self.inner.lock().nr_total
    }

    #[must_use]
    pub fn nr_free(&self) -> usize {
        self.inner.lock().free.len()
    }
}
