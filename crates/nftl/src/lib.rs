#![forbid(unsafe_code)]
//! Dual-granularity flash-translation-layer storage engine.
//!
//! [`Ssd`] is the host-facing surface: it owns the translation layer, the
//! parallel-unit scheduler, and the request pool, and turns host
//! read/write/trim requests into batches of low-level flash operations.
//! Space reclamation is admission-gated: a write that arrives while free
//! space is below the GC threshold (or while too many subpage-granularity
//! blocks have gone dirty) first runs the corresponding reclamation round,
//! then proceeds.
//!
//! ```no_run
//! use nftl::{Geometry, HostReq, Lpa, RamFlashDevice, Ssd};
//! use std::sync::Arc;
//!
//! # fn main() -> nftl::Result<()> {
//! let geo = Geometry::new(2, 2, 64, 16, 4, 4096).expect("valid geometry");
//! let ssd = Ssd::new(geo, Arc::new(RamFlashDevice::new(geo)))?;
//!
//! let data = vec![0xA5; geo.subpage_size];
//! let batch = ssd.make_req(&HostReq::write(Lpa(0), data, &geo)?)?;
//! ssd.recycle(batch.take_results());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod pool;

pub use builder::{HostReq, HostReqKind};
pub use nftl_error::{FtlError, Result};
pub use nftl_ftl::gc::{GcStats, ReclaimStats};
pub use nftl_ftl::Ftl;
pub use nftl_llm::device::{FlashDevice, RamFlashDevice};
pub use nftl_llm::req::{LlmReq, ReqBatch, ReqKind};
pub use nftl_llm::Scheduler;
pub use nftl_types::{Geometry, GeometryError, LogAddr, Lpa, PhysAddr, PunitId};
pub use pool::ReqPool;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One SSD instance: translation layer, scheduler, and request pool.
pub struct Ssd {
    geo: Geometry,
    ftl: Ftl,
    sched: Scheduler,
    pool: ReqPool,
    outstanding: Arc<AtomicUsize>,
}

impl Ssd {
    /// Bring up an instance on `dev`: probe and open the device, start the
    /// scheduler worker.
    pub fn new(geo: Geometry, dev: Arc<dyn FlashDevice>) -> Result<Self> {
        let sched = Scheduler::new(geo, dev)?;
        tracing::info!(
            punits = geo.nr_punits(),
            blocks = geo.nr_blocks_total(),
            page_size = geo.page_size(),
            "ssd instance up"
        );
        Ok(Self {
            geo,
            ftl: Ftl::new(geo),
            sched,
            pool: ReqPool::with_defaults(geo),
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Translation layer, exposed for direct mapping queries.
    #[must_use]
    pub fn ftl(&self) -> &Ftl {
        &self.ftl
    }

    /// Submit one host request. Returns the completion batch; the caller
    /// waits on it (or polls `is_done`) and should hand the drained
    /// requests back through [`Ssd::recycle`].
    pub fn make_req(&self, host: &HostReq) -> Result<Arc<ReqBatch>> {
        if host.kind == HostReqKind::Write {
            if self.ftl.is_gc_needed() {
                let stats = self.ftl.do_gc(&self.sched)?;
                tracing::debug!(?stats, "gc before write admission");
            }
            if self.ftl.is_reclaim_needed() {
                let stats = self.ftl.reclaim_subpage_blocks(&self.sched)?;
                tracing::debug!(?stats, "fine reclamation before write admission");
            }
        }

        let mut reqs = builder::build(&self.ftl, &self.pool, &self.geo, host)?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let outstanding = Arc::clone(&self.outstanding);
        let batch = ReqBatch::with_notifier(
            reqs.len(),
            Box::new(move || {
                outstanding.fetch_sub(1, Ordering::AcqRel);
            }),
        );
        for req in &mut reqs {
            req.batch = Some(Arc::clone(&batch));
        }
        for req in reqs {
            self.sched.make_req(req)?;
        }
        Ok(batch)
    }

    /// Return drained requests to the pool.
    pub fn recycle(&self, reqs: Vec<LlmReq>) {
        for req in reqs {
            self.pool.put(req);
        }
    }

    /// Host requests submitted but not yet fully completed.
    #[must_use]
    pub fn nr_outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Run one garbage-collection round now, regardless of the threshold.
    pub fn do_gc(&self) -> Result<GcStats> {
        self.ftl.do_gc(&self.sched)
    }

    #[must_use]
    pub fn is_gc_needed(&self) -> bool {
        self.ftl.is_gc_needed()
    }

    /// Block until every queued low-level request has completed.
    pub fn flush(&self) {
        self.sched.flush();
    }

    /// Drain and stop. Idempotent; later submissions fail with
    /// [`FtlError::ShutDown`].
    pub fn shutdown(&self) {
        self.sched.flush();
        self.sched.shutdown();
    }
}

impl Drop for Ssd {
    fn drop(&mut self) {
        self.shutdown();
    }
}
