//! Low-level request objects and completion batches.
//!
//! A [`LlmReq`] is one physical operation against one flash page (or one
//! block, for erases). Requests travel: builder/GC -> priority queue ->
//! scheduler -> device -> completion. A read-modify-write request is the
//! one non-terminal case: its read phase mutates in place into the write
//! phase, and the owning [`ReqBatch`] sees exactly one completion.

use nftl_types::oob::OobArea;
use nftl_types::{Geometry, LogAddr, Lpa, PhysAddr};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Kind of a low-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqKind {
    /// Plain page read.
    Read,
    /// Read of a never-written LPA: completes with a zeroed payload and no
    /// device access worth the name.
    ReadDummy,
    /// Page (or subpage-slot) program.
    Write,
    /// First phase of a read-modify-write: reads the old page so hole
    /// slots can be merged, then transitions into [`ReqKind::RmwWrite`].
    RmwRead,
    /// Second phase of a read-modify-write.
    RmwWrite,
    /// Relocation read issued by garbage collection.
    GcRead,
    /// Relocation write issued by garbage collection.
    GcWrite,
    /// Block erase issued by garbage collection.
    GcErase,
    /// Host trim; carries no payload, the mapping was already invalidated.
    Trim,
}

impl ReqKind {
    /// True for the kinds that erase a whole block.
    #[must_use]
    pub fn is_erase(self) -> bool {
        matches!(self, Self::GcErase)
    }
}

/// One low-level request.
#[derive(Debug)]
pub struct LlmReq {
    pub kind: ReqKind,
    pub logaddr: LogAddr,
    /// Current physical target; for an RMW request this starts as the read
    /// location and becomes `phys_w` at the phase transition.
    pub phys: PhysAddr,
    /// Write-phase target of an RMW request.
    pub phys_w: Option<PhysAddr>,
    /// Page payload, `nr_subpages_per_page * subpage_size` bytes. Slot `i`
    /// occupies bytes `[i * subpage_size, (i + 1) * subpage_size)`.
    pub data: Vec<u8>,
    /// OOB area read back from the device (reads only).
    pub oob: OobArea,
    /// Device status: zero on success.
    pub ret: i32,
    /// Completion batch this request reports to.
    pub batch: Option<Arc<ReqBatch>>,
}

impl LlmReq {
    #[must_use]
    pub fn new(kind: ReqKind, logaddr: LogAddr, phys: PhysAddr, geo: &Geometry) -> Self {
        Self {
            kind,
            logaddr,
            phys,
            phys_w: None,
            data: vec![0; geo.page_size()],
            oob: OobArea::new(geo.nr_subpages_per_page as usize),
            ret: 0,
            batch: None,
        }
    }

    /// LPA under which this request is ordered in the priority queue.
    ///
    /// Requests with no logical address (erases) get a synthetic key
    /// derived from the physical block, counted down from `u32::MAX`.
    /// Geometry validation reserves the top `nr_blocks_total()` values of
    /// the address space for these keys, so they never collide with a real
    /// subpage LPA.
    #[must_use]
    pub fn queue_key(&self, geo: &Geometry) -> Lpa {
        if let Some(lpa) = self.logaddr.first_lpa() {
            return lpa;
        }
        let punit = self.phys.punit(geo).0;
        Lpa(u32::MAX - (punit * geo.nr_blocks_per_chip + self.phys.block))
    }

    /// Payload slice of subpage slot `slot`.
    #[must_use]
    pub fn subpage(&self, slot: usize, geo: &Geometry) -> &[u8] {
        let at = slot * geo.subpage_size;
        &self.data[at..at + geo.subpage_size]
    }

    /// Mutable payload slice of subpage slot `slot`.
    pub fn subpage_mut(&mut self, slot: usize, geo: &Geometry) -> &mut [u8] {
        let at = slot * geo.subpage_size;
        &mut self.data[at..at + geo.subpage_size]
    }
}

#[derive(Debug, Default)]
struct BatchInner {
    done: usize,
    results: Vec<LlmReq>,
}

/// Completion tracking for a group of low-level requests derived from one
/// host request or one GC phase.
///
/// The scheduler calls [`ReqBatch::complete`] exactly once per member
/// request (the RMW read phase does not count; only its write phase
/// completes). Waiters block until every member has completed.
pub struct ReqBatch {
    total: usize,
    inner: Mutex<BatchInner>,
    cv: Condvar,
    on_done: Option<Box<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for ReqBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ReqBatch")
            .field("total", &self.total)
            .field("done", &inner.done)
            .finish()
    }
}

impl ReqBatch {
    #[must_use]
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            inner: Mutex::new(BatchInner::default()),
            cv: Condvar::new(),
            on_done: None,
        })
    }

    /// Batch that invokes `on_done` once, when the last member completes.
    #[must_use]
    pub fn with_notifier(total: usize, on_done: Box<dyn Fn() + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            total,
            inner: Mutex::new(BatchInner::default()),
            cv: Condvar::new(),
            on_done: Some(on_done),
        })
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Record one finished member. Called by the scheduler only.
    ///
    /// The notifier runs under the batch lock, before any waiter can
    /// observe the final done count: a host thread returning from
    /// [`ReqBatch::wait`] always sees the notifier's effects. The notifier
    /// must therefore never call back into the batch.
    pub fn complete(&self, req: LlmReq) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.done < self.total, "batch over-completed");
        inner.done += 1;
        inner.results.push(req);
        if inner.done == self.total {
            if let Some(on_done) = &self.on_done {
                on_done();
            }
            self.cv.notify_all();
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.lock().done == self.total
    }

    /// Block until every member has completed.
    pub fn wait(&self) {
        let mut inner = self.inner.lock();
        while inner.done < self.total {
            self.cv.wait(&mut inner);
        }
    }

    /// Wait, then drain the completed requests out of the batch.
    #[must_use]
    pub fn take_results(&self) -> Vec<LlmReq> {
        let mut inner = self.inner.lock();
        while inner.done < self.total {
            self.cv.wait(&mut inner);
        }
        std::mem::take(&mut inner.results)
    }

    /// First non-zero device status among completed members, if any.
    #[must_use]
    pub fn first_device_error(&self) -> Option<i32> {
        self.inner
            .lock()
            .results
            .iter()
            .map(|req| req.ret)
            .find(|ret| *ret != 0)
    }
}
