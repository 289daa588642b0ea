#![forbid(unsafe_code)]
//! Low-level request manager: priority queue plus parallel-unit scheduler.
//!
//! ## Design
//!
//! The scheduler drains the per-punit [`queue::PrioQueue`] into the
//! [`device::FlashDevice`], enforcing one outstanding operation per
//! parallel unit and the two-phase read-modify-write state machine:
//!
//! ```text
//! QUEUED -> DISPATCHED -> DONE
//!                      \-> QUEUED (RmwRead re-typed as RmwWrite,
//!                                  moved to the write punit)
//! ```
//!
//! A single worker thread sweeps the punits round-robin; punit busy flags
//! are the sole admission mechanism for issuing to a punit, so additional
//! workers would need no further coordination. The worker suspends when
//! the queue is globally empty and is woken by the next enqueue.
//!
//! Producers are back-pressured: `make_req` blocks while the outstanding
//! item count sits above the geometry's soft cap, rather than failing the
//! request. `flush` is a synchronous drain barrier with no cancellation
//! semantics: when it returns, the queue is empty.

pub mod device;
pub mod queue;
pub mod req;

use device::{FlashDevice, DEV_ERR_IO};
use nftl_error::{FtlError, Result};
use nftl_types::{Geometry, Lpa};
use parking_lot::{Condvar, Mutex};
use queue::{ItemId, PrioQueue};
use req::{LlmReq, ReqKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Default)]
struct Gate {
    shutdown: bool,
}

struct Core {
    geo: Geometry,
    queue: PrioQueue,
    dev: Arc<dyn FlashDevice>,
    busy: Vec<AtomicBool>,
    gate: Mutex<Gate>,
    /// Wakes the worker on enqueue and shutdown.
    work_cv: Condvar,
    /// Wakes flushers and back-pressured producers on completion.
    drain_cv: Condvar,
}

impl Core {
    fn dispatch(&self, punit: usize, id: ItemId, mut req: LlmReq) {
        tracing::trace!(punit, kind = ?req.kind, phys = ?req.phys, "dispatching");
        if let Err(err) = self.dev.make_req(&mut req) {
            tracing::warn!(punit, error = %err, "device submission failed");
            if req.ret == 0 {
                req.ret = DEV_ERR_IO;
            }
        }
        self.end_req(punit, id, req);
    }

    /// Completion path; runs exactly once per dispatched request.
    fn end_req(&self, punit: usize, id: ItemId, mut req: LlmReq) {
        self.busy[punit].store(false, Ordering::Release);

        if req.kind == ReqKind::RmwRead && req.ret == 0 {
            if let Some(phys_w) = req.phys_w.take() {
                if fill_rmw_holes(&mut req) {
                    // Phase transition: same logical request, re-typed and
                    // re-queued under the write punit. The host sees one
                    // completion, after the write phase.
                    req.kind = ReqKind::RmwWrite;
                    req.phys = phys_w;
                    let new_qid = phys_w.punit(&self.geo).0 as usize;
                    tracing::trace!(from = punit, to = new_qid, "rmw read -> write");
                    match self.queue.move_item(id, new_qid, req) {
                        Ok(()) => {
                            let _gate = self.gate.lock();
                            self.work_cv.notify_all();
                            return;
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "rmw move failed; completing");
                            // Fall through to terminal completion below; the
                            // item is gone from the queue either way.
                            let _ = self.queue.remove(id);
                            let _gate = self.gate.lock();
                            self.drain_cv.notify_all();
                            return;
                        }
                    }
                }
                tracing::error!("rmw subpage lpa sits below its slot; failing request");
                req.ret = DEV_ERR_IO;
            } else {
                tracing::error!("rmw read without a write target; failing request");
                req.ret = DEV_ERR_IO;
            }
        }

        if let Err(err) = self.queue.remove(id) {
            tracing::error!(error = %err, "completion for unknown queue item");
        }
        let batch = req.batch.take();
        if let Some(batch) = batch {
            batch.complete(req);
        }
        let _gate = self.gate.lock();
        self.drain_cv.notify_all();
    }
}

/// Derive the hole slots' LPAs from the present ones before the RMW write
/// phase: after the merge the whole coarse page is live, so slot `i`
/// carries `cg * spp + i`.
///
/// Returns `false` for a malformed request whose subpage LPA sits below
/// its slot index; the caller fails the request instead of requeueing it.
fn fill_rmw_holes(req: &mut LlmReq) -> bool {
    let Some((slot, lpa)) = req
        .logaddr
        .subpages
        .iter()
        .enumerate()
        .find_map(|(slot, sp)| sp.map(|lpa| (slot, lpa)))
    else {
        return true;
    };
    let Some(base) = lpa.0.checked_sub(slot as u32) else {
        return false;
    };
    for (slot, sp) in req.logaddr.subpages.iter_mut().enumerate() {
        if sp.is_none() {
            *sp = Some(Lpa(base + slot as u32));
        }
    }
    true
}

fn worker_loop(core: &Core) {
    let nr_punits = core.geo.nr_punits() as usize;
    tracing::debug!(nr_punits, "scheduler worker started");
    loop {
        {
            let mut gate = core.gate.lock();
            loop {
                if core.queue.is_all_empty() {
                    if gate.shutdown {
                        tracing::debug!("scheduler worker stopping");
                        return;
                    }
                    core.work_cv.wait(&mut gate);
                } else {
                    break;
                }
            }
        }

        let mut progressed = false;
        for punit in 0..nr_punits {
            if core.busy[punit]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            match core.queue.dequeue(punit) {
                Ok(Some((id, req))) => {
                    progressed = true;
                    core.dispatch(punit, id, req);
                }
                Ok(None) => core.busy[punit].store(false, Ordering::Release),
                Err(err) => {
                    core.busy[punit].store(false, Ordering::Release);
                    tracing::error!(punit, error = %err, "dequeue failed");
                }
            }
        }
        if !progressed {
            // Every head was tag-stalled or every punit busy; give any
            // other worker a chance to complete its predecessor.
            std::thread::yield_now();
        }
    }
}

/// Parallel-unit scheduler: owns the queue, the punit busy flags, one
/// worker thread, and the device.
pub struct Scheduler {
    core: Arc<Core>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Probe and open the device, then start the worker.
    pub fn new(geo: Geometry, dev: Arc<dyn FlashDevice>) -> Result<Self> {
        dev.probe(&geo)?;
        dev.open()?;
        let nr_punits = geo.nr_punits() as usize;
        let core = Arc::new(Core {
            geo,
            queue: PrioQueue::new(nr_punits, None)?,
            dev,
            busy: (0..nr_punits).map(|_| AtomicBool::new(false)).collect(),
            gate: Mutex::new(Gate::default()),
            work_cv: Condvar::new(),
            drain_cv: Condvar::new(),
        });
        let worker_core = Arc::clone(&core);
        let worker = std::thread::Builder::new()
            .name("nftl-llm-sched".into())
            .spawn(move || worker_loop(&worker_core))
            .map_err(|err| FtlError::Spawn(err.to_string()))?;
        Ok(Self {
            core,
            worker: Mutex::new(Some(worker)),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.core.geo
    }

    /// Submit one low-level request. Blocks while the queue sits above the
    /// soft cap (back-pressure), fails with [`FtlError::ShutDown`] after
    /// shutdown.
    pub fn make_req(&self, req: LlmReq) -> Result<()> {
        {
            let mut gate = self.core.gate.lock();
            loop {
                if gate.shutdown {
                    return Err(FtlError::ShutDown);
                }
                if self.core.queue.nr_items() < self.core.geo.queue_soft_cap {
                    break;
                }
                self.core.drain_cv.wait(&mut gate);
            }
        }
        let qid = req.phys.punit(&self.core.geo).0 as usize;
        let key = req.queue_key(&self.core.geo);
        self.core.queue.enqueue(qid, key, req)?;
        let _gate = self.core.gate.lock();
        self.core.work_cv.notify_all();
        Ok(())
    }

    /// Block until the queue is fully drained. Idempotent: returns
    /// immediately when the queue is already empty.
    pub fn flush(&self) {
        let mut gate = self.core.gate.lock();
        while !self.core.queue.is_all_empty() {
            self.core.drain_cv.wait(&mut gate);
        }
    }

    /// Outstanding low-level requests (queued plus in flight).
    #[must_use]
    pub fn nr_outstanding(&self) -> usize {
        self.core.queue.nr_items()
    }

    /// Drain, stop the worker, and close the device. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut gate = self.core.gate.lock();
            if gate.shutdown {
                return;
            }
            gate.shutdown = true;
            self.core.work_cv.notify_all();
            self.core.drain_cv.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("scheduler worker panicked");
            }
        }
        self.core.dev.close();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
