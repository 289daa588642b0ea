//! Device boundary: the `FlashDevice` trait and a RAM-backed reference
//! implementation.
//!
//! The scheduler owns exactly one device and hands it one request at a
//! time per parallel unit. `make_req` submits one physical operation and
//! returns once the operation has completed (the RAM backend is
//! synchronous); device-detected failures are reported through the
//! request's `ret` field, submission failures through the `Result`. Either
//! way the scheduler runs the completion path exactly once per request.
//!
//! Timeouts and retries are deliberately absent here; a production backend
//! wraps its transport with those concerns before implementing this trait.

use crate::req::{LlmReq, ReqKind};
use nftl_error::{FtlError, Result};
use nftl_types::oob::OobArea;
use nftl_types::{Geometry, PhysAddr};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Device status for a failed physical operation.
pub const DEV_ERR_IO: i32 = -5;

/// Physical I/O backend.
pub trait FlashDevice: Send + Sync {
    /// Check that the device can serve the given geometry.
    fn probe(&self, geo: &Geometry) -> Result<()>;

    /// Bring the device up. Called once before the first `make_req`.
    fn open(&self) -> Result<()>;

    /// Tear the device down. Called once, after the scheduler drained.
    fn close(&self);

    /// Submit one physical read/write/erase. On return the operation has
    /// completed; `req.ret` carries the device status.
    fn make_req(&self, req: &mut LlmReq) -> Result<()>;
}

#[derive(Debug, Clone)]
struct PageStore {
    data: Vec<u8>,
    oob: Vec<u8>,
}

#[derive(Debug, Default)]
struct RamInner {
    pages: HashMap<PhysAddr, PageStore>,
    /// Blocks whose next erase reports a device failure (test hook for the
    /// bad-block path).
    failing_erases: HashSet<(u32, u32)>,
}

/// Volatile reference device: a page store in host memory.
///
/// Reads return whole pages; writes program only the subpage slots named
/// by the request's logical address, merging into whatever the page
/// already holds (this models the per-column programming the fine-grained
/// mapping path performs). The OOB area is kept in its encoded on-flash
/// form so the codec is exercised on every round trip.
#[derive(Debug)]
pub struct RamFlashDevice {
    geo: Geometry,
    inner: Mutex<RamInner>,
}

impl RamFlashDevice {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        Self {
            geo,
            inner: Mutex::new(RamInner::default()),
        }
    }

    /// Make the next erase of `(punit, block)` report a device failure.
    pub fn fail_next_erase(&self, punit: u32, block: u32) {
        self.inner.lock().failing_erases.insert((punit, block));
    }

    /// Number of pages currently programmed (test visibility).
    #[must_use]
    pub fn nr_programmed_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    fn blank_page(&self) -> PageStore {
        PageStore {
            data: vec![0; self.geo.page_size()],
            oob: OobArea::new(self.geo.nr_subpages_per_page as usize).encode(),
        }
    }

    fn read_into(&self, req: &mut LlmReq, holes_only: bool) -> Result<()> {
        let inner = self.inner.lock();
        let stored = inner.pages.get(&req.phys).cloned();
        drop(inner);
        let stored = stored.unwrap_or_else(|| self.blank_page());

        let spp = self.geo.nr_subpages_per_page as usize;
        let sz = self.geo.subpage_size;
        for slot in 0..spp {
            let fill = if holes_only {
                req.logaddr.subpages[slot].is_none()
            } else {
                true
            };
            if fill {
                let at = slot * sz;
                req.data[at..at + sz].copy_from_slice(&stored.data[at..at + sz]);
            }
        }
        req.oob = OobArea::decode(&stored.oob, spp)
            .map_err(|err| FtlError::Codec(err.to_string()))?;
        Ok(())
    }

    fn program(&self, req: &LlmReq) {
        let mut inner = self.inner.lock();
        let store = inner
            .pages
            .entry(req.phys)
            .or_insert_with(|| self.blank_page());
        let spp = self.geo.nr_subpages_per_page as usize;
        let sz = self.geo.subpage_size;
        let mut oob = match OobArea::decode(&store.oob, spp) {
            Ok(area) => area,
            Err(_) => OobArea::new(spp),
        };
        for slot in 0..spp {
            if let Some(lpa) = req.logaddr.subpages[slot] {
                let at = slot * sz;
                store.data[at..at + sz].copy_from_slice(&req.data[at..at + sz]);
                oob.set(slot, Some(lpa));
            }
        }
        store.oob = oob.encode();
    }

    fn erase(&self, req: &mut LlmReq) {
        let punit = req.phys.punit(&self.geo).0;
        let mut inner = self.inner.lock();
        if inner.failing_erases.remove(&(punit, req.phys.block)) {
            req.ret = DEV_ERR_IO;
            return;
        }
        let target = (req.phys.channel, req.phys.chip, req.phys.block);
        inner
            .pages
            .retain(|phys, _| (phys.channel, phys.chip, phys.block) != target);
    }
}

impl FlashDevice for RamFlashDevice {
    fn probe(&self, geo: &Geometry) -> Result<()> {
        if *geo != self.geo {
            return Err(FtlError::InvalidGeometry(
                "ram device geometry mismatch".into(),
            ));
        }
        Ok(())
    }

    fn open(&self) -> Result<()> {
        tracing::debug!(
            punits = self.geo.nr_punits(),
            blocks = self.geo.nr_blocks_total(),
            "ram flash device opened"
        );
        Ok(())
    }

    fn close(&self) {
        tracing::debug!("ram flash device closed");
    }

    fn make_req(&self, req: &mut LlmReq) -> Result<()> {
        req.ret = 0;
        match req.kind {
            ReqKind::Read | ReqKind::GcRead => self.read_into(req, false)?,
            ReqKind::RmwRead => self.read_into(req, true)?,
            ReqKind::ReadDummy => req.data.fill(0),
            ReqKind::Write | ReqKind::GcWrite | ReqKind::RmwWrite => self.program(req),
            ReqKind::GcErase => self.erase(req),
            ReqKind::Trim => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nftl_types::{LogAddr, Lpa};

    fn geo() -> Geometry {
        Geometry::new(1, 2, 4, 4, 4, 8).expect("geometry")
    }

    #[test]
    fn write_then_read_round_trips_data_and_oob() {
        let g = geo();
        let dev = RamFlashDevice::new(g);
        let phys = PhysAddr::new(0, 1, 2, 3);

        let mut write = LlmReq::new(ReqKind::Write, LogAddr::coarse_page(5, &g), phys, &g);
        for slot in 0..4 {
            write.subpage_mut(slot, &g).fill(slot as u8 + 1);
        }
        dev.make_req(&mut write).expect("write");

        let mut read = LlmReq::new(ReqKind::Read, LogAddr::empty(&g), phys, &g);
        dev.make_req(&mut read).expect("read");
        assert_eq!(read.ret, 0);
        assert!(read.subpage(2, &g).iter().all(|b| *b == 3));
        assert_eq!(read.oob.get(0), Some(Lpa(20)));
        assert_eq!(read.oob.get(3), Some(Lpa(23)));
    }

    #[test]
    fn partial_program_merges_slots() {
        let g = geo();
        let dev = RamFlashDevice::new(g);
        let phys = PhysAddr::new(0, 0, 1, 0);

        let mut first = LlmReq::new(ReqKind::Write, LogAddr::fine(Lpa(40), 0, &g), phys, &g);
        first.subpage_mut(0, &g).fill(0x11);
        dev.make_req(&mut first).expect("write");

        let mut second = LlmReq::new(ReqKind::Write, LogAddr::fine(Lpa(77), 2, &g), phys, &g);
        second.subpage_mut(2, &g).fill(0x22);
        dev.make_req(&mut second).expect("write");

        let mut read = LlmReq::new(ReqKind::Read, LogAddr::empty(&g), phys, &g);
        dev.make_req(&mut read).expect("read");
        assert!(read.subpage(0, &g).iter().all(|b| *b == 0x11));
        assert!(read.subpage(2, &g).iter().all(|b| *b == 0x22));
        assert_eq!(read.oob.get(0), Some(Lpa(40)));
        assert_eq!(read.oob.get(1), None);
        assert_eq!(read.oob.get(2), Some(Lpa(77)));
    }

    #[test]
    fn rmw_read_fills_holes_only() {
        let g = geo();
        let dev = RamFlashDevice::new(g);
        let phys = PhysAddr::new(0, 0, 0, 0);

        let mut old = LlmReq::new(ReqKind::Write, LogAddr::coarse_page(0, &g), phys, &g);
        old.data.fill(0xEE);
        dev.make_req(&mut old).expect("write");

        // Host provides fresh data for slots 0 and 1 only.
        let mut la = LogAddr::coarse_page(0, &g);
        la.subpages[2] = None;
        la.subpages[3] = None;
        let mut rmw = LlmReq::new(ReqKind::RmwRead, la, phys, &g);
        rmw.subpage_mut(0, &g).fill(0xAA);
        rmw.subpage_mut(1, &g).fill(0xBB);
        dev.make_req(&mut rmw).expect("rmw read");

        assert!(rmw.subpage(0, &g).iter().all(|b| *b == 0xAA));
        assert!(rmw.subpage(1, &g).iter().all(|b| *b == 0xBB));
        assert!(rmw.subpage(2, &g).iter().all(|b| *b == 0xEE));
        assert!(rmw.subpage(3, &g).iter().all(|b| *b == 0xEE));
    }

    #[test]
    fn erase_clears_block_and_can_fail() {
        let g = geo();
        let dev = RamFlashDevice::new(g);
        let phys = PhysAddr::new(0, 0, 3, 0);

        let mut write = LlmReq::new(ReqKind::Write, LogAddr::coarse_page(12, &g), phys, &g);
        dev.make_req(&mut write).expect("write");
        assert_eq!(dev.nr_programmed_pages(), 1);

        let mut erase = LlmReq::new(ReqKind::GcErase, LogAddr::empty(&g), phys, &g);
        dev.make_req(&mut erase).expect("erase");
        assert_eq!(erase.ret, 0);
        assert_eq!(dev.nr_programmed_pages(), 0);

        dev.fail_next_erase(0, 3);
        let mut bad = LlmReq::new(ReqKind::GcErase, LogAddr::empty(&g), phys, &g);
        dev.make_req(&mut bad).expect("submit ok");
        assert_eq!(bad.ret, DEV_ERR_IO);
    }
}
