#![forbid(unsafe_code)]
//! E2E tests for garbage collection over the real scheduler and RAM
//! device.
//!
//! Scenarios tested:
//! 1. Fully-invalid victims: GC erases one victim per punit, returns them
//!    to the free pool, conserves the valid-subpage count.
//! 2. Partial victims: live subpages are relocated (whole coarse pages as
//!    a batch, stragglers through the fine path) with data intact.
//! 3. Erase failure marks the block bad and keeps it out of the free pool.
//! 4. Fine-grain reclamation recycles the most-swept subpage block.
//! 5. Concurrent rounds never double-free a victim.
//! 6. A subpage overwritten during the relocation read window keeps its
//!    newer copy.

use nftl_error::Result;
use nftl_ftl::Ftl;
use nftl_llm::device::{FlashDevice, RamFlashDevice};
use nftl_llm::req::{LlmReq, ReqBatch, ReqKind};
use nftl_llm::Scheduler;
use nftl_types::{Geometry, LogAddr, Lpa, PhysAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

fn rig(geo: Geometry) -> (Arc<RamFlashDevice>, Scheduler, Ftl) {
    let dev = Arc::new(RamFlashDevice::new(geo));
    let sched = Scheduler::new(geo, dev.clone()).expect("scheduler");
    (dev, sched, Ftl::new(geo))
}

/// Allocate, map, and program one whole coarse page, waiting for the
/// device to finish so the OOB area is in place for later GC reads.
fn write_coarse(ftl: &Ftl, sched: &Scheduler, g: &Geometry, cg: u32, fill: u8) -> PhysAddr {
    let mut la = LogAddr::coarse_page(cg, g);
    let phys = ftl.get_free_ppa(&mut la).expect("alloc");
    ftl.map_lpa_to_ppa(&la, phys).expect("map");
    let mut req = LlmReq::new(ReqKind::Write, la, phys, g);
    req.data.fill(fill);
    let batch = ReqBatch::new(1);
    req.batch = Some(Arc::clone(&batch));
    sched.make_req(req).expect("submit");
    batch.wait();
    phys
}

fn write_fine(ftl: &Ftl, sched: &Scheduler, g: &Geometry, lpa: Lpa, fill: u8) -> PhysAddr {
    let mut la = LogAddr::fine(lpa, 0, g);
    let phys = ftl.get_free_ppa(&mut la).expect("alloc");
    let ofs = la.ofs;
    let la = LogAddr::fine(lpa, ofs, g);
    ftl.map_lpa_to_ppa(&la, phys).expect("map");
    let mut req = LlmReq::new(ReqKind::Write, la, phys, g);
    req.subpage_mut(ofs as usize, g).fill(fill);
    let batch = ReqBatch::new(1);
    req.batch = Some(Arc::clone(&batch));
    sched.make_req(req).expect("submit");
    batch.wait();
    phys
}

fn read_page(sched: &Scheduler, g: &Geometry, phys: PhysAddr) -> LlmReq {
    let mut req = LlmReq::new(ReqKind::Read, LogAddr::empty(g), phys, g);
    let batch = ReqBatch::new(1);
    req.batch = Some(Arc::clone(&batch));
    sched.make_req(req).expect("submit");
    let mut results = batch.take_results();
    results.pop().expect("one result")
}

#[test]
fn gc_erases_fully_invalid_victims_and_conserves_valid_subpages() {
    // 2 punits, 10 blocks each of 2 pages x 2 subpages.
    let mut g = Geometry::new(1, 2, 10, 2, 2, 8).expect("geometry");
    g.gc_threshold_pct = 60;
    let (_dev, sched, ftl) = rig(g);

    // Two passes over the same 8 coarse pages: the first pass's blocks end
    // fully invalid, the second pass holds the live copies.
    for pass in 0..2 {
        for cg in 0..8 {
            write_coarse(&ftl, &sched, &g, cg, (pass * 100 + cg) as u8);
        }
    }
    assert!(ftl.is_gc_needed());
    assert_eq!(ftl.nr_valid_subpages(), 16);
    let free_before = ftl.nr_free_blocks();

    let stats = ftl.do_gc(&sched).expect("gc");
    assert_eq!(stats.nr_victims, 2); // one per punit
    assert_eq!(stats.nr_relocated, 0); // victims were fully invalid
    assert_eq!(stats.nr_bad_blocks, 0);
    assert_eq!(ftl.nr_free_blocks(), free_before + 2);
    assert_eq!(ftl.nr_valid_subpages(), 16);

    // Second round clears the remaining dirty block per punit.
    let stats = ftl.do_gc(&sched).expect("gc");
    assert_eq!(stats.nr_victims, 2);
    assert_eq!(ftl.nr_free_blocks(), free_before + 4);

    // No victims left anywhere: the round is skipped, not an error.
    let stats = ftl.do_gc(&sched).expect("gc");
    assert_eq!(stats, Default::default());

    sched.shutdown();
}

#[test]
fn gc_relocates_live_subpages_with_data_intact() {
    // Single punit so one dirty block suffices for a round.
    let g = Geometry::new(1, 1, 10, 2, 2, 8).expect("geometry");
    let (_dev, sched, ftl) = rig(g);

    // Fill block 0 with coarse pages 0 and 1, rotate it out with a third
    // write, then fine-overwrite LPA 0 so block 0 is dirty but page 1 of
    // it (coarse page 1, LPAs 2..4) is still fully live.
    let old0 = write_coarse(&ftl, &sched, &g, 0, 0x10);
    let old1 = write_coarse(&ftl, &sched, &g, 1, 0x11);
    write_coarse(&ftl, &sched, &g, 2, 0x12);
    write_fine(&ftl, &sched, &g, Lpa(0), 0x99);
    assert_eq!(old0.block, old1.block);
    assert_eq!(ftl.nr_valid_subpages(), 6);

    let stats = ftl.do_gc(&sched).expect("gc");
    assert_eq!(stats.nr_victims, 1);
    // LPA 1 moved through the fine path, LPAs 2..4 as one coarse batch.
    assert_eq!(stats.nr_relocated, 3);
    assert_eq!(ftl.nr_valid_subpages(), 6);

    // The relocated straggler is fine-mapped off the victim block.
    let (phys, ofs) = ftl.get_ppa(&LogAddr::fine(Lpa(1), 0, &g)).expect("mapped");
    assert_ne!(phys.block, old0.block);
    let req = read_page(&sched, &g, phys);
    assert!(req.subpage(ofs as usize, &g).iter().all(|b| *b == 0x10));
    assert_eq!(req.oob.get(ofs as usize), Some(Lpa(1)));

    // The fully-live page kept its coarse mapping at a new location.
    let (phys, slot) = ftl.get_ppa(&LogAddr::fine(Lpa(2), 0, &g)).expect("mapped");
    assert_ne!(phys.block, old1.block);
    assert_eq!(slot, 0);
    let req = read_page(&sched, &g, phys);
    assert!(req.data.iter().all(|b| *b == 0x11));

    // Every relocated LPA still has exactly one authoritative mapping.
    for lpa in [1, 2, 3] {
        assert_eq!(ftl.nr_authoritative(Lpa(lpa)).expect("count"), 1);
    }

    sched.shutdown();
}

#[test]
fn failed_erase_marks_victim_bad() {
    let g = Geometry::new(1, 1, 10, 2, 2, 8).expect("geometry");
    let (dev, sched, ftl) = rig(g);

    let old = write_coarse(&ftl, &sched, &g, 0, 0xAB);
    write_coarse(&ftl, &sched, &g, 1, 0xCD);
    write_coarse(&ftl, &sched, &g, 2, 0xEF); // rotates block 0 out
    write_coarse(&ftl, &sched, &g, 0, 0xAC); // invalidates page 0
    write_coarse(&ftl, &sched, &g, 1, 0xCE); // invalidates page 1

    let free_before = ftl.nr_free_blocks();
    dev.fail_next_erase(0, old.block);
    let stats = ftl.do_gc(&sched).expect("gc");
    assert_eq!(stats.nr_victims, 1);
    assert_eq!(stats.nr_bad_blocks, 1);
    // The bad block never rejoins the free pool.
    assert_eq!(ftl.nr_free_blocks(), free_before);

    sched.shutdown();
}

#[test]
fn fine_reclamation_recycles_most_swept_block() {
    // blocks/6 rounds to 1: reclamation triggers past one released block.
    let g = Geometry::new(1, 1, 10, 2, 2, 8).expect("geometry");
    let (_dev, sched, ftl) = rig(g);

    // 12 fine writes fill three subpage blocks (4 slots each); overwriting
    // the first four LPAs leaves the oldest block fully invalid.
    for i in 0..12 {
        write_fine(&ftl, &sched, &g, Lpa(100 + i), i as u8);
    }
    for i in 0..4 {
        write_fine(&ftl, &sched, &g, Lpa(100 + i), 0x80 + i as u8);
    }
    assert!(ftl.is_reclaim_needed());
    assert_eq!(ftl.nr_valid_subpages(), 12);

    let stats = ftl.reclaim_subpage_blocks(&sched).expect("reclaim");
    assert_eq!(stats.nr_reclaimed, 1);
    assert_eq!(stats.nr_relocated, 0); // the chosen victim was fully swept
    assert_eq!(ftl.nr_valid_subpages(), 12);

    // Every LPA still resolves, with its latest data.
    let (phys, ofs) = ftl.get_ppa(&LogAddr::fine(Lpa(101), 0, &g)).expect("mapped");
    let req = read_page(&sched, &g, phys);
    assert!(req.subpage(ofs as usize, &g).iter().all(|b| *b == 0x81));

    sched.shutdown();
}

#[test]
fn concurrent_gc_rounds_erase_a_victim_once() {
    let g = Geometry::new(1, 1, 10, 2, 2, 8).expect("geometry");
    let (_dev, sched, ftl) = rig(g);

    // Exactly one fully invalid block.
    write_coarse(&ftl, &sched, &g, 0, 0x10);
    write_coarse(&ftl, &sched, &g, 1, 0x11);
    write_coarse(&ftl, &sched, &g, 2, 0x12); // rotates block 0 out
    write_coarse(&ftl, &sched, &g, 0, 0x20);
    write_coarse(&ftl, &sched, &g, 1, 0x21);

    let free_before = ftl.nr_free_blocks();
    let barrier = Barrier::new(2);
    let victims: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    ftl.do_gc(&sched).expect("gc").nr_victims
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("gc thread"))
            .sum()
    });

    // One round claimed the victim, the other found nothing; the block
    // rejoined the free pool exactly once.
    assert_eq!(victims, 1);
    assert_eq!(ftl.nr_free_blocks(), free_before + 1);

    sched.shutdown();
}

/// Device that issues a foreground fine overwrite of LPA 1 while the first
/// relocation read is in flight.
struct OverwritingDevice {
    inner: RamFlashDevice,
    geo: Geometry,
    ftl: Mutex<Option<Arc<Ftl>>>,
    fired: AtomicBool,
}

impl OverwritingDevice {
    fn new(geo: Geometry) -> Self {
        Self {
            inner: RamFlashDevice::new(geo),
            geo,
            ftl: Mutex::new(None),
            fired: AtomicBool::new(false),
        }
    }
}

impl FlashDevice for OverwritingDevice {
    fn probe(&self, geo: &Geometry) -> Result<()> {
        self.inner.probe(geo)
    }

    fn open(&self) -> Result<()> {
        self.inner.open()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn make_req(&self, req: &mut LlmReq) -> Result<()> {
        if req.kind == ReqKind::GcRead && !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(ftl) = self.ftl.lock().unwrap().clone() {
                let g = &self.geo;
                let lpa = Lpa(1);
                let mut la = LogAddr::fine(lpa, 0, g);
                let phys = ftl.get_free_ppa(&mut la).expect("alloc");
                let ofs = la.ofs;
                let la = LogAddr::fine(lpa, ofs, g);
                ftl.map_lpa_to_ppa(&la, phys).expect("map");
                let mut write = LlmReq::new(ReqKind::Write, la, phys, g);
                write.subpage_mut(ofs as usize, g).fill(0x77);
                self.inner.make_req(&mut write).expect("program");
            }
        }
        self.inner.make_req(req)
    }
}

#[test]
fn relocation_skips_subpages_overwritten_during_the_read_window() {
    let g = Geometry::new(1, 1, 10, 2, 2, 8).expect("geometry");
    let dev = Arc::new(OverwritingDevice::new(g));
    let sched = Scheduler::new(g, dev.clone()).expect("scheduler");
    let ftl = Arc::new(Ftl::new(g));
    *dev.ftl.lock().unwrap() = Some(Arc::clone(&ftl));

    // Block 0 ends dirty with coarse page 0 (LPAs 0 and 1) live on page 0.
    write_coarse(&ftl, &sched, &g, 0, 0x10);
    write_coarse(&ftl, &sched, &g, 1, 0x11);
    write_coarse(&ftl, &sched, &g, 2, 0x12); // rotates block 0 out
    write_coarse(&ftl, &sched, &g, 1, 0x21); // invalidates page 1 only

    let stats = ftl.do_gc(&sched).expect("gc");
    assert_eq!(stats.nr_victims, 1);
    // LPA 1 gained a newer copy while the relocation read was in flight;
    // only LPA 0 may move.
    assert_eq!(stats.nr_relocated, 1);

    // The overwrite won: LPA 1 resolves to the 0x77 copy, once.
    assert_eq!(ftl.nr_authoritative(Lpa(1)).expect("count"), 1);
    let (phys, ofs) = ftl.get_ppa(&LogAddr::fine(Lpa(1), 0, &g)).expect("mapped");
    let req = read_page(&sched, &g, phys);
    assert!(req.subpage(ofs as usize, &g).iter().all(|b| *b == 0x77));

    // The relocated LPA 0 kept the old data.
    let (phys, ofs) = ftl.get_ppa(&LogAddr::fine(Lpa(0), 0, &g)).expect("mapped");
    let req = read_page(&sched, &g, phys);
    assert!(req.subpage(ofs as usize, &g).iter().all(|b| *b == 0x10));

    sched.shutdown();
}
