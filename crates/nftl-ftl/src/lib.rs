#![forbid(unsafe_code)]
//! FTL core: block-status bookkeeping, the coarse/fine dual-granularity
//! mapping table, and garbage collection.
//!
//! [`Ftl`] wires the block manager and the mapping table under one lock.
//! The lock covers metadata only; the GC paths drop it while waiting on
//! device I/O so foreground translation is never blocked for a whole
//! read-relocate-write-erase round trip.

pub mod abm;
pub mod gc;
pub mod map;

use abm::BlockManager;
use map::MappingTable;
use nftl_error::Result;
use nftl_types::{Geometry, LogAddr, Lpa, PhysAddr};
use parking_lot::Mutex;

pub(crate) struct FtlInner {
    pub(crate) abm: BlockManager,
    pub(crate) map: MappingTable,
}

/// The flash-translation layer of one SSD instance.
pub struct Ftl {
    geo: Geometry,
    inner: Mutex<FtlInner>,
    /// Serializes whole collection rounds. Held across the read, relocate
    /// and erase phases so two callers can never pick the same victim;
    /// `inner` stays fine-grained underneath it.
    pub(crate) gc_gate: Mutex<()>,
}

impl Ftl {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        Self {
            geo,
            inner: Mutex::new(FtlInner {
                abm: BlockManager::new(geo),
                map: MappingTable::new(geo),
            }),
            gc_gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Allocate physical space for one request; fine-grained requests get
    /// their subpage column recorded in `la.ofs`.
    pub fn get_free_ppa(&self, la: &mut LogAddr) -> Result<PhysAddr> {
        let mut inner = self.inner.lock();
        let FtlInner { abm, map } = &mut *inner;
        map.get_free_ppa(abm, la)
    }

    /// Record the mapping for a completed allocation, superseding whatever
    /// previous location the address had.
    pub fn map_lpa_to_ppa(&self, la: &LogAddr, phys: PhysAddr) -> Result<()> {
        let mut inner = self.inner.lock();
        let FtlInner { abm, map } = &mut *inner;
        map.map_lpa_to_ppa(abm, la, phys)
    }

    /// Translate a logical address. `None` is the defined miss for a
    /// never-written LPA: the caller serves zeroes, not fabricated data.
    #[must_use]
    pub fn get_ppa(&self, la: &LogAddr) -> Option<(PhysAddr, u8)> {
        self.inner.lock().map.get_ppa(la)
    }

    /// TRIM `[lpa, lpa + len)` subpage addresses.
    pub fn invalidate_lpa(&self, lpa: Lpa, len: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let FtlInner { abm, map } = &mut *inner;
        map.invalidate_lpa(abm, lpa, len)
    }

    /// True when any subpage of coarse page `cg` has a fine overlay entry.
    #[must_use]
    pub fn has_fine_in_page(&self, cg: u32) -> bool {
        self.inner.lock().map.has_fine_in_page(cg)
    }

    /// Logical capacity in subpage units.
    #[must_use]
    pub fn nr_subpages_total(&self) -> u64 {
        self.inner.lock().map.nr_coarse_entries() as u64 * u64::from(self.geo.nr_subpages_per_page)
    }

    /// Free space is critically low; collect before admitting more writes.
    #[must_use]
    pub fn is_gc_needed(&self) -> bool {
        let inner = self.inner.lock();
        let free = inner.abm.nr_free_blocks() as u64;
        let total = inner.abm.nr_total_blocks() as u64;
        free * 100 <= total * u64::from(self.geo.gc_threshold_pct)
    }

    #[must_use]
    pub fn nr_free_blocks(&self) -> usize {
        self.inner.lock().abm.nr_free_blocks()
    }

    /// Valid subpages across all blocks (conservation checks).
    #[must_use]
    pub fn nr_valid_subpages(&self) -> usize {
        self.inner.lock().abm.nr_valid_subpages()
    }

    /// Authoritative mapping count for one LPA; the at-most-one invariant
    /// says this never exceeds 1.
    pub fn nr_authoritative(&self, lpa: Lpa) -> Result<usize> {
        let inner = self.inner.lock();
        inner.map.nr_authoritative(&inner.abm, lpa)
    }
}
