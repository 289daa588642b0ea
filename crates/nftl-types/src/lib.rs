#![forbid(unsafe_code)]
//! Value types shared by every nftl crate.
//!
//! This crate is dependency-light by design: it holds the SSD geometry, the
//! logical/physical address newtypes, and the typed out-of-band (OOB) area
//! codec. It must not depend on any other nftl crate.
//!
//! ## Address spaces
//!
//! The host address space is **subpage-granular**: one [`Lpa`] names one
//! logical subpage (typically 4 KiB). A flash page holds
//! `nr_subpages_per_page` subpages, so the coarse-grained (whole flash page)
//! address of a subpage is `lpa / nr_subpages_per_page`. A [`LogAddr`]
//! carries one optional subpage LPA per slot of a flash page; slots the host
//! did not touch are holes (`None`).

pub mod oob;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised while validating a [`Geometry`].
///
/// Converted into the user-facing error type at the crate boundary; this
/// crate stays independent of `nftl-error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("invalid geometry: {field} {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Physical layout and policy knobs of one SSD instance.
///
/// All counts are per the level above them (`nr_chips_per_channel` chips on
/// every channel, `nr_blocks_per_chip` blocks on every chip, and so on).
/// A *parallel unit* (punit) is one channel/chip combination; it is the
/// scheduling identity for the low-level request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub nr_channels: u32,
    pub nr_chips_per_channel: u32,
    pub nr_blocks_per_chip: u32,
    pub nr_pages_per_block: u32,
    pub nr_subpages_per_page: u32,
    /// Size of one logical subpage in bytes.
    pub subpage_size: usize,
    /// GC triggers when free blocks fall to this percentage of all blocks.
    pub gc_threshold_pct: u32,
    /// Producers into the scheduler stall while this many low-level
    /// requests are outstanding.
    pub queue_soft_cap: usize,
}

impl Geometry {
    /// Validate a geometry. Every structural count must be non-zero and the
    /// subpage address space must fit `u32` with room for the OOB sentinel.
    pub fn new(
        nr_channels: u32,
        nr_chips_per_channel: u32,
        nr_blocks_per_chip: u32,
        nr_pages_per_block: u32,
        nr_subpages_per_page: u32,
        subpage_size: usize,
    ) -> Result<Self, GeometryError> {
        let geo = Self {
            nr_channels,
            nr_chips_per_channel,
            nr_blocks_per_chip,
            nr_pages_per_block,
            nr_subpages_per_page,
            subpage_size,
            gc_threshold_pct: 2,
            queue_soft_cap: 256,
        };
        geo.validate()?;
        Ok(geo)
    }

    fn validate(&self) -> Result<(), GeometryError> {
        fn nonzero(value: u64, field: &'static str) -> Result<(), GeometryError> {
            if value == 0 {
                return Err(GeometryError::InvalidField {
                    field,
                    reason: "must be > 0",
                });
            }
            Ok(())
        }
        nonzero(u64::from(self.nr_channels), "nr_channels")?;
        nonzero(u64::from(self.nr_chips_per_channel), "nr_chips_per_channel")?;
        nonzero(u64::from(self.nr_blocks_per_chip), "nr_blocks_per_chip")?;
        nonzero(u64::from(self.nr_pages_per_block), "nr_pages_per_block")?;
        nonzero(u64::from(self.nr_subpages_per_page), "nr_subpages_per_page")?;
        nonzero(self.subpage_size as u64, "subpage_size")?;
        if self.gc_threshold_pct > 100 {
            return Err(GeometryError::InvalidField {
                field: "gc_threshold_pct",
                reason: "must be <= 100",
            });
        }
        let subpages = u64::from(self.nr_punits())
            * u64::from(self.nr_blocks_per_chip)
            * u64::from(self.nr_pages_per_block)
            * u64::from(self.nr_subpages_per_page);
        // u32::MAX is reserved as the OOB "unmapped" sentinel, and the top
        // nr_blocks_total() values below it as synthetic per-block queue
        // keys for requests with no logical address.
        if subpages >= u64::from(u32::MAX) - self.nr_blocks_total() {
            return Err(GeometryError::InvalidField {
                field: "geometry",
                reason: "subpage address space must fit u32 below the reserved block keys",
            });
        }
        Ok(())
    }

    /// Number of parallel units (channel x chip combinations).
    #[must_use]
    pub fn nr_punits(&self) -> u32 {
        self.nr_channels * self.nr_chips_per_channel
    }

    /// Total number of physical blocks across all parallel units.
    #[must_use]
    pub fn nr_blocks_total(&self) -> u64 {
        u64::from(self.nr_punits()) * u64::from(self.nr_blocks_per_chip)
    }

    /// Bytes in one full flash page.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.subpage_size * self.nr_subpages_per_page as usize
    }

    /// Ceiling on dirty subpage-granularity blocks before the fine-grain
    /// reclamation path kicks in (one sixth of the blocks of a punit, the
    /// reference sizing policy).
    #[must_use]
    pub fn nr_max_dirty_subpage_blks(&self) -> u32 {
        (self.nr_blocks_per_chip / 6).max(1)
    }
}

/// Logical page address, in subpage units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lpa(pub u32);

impl Lpa {
    /// Coarse-grained (flash page) index this subpage belongs to.
    #[must_use]
    pub fn coarse(self, geo: &Geometry) -> u32 {
        self.0 / geo.nr_subpages_per_page
    }

    /// Slot of this subpage within its flash page.
    #[must_use]
    pub fn slot(self, geo: &Geometry) -> usize {
        (self.0 % geo.nr_subpages_per_page) as usize
    }
}

/// Parallel-unit identity: `channel * chips_per_channel + chip`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PunitId(pub u32);

/// Physical NAND location.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct PhysAddr {
    pub channel: u32,
    pub chip: u32,
    pub block: u32,
    pub page: u32,
}

impl PhysAddr {
    /// The all-zero address, returned with miss status for never-written
    /// LPAs. Callers must not treat its payload as real data.
    pub const ZERO: Self = Self {
        channel: 0,
        chip: 0,
        block: 0,
        page: 0,
    };

    #[must_use]
    pub fn new(channel: u32, chip: u32, block: u32, page: u32) -> Self {
        Self {
            channel,
            chip,
            block,
            page,
        }
    }

    /// Build an address from a punit identity plus block/page.
    #[must_use]
    pub fn from_punit(punit: PunitId, geo: &Geometry, block: u32, page: u32) -> Self {
        Self {
            channel: punit.0 / geo.nr_chips_per_channel,
            chip: punit.0 % geo.nr_chips_per_channel,
            block,
            page,
        }
    }

    /// Scheduling unit this address belongs to.
    #[must_use]
    pub fn punit(&self, geo: &Geometry) -> PunitId {
        PunitId(self.channel * geo.nr_chips_per_channel + self.chip)
    }
}

/// Logical address of one low-level request.
///
/// `subpages[i]` is the subpage LPA destined for slot `i` of the target
/// flash page, or `None` for a hole. `lpa_cg` marks the request as
/// coarse-grained (a whole flash page belonging to one coarse page); a
/// `None` there means fine-grained, even when the subpages happen to form a
/// full coarse page (garbage collection relocates coarse pages through the
/// fine-grained path that way). `ofs` is the subpage column picked for a
/// fine-grained single-subpage write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAddr {
    pub lpa_cg: Option<u32>,
    pub subpages: Vec<Option<Lpa>>,
    pub ofs: u8,
}

impl LogAddr {
    /// An all-hole address with one slot per subpage of a flash page.
    #[must_use]
    pub fn empty(geo: &Geometry) -> Self {
        Self {
            lpa_cg: None,
            subpages: vec![None; geo.nr_subpages_per_page as usize],
            ofs: 0,
        }
    }

    /// Coarse-grained address covering the whole flash page `cg`: slot `i`
    /// holds subpage `cg * nr_subpages_per_page + i`.
    #[must_use]
    pub fn coarse_page(cg: u32, geo: &Geometry) -> Self {
        let spp = geo.nr_subpages_per_page;
        Self {
            lpa_cg: Some(cg),
            subpages: (0..spp).map(|i| Some(Lpa(cg * spp + i))).collect(),
            ofs: 0,
        }
    }

    /// Fine-grained address for a single subpage at column `ofs`.
    #[must_use]
    pub fn fine(lpa: Lpa, ofs: u8, geo: &Geometry) -> Self {
        let mut la = Self::empty(geo);
        la.subpages[ofs as usize] = Some(lpa);
        la.ofs = ofs;
        la
    }

    /// First present subpage LPA, if any.
    #[must_use]
    pub fn first_lpa(&self) -> Option<Lpa> {
        self.subpages.iter().flatten().next().copied()
    }

    /// Number of present subpages.
    #[must_use]
    pub fn nr_present(&self) -> usize {
        self.subpages.iter().flatten().count()
    }

    /// Coarse page shared by every present subpage, if they all agree.
    ///
    /// This is the "pure relocation" test: a fine-grained batch whose
    /// subpages all belong to one coarse page is really a coarse write
    /// smuggled through the fine-grained path, and must not re-invalidate
    /// the coarse columns it is relocating.
    #[must_use]
    pub fn common_coarse(&self, geo: &Geometry) -> Option<u32> {
        let mut it = self.subpages.iter().flatten();
        let first = it.next()?.coarse(geo);
        if it.all(|lpa| lpa.coarse(geo) == first) {
            Some(first)
        } else {
            None
        }
    }

    /// True when the batch is exactly the full coarse page `cg`: every slot
    /// `i` present and holding `cg * spp + i`.
    #[must_use]
    pub fn is_full_coarse_page(&self, geo: &Geometry) -> Option<u32> {
        let spp = geo.nr_subpages_per_page;
        if self.subpages.len() != spp as usize {
            return None;
        }
        let cg = self.common_coarse(geo)?;
        for (i, sp) in self.subpages.iter().enumerate() {
            if *sp != Some(Lpa(cg * spp + i as u32)) {
                return None;
            }
        }
        Some(cg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(2, 2, 16, 8, 4, 32).expect("geometry")
    }

    #[test]
    fn geometry_rejects_zero_fields() {
        assert!(Geometry::new(0, 2, 16, 8, 4, 32).is_err());
        assert!(Geometry::new(2, 2, 16, 8, 0, 32).is_err());
        assert!(Geometry::new(2, 2, 16, 8, 4, 0).is_err());
    }

    #[test]
    fn geometry_reserves_key_space_for_block_addresses() {
        // Fits under u32::MAX on its own, but collides with the per-block
        // key range reserved at the top of the address space.
        assert!(Geometry::new(1, 1, u32::MAX - 10, 1, 1, 8).is_err());
    }

    #[test]
    fn geometry_derived_counts() {
        let g = geo();
        assert_eq!(g.nr_punits(), 4);
        assert_eq!(g.nr_blocks_total(), 64);
        assert_eq!(g.page_size(), 128);
        assert_eq!(g.nr_max_dirty_subpage_blks(), 2);
    }

    #[test]
    fn punit_round_trip() {
        let g = geo();
        for punit in 0..g.nr_punits() {
            let addr = PhysAddr::from_punit(PunitId(punit), &g, 3, 5);
            assert_eq!(addr.punit(&g), PunitId(punit));
        }
    }

    #[test]
    fn coarse_page_rule() {
        let g = geo();
        let la = LogAddr::coarse_page(25, &g);
        assert_eq!(la.lpa_cg, Some(25));
        assert_eq!(la.is_full_coarse_page(&g), Some(25));
        assert_eq!(la.subpages[0], Some(Lpa(100)));
        assert_eq!(la.subpages[3], Some(Lpa(103)));

        // A hole breaks the full-coarse rule but not the common-coarse one.
        let mut partial = la.clone();
        partial.lpa_cg = None;
        partial.subpages[2] = None;
        assert_eq!(partial.is_full_coarse_page(&g), None);
        assert_eq!(partial.common_coarse(&g), Some(25));
    }

    #[test]
    fn mixed_batch_has_no_common_coarse() {
        let g = geo();
        let mut la = LogAddr::empty(&g);
        la.subpages[0] = Some(Lpa(100));
        la.subpages[1] = Some(Lpa(205));
        assert_eq!(la.common_coarse(&g), None);
        assert_eq!(la.first_lpa(), Some(Lpa(100)));
        assert_eq!(la.nr_present(), 2);
    }

    #[test]
    fn lpa_coarse_and_slot() {
        let g = geo();
        assert_eq!(Lpa(103).coarse(&g), 25);
        assert_eq!(Lpa(103).slot(&g), 3);
    }
}
