//! Coarse/fine dual-granularity mapping table and active-block rotation.
//!
//! The coarse table holds one entry per flash page's worth of logical
//! space. The fine table is a hash overlay for subpages whose most recent
//! write lives in a subpage-granularity active block; a fine entry, when
//! present, is authoritative over the coarse entry for that exact LPA.
//!
//! Invariant: at any instant an LPA has at most one authoritative
//! physical location. Every mapping update here invalidates the previous
//! location through the block manager before recording the new one.
//!
//! Not internally synchronized; the FTL serializes access under its own
//! lock.

use crate::abm::{BlockManager, SubpageState};
use nftl_error::{FtlError, Result};
use nftl_types::{Geometry, LogAddr, Lpa, PhysAddr, PunitId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoarseStatus {
    NotAllocated,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
struct CoarseEntry {
    status: CoarseStatus,
    phys: PhysAddr,
}

#[derive(Debug, Clone, Copy)]
struct FineEntry {
    phys: PhysAddr,
    ofs: u8,
}

/// Page-offset cursor into the coarse active block of one punit.
#[derive(Debug, Clone, Copy)]
struct CoarseCursor {
    block: u32,
    page: u32,
}

/// Column-major cursor into the fine-grain active block of one punit:
/// fills slot `col` of every page before moving to the next column.
#[derive(Debug, Clone, Copy)]
struct FineCursor {
    block: u32,
    page: u32,
    col: u32,
}

/// The dual-granularity mapping table.
#[derive(Debug)]
pub struct MappingTable {
    geo: Geometry,
    coarse: Vec<CoarseEntry>,
    fine: HashMap<Lpa, FineEntry>,
    ac_coarse: Vec<Option<CoarseCursor>>,
    ac_fine: Vec<Option<FineCursor>>,
    /// Punit round-robin cursors for the two allocators.
    next_punit_coarse: u32,
    next_punit_fine: u32,
    /// Released (full) fine-grain blocks per punit, oldest first. These are
    /// the candidates for fine-grain reclamation and are excluded from
    /// coarse GC victim selection.
    dirty_fine: Vec<Vec<u32>>,
}

impl MappingTable {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        let nr_coarse = (geo.nr_blocks_total() * u64::from(geo.nr_pages_per_block)) as usize;
        let nr_punits = geo.nr_punits() as usize;
        Self {
            geo,
            coarse: vec![
                CoarseEntry {
                    status: CoarseStatus::NotAllocated,
                    phys: PhysAddr::ZERO,
                };
                nr_coarse
            ],
            fine: HashMap::new(),
            ac_coarse: vec![None; nr_punits],
            ac_fine: vec![None; nr_punits],
            next_punit_coarse: 0,
            next_punit_fine: 0,
            dirty_fine: vec![Vec::new(); nr_punits],
        }
    }

    /// Number of coarse entries (the logical capacity in flash pages).
    #[must_use]
    pub fn nr_coarse_entries(&self) -> usize {
        self.coarse.len()
    }

    fn coarse_entry(&self, cg: u32) -> Result<&CoarseEntry> {
        self.coarse
            .get(cg as usize)
            .ok_or_else(|| FtlError::Misaligned(format!("coarse page {cg} out of range")))
    }

    fn coarse_entry_mut(&mut self, cg: u32) -> Result<&mut CoarseEntry> {
        self.coarse
            .get_mut(cg as usize)
            .ok_or_else(|| FtlError::Misaligned(format!("coarse page {cg} out of range")))
    }

    // -- allocation --------------------------------------------------------

    /// Allocate physical space for one request, advancing the round-robin
    /// punit cursor. Coarse requests get the next whole page of a coarse
    /// active block; fine requests get the next subpage slot of a fine
    /// active block, recorded in `la.ofs`.
    ///
    /// A failed allocation leaves the mapping untouched; callers never see
    /// a zeroed address standing in for failure.
    pub fn get_free_ppa(&mut self, abm: &mut BlockManager, la: &mut LogAddr) -> Result<PhysAddr> {
        if la.lpa_cg.is_some() {
            let punit = PunitId(self.next_punit_coarse);
            self.next_punit_coarse = (self.next_punit_coarse + 1) % self.geo.nr_punits();
            self.alloc_coarse(abm, punit)
        } else {
            let punit = PunitId(self.next_punit_fine);
            self.next_punit_fine = (self.next_punit_fine + 1) % self.geo.nr_punits();
            let (phys, ofs) = self.alloc_fine(abm, punit)?;
            la.ofs = ofs;
            Ok(phys)
        }
    }

    fn alloc_coarse(&mut self, abm: &mut BlockManager, punit: PunitId) -> Result<PhysAddr> {
        let cursor = match self.ac_coarse[punit.0 as usize] {
            Some(cursor) if cursor.page < self.geo.nr_pages_per_block => cursor,
            stale => {
                // Release before preparing, and clear the slot first so a
                // failed preparation cannot release the same block twice.
                self.ac_coarse[punit.0 as usize] = None;
                if let Some(full) = stale {
                    abm.release_active(punit, full.block)?;
                }
                let block = abm.get_free_block_prepare(punit)?;
                abm.get_free_block_commit(punit, block)?;
                CoarseCursor { block, page: 0 }
            }
        };
        self.ac_coarse[punit.0 as usize] = Some(CoarseCursor {
            block: cursor.block,
            page: cursor.page + 1,
        });
        Ok(PhysAddr::from_punit(punit, &self.geo, cursor.block, cursor.page))
    }

    fn alloc_fine(&mut self, abm: &mut BlockManager, punit: PunitId) -> Result<(PhysAddr, u8)> {
        let cursor = match self.ac_fine[punit.0 as usize] {
            Some(cursor) if cursor.col < self.geo.nr_subpages_per_page => cursor,
            stale => {
                self.ac_fine[punit.0 as usize] = None;
                if let Some(full) = stale {
                    abm.release_active(punit, full.block)?;
                    self.dirty_fine[punit.0 as usize].push(full.block);
                }
                let block = abm.get_free_block_prepare(punit)?;
                abm.get_free_block_commit(punit, block)?;
                FineCursor {
                    block,
                    page: 0,
                    col: 0,
                }
            }
        };
        let next = if cursor.page + 1 < self.geo.nr_pages_per_block {
            FineCursor {
                page: cursor.page + 1,
                ..cursor
            }
        } else {
            FineCursor {
                page: 0,
                col: cursor.col + 1,
                ..cursor
            }
        };
        self.ac_fine[punit.0 as usize] = Some(next);
        Ok((
            PhysAddr::from_punit(punit, &self.geo, cursor.block, cursor.page),
            cursor.col as u8,
        ))
    }

    /// True when the punit's fine active slot is empty or fully swept, so
    /// a reclaimed block can be installed without evicting live space.
    #[must_use]
    pub fn fine_active_needs_block(&self, punit: PunitId) -> bool {
        match self.ac_fine[punit.0 as usize] {
            None => true,
            Some(cursor) => cursor.col >= self.geo.nr_subpages_per_page,
        }
    }

    /// Install an erased block as the fine-grain active block of `punit`,
    /// releasing the exhausted current one into the dirty-fine list first.
    /// Fine-grain reclamation uses this to recycle victims directly instead
    /// of routing them through the free pool.
    pub fn install_fine_active(
        &mut self,
        abm: &mut BlockManager,
        punit: PunitId,
        block: u32,
    ) -> Result<()> {
        if let Some(old) = self.ac_fine[punit.0 as usize].take() {
            abm.release_active(punit, old.block)?;
            self.dirty_fine[punit.0 as usize].push(old.block);
        }
        abm.claim_block(punit, block)?;
        self.ac_fine[punit.0 as usize] = Some(FineCursor {
            block,
            page: 0,
            col: 0,
        });
        Ok(())
    }

    /// Blocks the coarse GC path must not pick as victims: active blocks
    /// plus the dirty-fine blocks owned by the reclamation path.
    pub fn is_gc_exempt(&self, punit: PunitId, block: u32) -> bool {
        let p = punit.0 as usize;
        if self.ac_coarse[p].is_some_and(|cursor| cursor.block == block) {
            return true;
        }
        if self.ac_fine[p].is_some_and(|cursor| cursor.block == block) {
            return true;
        }
        self.dirty_fine[p].contains(&block)
    }

    #[must_use]
    pub fn nr_dirty_fine_blocks(&self) -> usize {
        self.dirty_fine.iter().map(Vec::len).sum()
    }

    pub fn dirty_fine_blocks(&self, punit: PunitId) -> &[u32] {
        &self.dirty_fine[punit.0 as usize]
    }

    /// Drop a reclaimed block from the dirty-fine list.
    pub fn retire_dirty_fine(&mut self, punit: PunitId, block: u32) {
        self.dirty_fine[punit.0 as usize].retain(|entry| *entry != block);
    }

    // -- mapping updates ---------------------------------------------------

    /// Record the mapping for a completed allocation.
    ///
    /// Coarse requests supersede the previous coarse entry and any fine
    /// overlays for the page's subpages. Fine requests supersede the
    /// previous fine entry for that exact LPA, or the duplicated coarse
    /// column when the LPA was coarse-mapped; a fine batch that is really a
    /// whole coarse page (garbage collection relocating a page through the
    /// fine path) restores the coarse mapping instead.
    pub fn map_lpa_to_ppa(
        &mut self,
        abm: &mut BlockManager,
        la: &LogAddr,
        phys: PhysAddr,
    ) -> Result<()> {
        if let Some(cg) = la.lpa_cg {
            return self.map_coarse(abm, cg, phys);
        }
        if let Some(cg) = la.is_full_coarse_page(&self.geo) {
            // Pure relocation batch: a coarse page smuggled through the
            // fine path. Restore the coarse mapping; the columns being
            // relocated must not be re-invalidated as duplicates.
            return self.map_coarse(abm, cg, phys);
        }
        let lpa = la
            .first_lpa()
            .ok_or_else(|| FtlError::Misaligned("fine mapping with no subpage".into()))?;
        self.map_fine(abm, lpa, phys, la.ofs)
    }

    fn map_coarse(&mut self, abm: &mut BlockManager, cg: u32, phys: PhysAddr) -> Result<()> {
        let spp = self.geo.nr_subpages_per_page;
        let old = *self.coarse_entry(cg)?;
        if old.status == CoarseStatus::Valid {
            for slot in 0..spp as usize {
                abm.invalidate(old.phys, slot)?;
            }
        }
        // Fine overlays for these subpages are superseded too.
        for slot in 0..spp {
            let lpa = Lpa(cg * spp + slot);
            if let Some(entry) = self.fine.remove(&lpa) {
                abm.invalidate(entry.phys, entry.ofs as usize)?;
            }
        }
        for slot in 0..spp as usize {
            abm.mark_valid(phys, slot)?;
        }
        *self.coarse_entry_mut(cg)? = CoarseEntry {
            status: CoarseStatus::Valid,
            phys,
        };
        Ok(())
    }

    fn map_fine(
        &mut self,
        abm: &mut BlockManager,
        lpa: Lpa,
        phys: PhysAddr,
        ofs: u8,
    ) -> Result<()> {
        if let Some(old) = self.fine.get(&lpa).copied() {
            abm.invalidate(old.phys, old.ofs as usize)?;
        } else {
            // No fine entry: the coarse column (if mapped) is the previous
            // authoritative copy.
            self.invalidate_coarse_column(abm, lpa)?;
        }
        abm.mark_valid(phys, ofs as usize)?;
        self.fine.insert(lpa, FineEntry { phys, ofs });
        Ok(())
    }

    fn invalidate_coarse_column(&mut self, abm: &mut BlockManager, lpa: Lpa) -> Result<()> {
        let cg = lpa.coarse(&self.geo);
        let entry = *self.coarse_entry(cg)?;
        if entry.status != CoarseStatus::Valid {
            return Ok(());
        }
        abm.invalidate(entry.phys, lpa.slot(&self.geo))?;
        let all_dead = abm
            .page_slots(entry.phys)?
            .iter()
            .all(|sp| *sp != SubpageState::Valid);
        if all_dead {
            self.coarse_entry_mut(cg)?.status = CoarseStatus::Invalid;
        }
        Ok(())
    }

    // -- lookup ------------------------------------------------------------

    /// Translate a logical address: fine hash first (authoritative), coarse
    /// fallback only for single-subpage lookups. `None` is the defined miss
    /// for a never-written LPA; callers must not fabricate payload for it.
    pub fn get_ppa(&self, la: &LogAddr) -> Option<(PhysAddr, u8)> {
        for lpa in la.subpages.iter().flatten() {
            if let Some(entry) = self.fine.get(lpa) {
                return Some((entry.phys, entry.ofs));
            }
        }
        if la.nr_present() != 1 {
            return None;
        }
        let lpa = la.first_lpa()?;
        let entry = self.coarse.get(lpa.coarse(&self.geo) as usize)?;
        if entry.status != CoarseStatus::Valid {
            return None;
        }
        Some((entry.phys, lpa.slot(&self.geo) as u8))
    }

    /// TRIM: invalidate `[lpa, lpa + len)` subpage addresses across both
    /// tables.
    pub fn invalidate_lpa(&mut self, abm: &mut BlockManager, lpa: Lpa, len: u32) -> Result<()> {
        for off in 0..len {
            let cur = Lpa(lpa.0 + off);
            if let Some(entry) = self.fine.remove(&cur) {
                abm.invalidate(entry.phys, entry.ofs as usize)?;
            } else {
                self.invalidate_coarse_column(abm, cur)?;
            }
        }
        Ok(())
    }

    /// True when any subpage of coarse page `cg` has a fine overlay entry.
    /// A read-modify-write merge from the coarse location is only sound
    /// when this is false; otherwise the overlay holds newer data than the
    /// coarse page.
    #[must_use]
    pub fn has_fine_in_page(&self, cg: u32) -> bool {
        let spp = self.geo.nr_subpages_per_page;
        (0..spp).any(|slot| self.fine.contains_key(&Lpa(cg * spp + slot)))
    }

    /// True when `lpa` currently has an authoritative mapping.
    #[must_use]
    pub fn is_mapped(&self, lpa: Lpa) -> bool {
        if self.fine.contains_key(&lpa) {
            return true;
        }
        self.coarse
            .get(lpa.coarse(&self.geo) as usize)
            .is_some_and(|entry| entry.status == CoarseStatus::Valid)
    }

    /// Authoritative mapping count for one LPA: fine entry plus a coarse
    /// entry whose column for this LPA is still valid. The at-most-one
    /// invariant says this never exceeds 1; exposed for tests.
    pub fn nr_authoritative(&self, abm: &BlockManager, lpa: Lpa) -> Result<usize> {
        let mut n = usize::from(self.fine.contains_key(&lpa));
        if let Some(entry) = self.coarse.get(lpa.coarse(&self.geo) as usize) {
            if entry.status == CoarseStatus::Valid {
                let slots = abm.page_slots(entry.phys)?;
                if slots[lpa.slot(&self.geo)] == SubpageState::Valid {
                    n += 1;
                }
            }
        }
        Ok(n)
    }
}
