//! Garbage collection: coarse victim reclamation and fine-grain
//! (subpage-block) reclamation.
//!
//! Both paths share one mechanism, read-relocate-write-erase driven
//! through the low-level scheduler, and differ only in victim selection.
//! The FTL lock is held while mutating metadata, never while waiting on
//! device I/O, so foreground traffic proceeds between the phases.

use crate::abm::SubpageState;
use crate::{Ftl, FtlInner};
use nftl_error::{FtlError, Result};
use nftl_llm::req::{LlmReq, ReqBatch, ReqKind};
use nftl_llm::Scheduler;
use nftl_types::{LogAddr, PhysAddr, PunitId};
use std::cmp::Ordering;
use std::sync::Arc;

/// Outcome of one coarse GC round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Victim blocks erased this round (zero when the round was skipped).
    pub nr_victims: usize,
    /// Subpages copied to fresh locations.
    pub nr_relocated: usize,
    /// Victims whose erase failed and were marked bad.
    pub nr_bad_blocks: usize,
}

/// Outcome of one fine-grain reclamation round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    pub nr_reclaimed: usize,
    pub nr_relocated: usize,
}

/// Ranking for fine-grain victim selection: blocks further along their
/// column sweep win, ties broken by the invalid count within the first
/// still-live column. A block fully done with its current column
/// outranks one whose column is still live.
#[must_use]
pub fn compare_fine_victims(a: (u32, u32), b: (u32, u32)) -> Ordering {
    a.0.cmp(&b.0).then(a.1.cmp(&b.1))
}

impl Ftl {
    /// One coarse GC round: greedily pick the dirtiest block per punit,
    /// relocate every still-valid subpage, erase the victims.
    ///
    /// Skips the whole round (returning zeroed stats) when any punit has no
    /// victim to offer; reclaiming a lopsided subset would unbalance the
    /// punits further.
    pub fn do_gc(&self, sched: &Scheduler) -> Result<GcStats> {
        // One round at a time; a second caller waits and then sees the
        // first round's victims already erased.
        let _round = self.gc_gate.lock();
        let victims = {
            let inner = self.inner.lock();
            let mut victims = Vec::new();
            for p in 0..self.geo.nr_punits() {
                let punit = PunitId(p);
                let best = inner
                    .abm
                    .dirty_blocks(punit)
                    .filter(|block| !inner.map.is_gc_exempt(punit, *block))
                    .map(|block| {
                        let nr = inner.abm.nr_invalid(punit, block).unwrap_or(0);
                        (block, nr)
                    })
                    .max_by_key(|(_, nr)| *nr);
                match best {
                    Some((block, _)) => victims.push((punit, block)),
                    None => {
                        tracing::debug!(punit = p, "no victim on punit, skipping gc round");
                        return Ok(GcStats::default());
                    }
                }
            }
            victims
        };
        tracing::debug!(nr_victims = victims.len(), "gc round start");

        let pages = {
            let inner = self.inner.lock();
            self.live_pages_of(&inner, &victims)?
        };
        let nr_relocated = self.relocate_pages(sched, pages)?;

        // Every valid subpage now has its single copy elsewhere; erase the
        // victims and report bad blocks to the manager.
        let batch = ReqBatch::new(victims.len());
        for (punit, block) in &victims {
            let phys = PhysAddr::from_punit(*punit, &self.geo, *block, 0);
            let mut req = LlmReq::new(ReqKind::GcErase, LogAddr::empty(&self.geo), phys, &self.geo);
            req.batch = Some(Arc::clone(&batch));
            sched.make_req(req)?;
        }
        let results = batch.take_results();

        let mut stats = GcStats {
            nr_victims: victims.len(),
            nr_relocated,
            nr_bad_blocks: 0,
        };
        let mut inner = self.inner.lock();
        for req in results {
            let punit = req.phys.punit(&self.geo);
            let is_bad = req.ret != 0;
            inner.abm.erase_block(punit, req.phys.block, is_bad)?;
            if is_bad {
                stats.nr_bad_blocks += 1;
            }
        }
        tracing::debug!(?stats, "gc round done");
        Ok(stats)
    }

    /// True once any punit's released subpage-block count exceeds the
    /// sizing threshold.
    #[must_use]
    pub fn is_reclaim_needed(&self) -> bool {
        let inner = self.inner.lock();
        let cap = self.geo.nr_max_dirty_subpage_blks() as usize;
        (0..self.geo.nr_punits()).any(|p| inner.map.dirty_fine_blocks(PunitId(p)).len() > cap)
    }

    /// Reclaim one subpage-granularity block per punit over the threshold:
    /// relocate its live subpages, erase it, and hand it back — directly
    /// into the punit's fine active-block slot when that slot is open for
    /// rotation, into the free pool otherwise.
    pub fn reclaim_subpage_blocks(&self, sched: &Scheduler) -> Result<ReclaimStats> {
        let _round = self.gc_gate.lock();
        let cap = self.geo.nr_max_dirty_subpage_blks() as usize;
        let victims = {
            let inner = self.inner.lock();
            let mut victims = Vec::new();
            for p in 0..self.geo.nr_punits() {
                let punit = PunitId(p);
                let candidates = inner.map.dirty_fine_blocks(punit);
                if candidates.len() <= cap {
                    continue;
                }
                let last_col = self.geo.nr_subpages_per_page - 1;
                let best = candidates
                    .iter()
                    .copied()
                    .map(|block| {
                        let col = inner.abm.first_live_column(punit, block).unwrap_or(0);
                        let inv = inner
                            .abm
                            .invalid_in_column(punit, block, col.min(last_col))
                            .unwrap_or(0);
                        (block, (col, inv))
                    })
                    .max_by(|a, b| compare_fine_victims(a.1, b.1));
                if let Some((block, rank)) = best {
                    tracing::debug!(punit = p, block, ?rank, "fine reclamation victim");
                    victims.push((punit, block));
                }
            }
            victims
        };
        if victims.is_empty() {
            return Ok(ReclaimStats::default());
        }

        let pages = {
            let inner = self.inner.lock();
            self.live_pages_of(&inner, &victims)?
        };
        let nr_relocated = self.relocate_pages(sched, pages)?;

        let batch = ReqBatch::new(victims.len());
        for (punit, block) in &victims {
            let phys = PhysAddr::from_punit(*punit, &self.geo, *block, 0);
            let mut req = LlmReq::new(ReqKind::GcErase, LogAddr::empty(&self.geo), phys, &self.geo);
            req.batch = Some(Arc::clone(&batch));
            sched.make_req(req)?;
        }
        let results = batch.take_results();

        let mut stats = ReclaimStats {
            nr_reclaimed: 0,
            nr_relocated,
        };
        let mut inner = self.inner.lock();
        for req in results {
            let punit = req.phys.punit(&self.geo);
            let block = req.phys.block;
            let is_bad = req.ret != 0;
            inner.map.retire_dirty_fine(punit, block);
            inner.abm.erase_block(punit, block, is_bad)?;
            if is_bad {
                continue;
            }
            stats.nr_reclaimed += 1;
            if inner.map.fine_active_needs_block(punit) {
                let FtlInner { abm, map } = &mut *inner;
                map.install_fine_active(abm, punit, block)?;
            }
        }
        tracing::debug!(?stats, "fine reclamation done");
        Ok(stats)
    }

    /// Pages of the victim blocks that still carry at least one valid
    /// subpage at selection time.
    fn live_pages_of(&self, inner: &FtlInner, victims: &[(PunitId, u32)]) -> Result<Vec<PhysAddr>> {
        let mut pages = Vec::new();
        for (punit, block) in victims {
            for page in 0..self.geo.nr_pages_per_block {
                let phys = PhysAddr::from_punit(*punit, &self.geo, *block, page);
                let slots = inner.abm.page_slots(phys)?;
                if slots.iter().any(|sp| *sp == SubpageState::Valid) {
                    pages.push(phys);
                }
            }
        }
        Ok(pages)
    }

    /// Read the given pages, then remap and rewrite every valid subpage.
    /// LPAs are re-derived from the OOB metadata read back from the device.
    /// Returns the number of subpages relocated.
    fn relocate_pages(&self, sched: &Scheduler, pages: Vec<PhysAddr>) -> Result<usize> {
        if pages.is_empty() {
            return Ok(0);
        }
        let batch = ReqBatch::new(pages.len());
        for phys in &pages {
            let mut req = LlmReq::new(ReqKind::GcRead, LogAddr::empty(&self.geo), *phys, &self.geo);
            req.batch = Some(Arc::clone(&batch));
            sched.make_req(req)?;
        }
        let reads = batch.take_results();
        if let Some(ret) = reads.iter().map(|req| req.ret).find(|ret| *ret != 0) {
            return Err(FtlError::Device {
                ret,
                detail: "gc relocation read failed".into(),
            });
        }

        let mut writes = Vec::new();
        let mut nr_relocated = 0_usize;
        {
            let mut inner = self.inner.lock();
            for read in &reads {
                nr_relocated += self.plan_relocation(&mut inner, read, &mut writes)?;
            }
        }
        if writes.is_empty() {
            return Ok(0);
        }
        let batch = ReqBatch::new(writes.len());
        for mut req in writes {
            req.batch = Some(Arc::clone(&batch));
            sched.make_req(req)?;
        }
        let results = batch.take_results();
        if let Some(ret) = results.iter().map(|req| req.ret).find(|ret| *ret != 0) {
            return Err(FtlError::Device {
                ret,
                detail: "gc relocation write failed".into(),
            });
        }
        Ok(nr_relocated)
    }

    /// Remap the valid subpages of one read-back page and stage the
    /// relocation writes. A fully-valid page whose subpages form one coarse
    /// page moves as a whole through the batch path; anything else moves
    /// subpage by subpage through the fine path.
    fn plan_relocation(
        &self,
        inner: &mut FtlInner,
        read: &LlmReq,
        writes: &mut Vec<LlmReq>,
    ) -> Result<usize> {
        let FtlInner { abm, map } = inner;
        let spp = self.geo.nr_subpages_per_page as usize;

        // The lock was dropped during the read; a foreground overwrite in
        // that window invalidated its slot here. Re-read the slot states
        // now, under the lock, so the stale copy is skipped rather than
        // remapped over the newer data.
        let slots = abm.page_slots(read.phys)?;

        let mut la = LogAddr::empty(&self.geo);
        for slot in 0..spp {
            if slots[slot] == SubpageState::Valid {
                la.subpages[slot] = Some(read.oob.get(slot).ok_or_else(|| {
                    FtlError::Codec(format!(
                        "oob carries no lpa for valid subpage {slot} of {:?}",
                        read.phys
                    ))
                })?);
            }
        }

        if la.is_full_coarse_page(&self.geo).is_some() {
            // Whole-page relocation: allocate coarse space, but keep the
            // batch fine-shaped so the mapping layer treats it as a pure
            // relocation and restores the coarse entry.
            let mut alloc = la.clone();
            alloc.lpa_cg = la.common_coarse(&self.geo);
            let phys_new = map.get_free_ppa(abm, &mut alloc)?;
            map.map_lpa_to_ppa(abm, &la, phys_new)?;
            let mut req = LlmReq::new(ReqKind::GcWrite, la, phys_new, &self.geo);
            req.data.copy_from_slice(&read.data);
            writes.push(req);
            return Ok(spp);
        }

        let mut nr = 0_usize;
        for slot in 0..spp {
            let Some(lpa) = la.subpages[slot] else {
                continue;
            };
            let mut fine = LogAddr::fine(lpa, 0, &self.geo);
            let phys_new = map.get_free_ppa(abm, &mut fine)?;
            let fine = LogAddr::fine(lpa, fine.ofs, &self.geo);
            map.map_lpa_to_ppa(abm, &fine, phys_new)?;
            let ofs = fine.ofs as usize;
            let mut req = LlmReq::new(ReqKind::GcWrite, fine, phys_new, &self.geo);
            let src = slot * self.geo.subpage_size;
            let dst = ofs * self.geo.subpage_size;
            req.data[dst..dst + self.geo.subpage_size]
                .copy_from_slice(&read.data[src..src + self.geo.subpage_size]);
            writes.push(req);
            nr += 1;
        }
        Ok(nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fine_victim_comparator_orders_coherently() {
        // Further-along column sweep wins outright.
        assert_eq!(compare_fine_victims((2, 0), (0, 7)), Ordering::Greater);
        assert_eq!(compare_fine_victims((1, 3), (3, 0)), Ordering::Less);
        // Tie on column: more invalid pages in the live column wins.
        assert_eq!(compare_fine_victims((1, 5), (1, 2)), Ordering::Greater);
        assert_eq!(compare_fine_victims((1, 2), (1, 2)), Ordering::Equal);
    }
}
