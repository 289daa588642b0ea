//! Block-status manager: per-block and per-subpage bookkeeping.
//!
//! Owns the state machine every physical block moves through:
//!
//! ```text
//! Free -> Active -> Used -> Dirty -> (erase) -> Free
//!                     \------------> (bad erase) -> Bad
//! ```
//!
//! `Active` blocks are currently being filled by the mapping layer's
//! cursors and are never garbage-collection victims. A released block is
//! `Used` while fully live and becomes `Dirty` the moment one of its
//! subpages is invalidated. `Bad` blocks never return to the free pool.
//!
//! Not internally synchronized; the FTL serializes access under its own
//! lock.

use nftl_error::{FtlError, Result};
use nftl_types::{Geometry, PhysAddr, PunitId};
use std::collections::VecDeque;

/// Lifecycle state of one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Active,
    Used,
    Dirty,
    Bad,
}

/// State of one subpage within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpageState {
    Free,
    Valid,
    Invalid,
}

#[derive(Debug)]
struct BlockRecord {
    state: BlockState,
    erase_count: u32,
    /// Indexed `page * nr_subpages_per_page + slot`.
    subpages: Vec<SubpageState>,
    nr_invalid: u32,
}

impl BlockRecord {
    fn new(nr_subpages: usize) -> Self {
        Self {
            state: BlockState::Free,
            erase_count: 0,
            subpages: vec![SubpageState::Free; nr_subpages],
            nr_invalid: 0,
        }
    }
}

/// Per-punit block records plus free-list allocation.
#[derive(Debug)]
pub struct BlockManager {
    geo: Geometry,
    /// Indexed `[punit][block]`.
    blocks: Vec<Vec<BlockRecord>>,
    free_lists: Vec<VecDeque<u32>>,
    nr_free: usize,
}

impl BlockManager {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        let nr_punits = geo.nr_punits() as usize;
        let per_block = (geo.nr_pages_per_block * geo.nr_subpages_per_page) as usize;
        Self {
            geo,
            blocks: (0..nr_punits)
                .map(|_| {
                    (0..geo.nr_blocks_per_chip)
                        .map(|_| BlockRecord::new(per_block))
                        .collect()
                })
                .collect(),
            free_lists: (0..nr_punits)
                .map(|_| (0..geo.nr_blocks_per_chip).collect())
                .collect(),
            nr_free: geo.nr_blocks_total() as usize,
        }
    }

    fn record(&self, punit: PunitId, block: u32) -> Result<&BlockRecord> {
        self.blocks
            .get(punit.0 as usize)
            .and_then(|chip| chip.get(block as usize))
            .ok_or_else(|| FtlError::BlockState(format!("no block {}/{block}", punit.0)))
    }

    fn record_mut(&mut self, punit: PunitId, block: u32) -> Result<&mut BlockRecord> {
        self.blocks
            .get_mut(punit.0 as usize)
            .and_then(|chip| chip.get_mut(block as usize))
            .ok_or_else(|| FtlError::BlockState(format!("no block {}/{block}", punit.0)))
    }

    fn subpage_index(&self, page: u32, slot: usize) -> usize {
        (page * self.geo.nr_subpages_per_page) as usize + slot
    }

    /// Take the next free block of `punit` out of the free pool and mark it
    /// active. The paired [`BlockManager::get_free_block_commit`] finishes
    /// the handoff once the mapping layer has installed the block in an
    /// active-block slot.
    pub fn get_free_block_prepare(&mut self, punit: PunitId) -> Result<u32> {
        let list = self
            .free_lists
            .get_mut(punit.0 as usize)
            .ok_or(FtlError::NoFreeBlocks { punit: punit.0 })?;
        let block = list.pop_front().ok_or(FtlError::NoFreeBlocks { punit: punit.0 })?;
        self.nr_free -= 1;
        let record = self.record_mut(punit, block)?;
        record.state = BlockState::Active;
        Ok(block)
    }

    /// Confirm a prepared block. Rejects blocks not in the `Active` state.
    pub fn get_free_block_commit(&mut self, punit: PunitId, block: u32) -> Result<()> {
        let record = self.record_mut(punit, block)?;
        if record.state != BlockState::Active {
            return Err(FtlError::BlockState(format!(
                "commit of non-active block {}/{block}",
                punit.0
            )));
        }
        tracing::trace!(punit = punit.0, block, "active block committed");
        Ok(())
    }

    /// Pull a specific free block out of the pool and mark it active. Used
    /// by fine-grain reclamation, which reinstalls an erased victim as the
    /// punit's active block instead of drawing a fresh one.
    pub fn claim_block(&mut self, punit: PunitId, block: u32) -> Result<()> {
        let list = self
            .free_lists
            .get_mut(punit.0 as usize)
            .ok_or(FtlError::NoFreeBlocks { punit: punit.0 })?;
        let pos = list
            .iter()
            .position(|entry| *entry == block)
            .ok_or_else(|| FtlError::BlockState(format!("block {}/{block} not free", punit.0)))?;
        list.remove(pos);
        self.nr_free -= 1;
        self.record_mut(punit, block)?.state = BlockState::Active;
        Ok(())
    }

    /// Release a filled active block: `Used` while fully live, `Dirty` if
    /// invalidations already landed while it was being filled.
    pub fn release_active(&mut self, punit: PunitId, block: u32) -> Result<()> {
        let record = self.record_mut(punit, block)?;
        if record.state != BlockState::Active {
            return Err(FtlError::BlockState(format!(
                "release of non-active block {}/{block}",
                punit.0
            )));
        }
        record.state = if record.nr_invalid > 0 {
            BlockState::Dirty
        } else {
            BlockState::Used
        };
        Ok(())
    }

    /// Mark one subpage valid (a completed program). The slot must be free;
    /// programming over a live or dead subpage is a mapping-layer bug.
    pub fn mark_valid(&mut self, phys: PhysAddr, slot: usize) -> Result<()> {
        let punit = phys.punit(&self.geo);
        let idx = self.subpage_index(phys.page, slot);
        let record = self.record_mut(punit, phys.block)?;
        if record.subpages[idx] != SubpageState::Free {
            return Err(FtlError::BlockState(format!(
                "subpage {}/{}/{}/{slot} already written",
                punit.0, phys.block, phys.page
            )));
        }
        record.subpages[idx] = SubpageState::Valid;
        Ok(())
    }

    /// Invalidate one subpage. Idempotent: a second invalidation (or one
    /// against a never-written slot) changes nothing and reports `false`.
    /// A `Used` block gains its first invalid subpage here and turns
    /// `Dirty`.
    pub fn invalidate(&mut self, phys: PhysAddr, slot: usize) -> Result<bool> {
        let punit = phys.punit(&self.geo);
        let idx = self.subpage_index(phys.page, slot);
        let record = self.record_mut(punit, phys.block)?;
        if record.subpages[idx] != SubpageState::Valid {
            return Ok(false);
        }
        record.subpages[idx] = SubpageState::Invalid;
        record.nr_invalid += 1;
        if record.state == BlockState::Used {
            record.state = BlockState::Dirty;
        }
        Ok(true)
    }

    /// Erase a block after the device completed (or failed) the physical
    /// erase. A failed erase marks the block bad; it never rejoins the free
    /// pool. Erasing a block that is already `Free` is rejected: honoring
    /// it would push the block onto the free list a second time.
    pub fn erase_block(&mut self, punit: PunitId, block: u32, is_bad: bool) -> Result<()> {
        let record = self.record_mut(punit, block)?;
        if record.state == BlockState::Free {
            return Err(FtlError::BlockState(format!(
                "erase of free block {}/{block}",
                punit.0
            )));
        }
        if is_bad {
            tracing::warn!(punit = punit.0, block, "erase failed, marking block bad");
            record.state = BlockState::Bad;
            return Ok(());
        }
        record.state = BlockState::Free;
        record.erase_count += 1;
        record.nr_invalid = 0;
        record.subpages.fill(SubpageState::Free);
        self.free_lists[punit.0 as usize].push_back(block);
        self.nr_free += 1;
        Ok(())
    }

    pub fn state(&self, punit: PunitId, block: u32) -> Result<BlockState> {
        Ok(self.record(punit, block)?.state)
    }

    pub fn erase_count(&self, punit: PunitId, block: u32) -> Result<u32> {
        Ok(self.record(punit, block)?.erase_count)
    }

    pub fn nr_invalid(&self, punit: PunitId, block: u32) -> Result<u32> {
        Ok(self.record(punit, block)?.nr_invalid)
    }

    /// Dirty blocks of one punit, in block order.
    pub fn dirty_blocks(&self, punit: PunitId) -> impl Iterator<Item = u32> + '_ {
        let chip = &self.blocks[punit.0 as usize];
        chip.iter()
            .enumerate()
            .filter(|(_, record)| record.state == BlockState::Dirty)
            .map(|(block, _)| block as u32)
    }

    /// Valid/invalid/free status per slot of one physical page.
    pub fn page_slots(&self, phys: PhysAddr) -> Result<Vec<SubpageState>> {
        let punit = phys.punit(&self.geo);
        let record = self.record(punit, phys.block)?;
        let base = self.subpage_index(phys.page, 0);
        Ok(record.subpages[base..base + self.geo.nr_subpages_per_page as usize].to_vec())
    }

    /// Number of leading subpage columns that hold no valid subpage on any
    /// page of the block. Column `c` is slot `c` of every page.
    pub fn first_live_column(&self, punit: PunitId, block: u32) -> Result<u32> {
        let record = self.record(punit, block)?;
        let spp = self.geo.nr_subpages_per_page;
        for col in 0..spp {
            let live = (0..self.geo.nr_pages_per_block).any(|page| {
                record.subpages[(page * spp) as usize + col as usize] == SubpageState::Valid
            });
            if live {
                return Ok(col);
            }
        }
        Ok(spp)
    }

    /// Invalid subpages within column `col` of the block.
    pub fn invalid_in_column(&self, punit: PunitId, block: u32, col: u32) -> Result<u32> {
        let record = self.record(punit, block)?;
        let spp = self.geo.nr_subpages_per_page;
        Ok((0..self.geo.nr_pages_per_block)
            .filter(|page| {
                record.subpages[(page * spp) as usize + col as usize] == SubpageState::Invalid
            })
            .count() as u32)
    }

    #[must_use]
    pub fn nr_free_blocks(&self) -> usize {
        self.nr_free
    }

    #[must_use]
    pub fn nr_total_blocks(&self) -> usize {
        self.geo.nr_blocks_total() as usize
    }

    /// Valid subpages across every block (conservation checks).
    #[must_use]
    pub fn nr_valid_subpages(&self) -> usize {
        self.blocks
            .iter()
            .flatten()
            .map(|record| {
                record
                    .subpages
                    .iter()
                    .filter(|sp| **sp == SubpageState::Valid)
                    .count()
            })
            .sum()
    }
}
