//! Host request builder: splits one host read/write/trim into low-level
//! requests aligned to the mapping granularity.
//!
//! Writes decide their path per coarse page:
//!
//! - every subpage of the page covered -> one coarse write;
//! - a single subpage -> one fine write;
//! - several subpages over a live coarse mapping with no fine overlays ->
//!   a read-modify-write (read the old page, merge, write whole);
//! - anything else -> one fine write per subpage.
//!
//! Reads group mapped subpages by their physical page; never-written LPAs
//! become `ReadDummy` requests that complete with zeroed payload instead
//! of fabricated data. Mapping state is updated while building, before
//! the device sees the request; the per-LPA queue ordering then keeps
//! later lookups behind the data.

use crate::pool::ReqPool;
use nftl_error::{FtlError, Result};
use nftl_ftl::Ftl;
use nftl_llm::req::{LlmReq, ReqKind};
use nftl_types::{Geometry, LogAddr, Lpa, PhysAddr};
use std::collections::HashMap;

/// Kind of one host request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostReqKind {
    Read,
    Write,
    Trim,
}

/// One host block-I/O request, in subpage units.
#[derive(Debug, Clone)]
pub struct HostReq {
    pub kind: HostReqKind,
    pub lpa: Lpa,
    pub nr_subpages: u32,
    /// Write payload, `nr_subpages * subpage_size` bytes. Empty for reads
    /// and trims.
    pub data: Vec<u8>,
}

impl HostReq {
    #[must_use]
    pub fn read(lpa: Lpa, nr_subpages: u32) -> Self {
        Self {
            kind: HostReqKind::Read,
            lpa,
            nr_subpages,
            data: Vec::new(),
        }
    }

    /// Write request; the subpage count is derived from the payload size.
    pub fn write(lpa: Lpa, data: Vec<u8>, geo: &Geometry) -> Result<Self> {
        if data.is_empty() || data.len() % geo.subpage_size != 0 {
            return Err(FtlError::Misaligned(format!(
                "write payload of {} bytes is not a positive multiple of the {}-byte subpage",
                data.len(),
                geo.subpage_size
            )));
        }
        Ok(Self {
            kind: HostReqKind::Write,
            lpa,
            nr_subpages: (data.len() / geo.subpage_size) as u32,
            data,
        })
    }

    #[must_use]
    pub fn trim(lpa: Lpa, nr_subpages: u32) -> Self {
        Self {
            kind: HostReqKind::Trim,
            lpa,
            nr_subpages,
            data: Vec::new(),
        }
    }
}

/// Translate one host request into low-level requests, updating the
/// mapping for writes and trims as a side effect.
pub(crate) fn build(
    ftl: &Ftl,
    pool: &ReqPool,
    geo: &Geometry,
    host: &HostReq,
) -> Result<Vec<LlmReq>> {
    if host.nr_subpages == 0 {
        return Err(FtlError::Misaligned("empty host request".into()));
    }
    let end = u64::from(host.lpa.0) + u64::from(host.nr_subpages);
    if end > ftl.nr_subpages_total() {
        return Err(FtlError::Misaligned(format!(
            "host range [{}, {end}) exceeds the logical capacity",
            host.lpa.0
        )));
    }
    match host.kind {
        HostReqKind::Write => build_write(ftl, pool, geo, host),
        HostReqKind::Read => build_read(ftl, pool, geo, host),
        HostReqKind::Trim => build_trim(ftl, pool, geo, host),
    }
}

/// One planned low-level write, allocated but not yet mapped.
enum Staged {
    Coarse {
        cg: u32,
        la: LogAddr,
        phys: PhysAddr,
    },
    Fine {
        lpa: Lpa,
        la: LogAddr,
        phys: PhysAddr,
    },
    Rmw {
        cg: u32,
        slot_lo: u32,
        slot_hi: u32,
        map_la: LogAddr,
        phys_r: PhysAddr,
        phys_w: PhysAddr,
    },
}

/// Writes run in two phases: stage every allocation (and pool shell)
/// first, commit the mappings only once the whole host request is
/// provisioned. A failure mid-way therefore leaves every previous
/// mapping, and the data behind it, untouched.
fn build_write(ftl: &Ftl, pool: &ReqPool, geo: &Geometry, host: &HostReq) -> Result<Vec<LlmReq>> {
    let spp = geo.nr_subpages_per_page;
    let first = host.lpa.0;
    let last = first + host.nr_subpages - 1;

    let mut staged = Vec::new();
    for cg in (first / spp)..=(last / spp) {
        let slot_lo = first.max(cg * spp) % spp;
        let slot_hi = last.min(cg * spp + spp - 1) % spp;
        let nr_slots = slot_hi - slot_lo + 1;

        if nr_slots == spp {
            let mut la = LogAddr::coarse_page(cg, geo);
            let phys = ftl.get_free_ppa(&mut la)?;
            staged.push(Staged::Coarse { cg, la, phys });
        } else if nr_slots == 1 {
            stage_fine(ftl, geo, Lpa(cg * spp + slot_lo), &mut staged)?;
        } else {
            let probe = LogAddr::fine(Lpa(cg * spp + slot_lo), 0, geo);
            let prev = if ftl.has_fine_in_page(cg) {
                None
            } else {
                ftl.get_ppa(&probe)
            };
            if let Some((phys_r, _)) = prev {
                // Merge path: read the old page, write the whole merged
                // page to a fresh location. Only sound while the coarse
                // page is the single source of truth for every slot.
                let mut map_la = LogAddr::coarse_page(cg, geo);
                let phys_w = ftl.get_free_ppa(&mut map_la)?;
                staged.push(Staged::Rmw {
                    cg,
                    slot_lo,
                    slot_hi,
                    map_la,
                    phys_r,
                    phys_w,
                });
            } else {
                for slot in slot_lo..=slot_hi {
                    stage_fine(ftl, geo, Lpa(cg * spp + slot), &mut staged)?;
                }
            }
        }
    }

    // Pool exhaustion must also fail before any mapping commits.
    let mut shells = Vec::with_capacity(staged.len());
    for _ in 0..staged.len() {
        match pool.get() {
            Ok(shell) => shells.push(shell),
            Err(err) => {
                for shell in shells {
                    pool.put(shell);
                }
                return Err(err);
            }
        }
    }

    let mut reqs = Vec::with_capacity(staged.len());
    for (stage, mut req) in staged.into_iter().zip(shells) {
        match stage {
            Staged::Coarse { cg, la, phys } => {
                ftl.map_lpa_to_ppa(&la, phys)?;
                req.kind = ReqKind::Write;
                req.phys = phys;
                for slot in 0..spp as usize {
                    let lpa = Lpa(cg * spp + slot as u32);
                    req.subpage_mut(slot, geo)
                        .copy_from_slice(host_slice(host, geo, lpa));
                }
                req.logaddr = la;
            }
            Staged::Fine { lpa, la, phys } => {
                ftl.map_lpa_to_ppa(&la, phys)?;
                req.kind = ReqKind::Write;
                req.phys = phys;
                req.subpage_mut(la.ofs as usize, geo)
                    .copy_from_slice(host_slice(host, geo, lpa));
                req.logaddr = la;
            }
            Staged::Rmw {
                cg,
                slot_lo,
                slot_hi,
                map_la,
                phys_r,
                phys_w,
            } => {
                // The merged page is mapped up front; the scheduler
                // re-types the request after the read phase and the write
                // lands at the fresh location.
                ftl.map_lpa_to_ppa(&map_la, phys_w)?;
                req.kind = ReqKind::RmwRead;
                req.phys = phys_r;
                req.phys_w = Some(phys_w);
                let mut la = LogAddr::empty(geo);
                la.lpa_cg = Some(cg);
                for slot in slot_lo..=slot_hi {
                    let lpa = Lpa(cg * spp + slot);
                    la.subpages[slot as usize] = Some(lpa);
                    req.subpage_mut(slot as usize, geo)
                        .copy_from_slice(host_slice(host, geo, lpa));
                }
                req.logaddr = la;
            }
        }
        reqs.push(req);
    }
    Ok(reqs)
}

fn stage_fine(ftl: &Ftl, geo: &Geometry, lpa: Lpa, staged: &mut Vec<Staged>) -> Result<()> {
    let mut alloc = LogAddr::fine(lpa, 0, geo);
    let phys = ftl.get_free_ppa(&mut alloc)?;
    // The allocator picked the column; rebuild the address around it.
    let la = LogAddr::fine(lpa, alloc.ofs, geo);
    staged.push(Staged::Fine { lpa, la, phys });
    Ok(())
}

/// Host-payload slice backing subpage `lpa`.
fn host_slice<'a>(host: &'a HostReq, geo: &Geometry, lpa: Lpa) -> &'a [u8] {
    let at = (lpa.0 - host.lpa.0) as usize * geo.subpage_size;
    &host.data[at..at + geo.subpage_size]
}

fn build_read(ftl: &Ftl, pool: &ReqPool, geo: &Geometry, host: &HostReq) -> Result<Vec<LlmReq>> {
    let mut hits: HashMap<PhysAddr, LogAddr> = HashMap::new();
    let mut misses: HashMap<u32, LogAddr> = HashMap::new();
    for off in 0..host.nr_subpages {
        let lpa = Lpa(host.lpa.0 + off);
        let probe = LogAddr::fine(lpa, 0, geo);
        match ftl.get_ppa(&probe) {
            Some((phys, ofs)) => {
                hits.entry(phys)
                    .or_insert_with(|| LogAddr::empty(geo))
                    .subpages[ofs as usize] = Some(lpa);
            }
            None => {
                misses
                    .entry(lpa.coarse(geo))
                    .or_insert_with(|| LogAddr::empty(geo))
                    .subpages[lpa.slot(geo)] = Some(lpa);
            }
        }
    }

    let mut reqs = Vec::new();
    for (phys, la) in hits {
        let mut req = pool.get()?;
        req.kind = ReqKind::Read;
        req.phys = phys;
        req.logaddr = la;
        reqs.push(req);
    }
    // Never-written subpages complete as zero-filled dummies.
    for (_, la) in misses {
        let mut req = pool.get()?;
        req.kind = ReqKind::ReadDummy;
        req.phys = PhysAddr::ZERO;
        req.logaddr = la;
        reqs.push(req);
    }
    Ok(reqs)
}

fn build_trim(ftl: &Ftl, pool: &ReqPool, geo: &Geometry, host: &HostReq) -> Result<Vec<LlmReq>> {
    ftl.invalidate_lpa(host.lpa, host.nr_subpages)?;
    // One bookkeeping request so trims order behind earlier traffic for
    // the same LPA and show up in the completion accounting.
    let mut req = pool.get()?;
    req.kind = ReqKind::Trim;
    req.phys = PhysAddr::ZERO;
    req.logaddr = LogAddr::fine(host.lpa, 0, geo);
    Ok(vec![req])
}
