//! Typed codec for the per-page out-of-band (OOB) area.
//!
//! The OOB area records which subpage LPA lives in each slot of a flash
//! page. Garbage collection reads it back to re-derive the original LPA of
//! a relocated subpage, so the encoding is part of the engine's on-flash
//! contract: 4 little-endian bytes per slot, `0xFFFF_FFFF` for an unmapped
//! slot.

use crate::Lpa;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoded value marking a slot with no mapped subpage.
const UNMAPPED: u32 = u32::MAX;

/// Width of one encoded slot in bytes.
const SLOT_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OobError {
    #[error("oob buffer too short: need {need} bytes, got {got}")]
    ShortBuffer { need: usize, got: usize },
}

/// Decoded OOB area: one optional subpage LPA per slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobArea {
    lpas: Vec<Option<Lpa>>,
}

impl OobArea {
    /// An all-unmapped area with `nr_slots` slots.
    #[must_use]
    pub fn new(nr_slots: usize) -> Self {
        Self {
            lpas: vec![None; nr_slots],
        }
    }

    #[must_use]
    pub fn from_lpas(lpas: Vec<Option<Lpa>>) -> Self {
        Self { lpas }
    }

    #[must_use]
    pub fn nr_slots(&self) -> usize {
        self.lpas.len()
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<Lpa> {
        self.lpas.get(slot).copied().flatten()
    }

    pub fn set(&mut self, slot: usize, lpa: Option<Lpa>) {
        if let Some(entry) = self.lpas.get_mut(slot) {
            *entry = lpa;
        }
    }

    /// Bytes needed to encode an area with `nr_slots` slots.
    #[must_use]
    pub fn encoded_len(nr_slots: usize) -> usize {
        nr_slots * SLOT_BYTES
    }

    /// Encode into a fixed-size little-endian byte vector.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.lpas.len()));
        for lpa in &self.lpas {
            let raw = match lpa {
                Some(lpa) => lpa.0,
                None => UNMAPPED,
            };
            out.extend_from_slice(&raw.to_le_bytes());
        }
        out
    }

    /// Decode `nr_slots` slots from `bytes`.
    ///
    /// Rejects short buffers; trailing bytes beyond the encoded area are
    /// ignored (physical OOB regions are usually larger than the mapping
    /// payload).
    pub fn decode(bytes: &[u8], nr_slots: usize) -> Result<Self, OobError> {
        let need = Self::encoded_len(nr_slots);
        if bytes.len() < need {
            return Err(OobError::ShortBuffer {
                need,
                got: bytes.len(),
            });
        }
        let mut lpas = Vec::with_capacity(nr_slots);
        for slot in 0..nr_slots {
            let at = slot * SLOT_BYTES;
            let raw = u32::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
            ]);
            lpas.push(if raw == UNMAPPED { None } else { Some(Lpa(raw)) });
        }
        Ok(Self { lpas })
    }
}
