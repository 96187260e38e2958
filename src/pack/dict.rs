//! Register-mask dictionary
//!
//! Multi-register frames normally spend two header bytes on their absence
//! masks. The packer ranks the 16-bit masks of all multi-register deltas
//! across the assembled stream, keeps the 32 most frequent and serializes
//! them as the fixed 64-byte output prologue; a frame whose mask made the
//! cut encodes with a one-byte indexed header instead. The dictionary is
//! frozen before packing starts and never changes afterwards.

use crate::track::{Frame, SymbolTable};
use std::collections::HashMap;

/// Number of dictionary slots in the output prologue
pub const DICT_SIZE: usize = 32;

/// Frozen top-32 mask table
#[derive(Debug, Clone, Default)]
pub struct MaskDict {
    masks: Vec<u16>,
    index: HashMap<u16, u8>,
}

impl MaskDict {
    /// Build the dictionary from the assembled frame stream
    ///
    /// Only multi-register deltas contribute; single-register frames have
    /// their own cheaper encoding. Ranking is by frequency, ties broken by
    /// first appearance in the stream.
    pub fn build(frames: &[Frame], symbols: &SymbolTable) -> Self {
        let mut counts: HashMap<u16, (u32, usize)> = HashMap::new();
        let mut order = 0usize;
        for frame in frames {
            let Frame::Regs(rec) = frame else { continue };
            let delta = symbols.delta(rec.symbol);
            if delta.len() < 2 {
                continue;
            }
            let entry = counts.entry(delta.long_mask()).or_insert_with(|| {
                order += 1;
                (0, order)
            });
            entry.0 += 1;
        }

        let mut ranked: Vec<(u16, u32, usize)> =
            counts.into_iter().map(|(m, (n, o))| (m, n, o)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        ranked.truncate(DICT_SIZE);

        let masks: Vec<u16> = ranked.into_iter().map(|(m, _, _)| m).collect();
        let index = masks
            .iter()
            .enumerate()
            .map(|(i, &m)| (m, i as u8))
            .collect();
        MaskDict { masks, index }
    }

    /// Dictionary slot of a mask, if it was retained
    pub fn lookup(&self, mask: u16) -> Option<u8> {
        self.index.get(&mask).copied()
    }

    /// Number of retained masks
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// True when no mask was retained
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Serialize the 64-byte prologue: 32 little-endian slots, unused
    /// slots zero
    pub fn write_prologue(&self, out: &mut Vec<u8>) {
        for slot in 0..DICT_SIZE {
            let mask = self.masks.get(slot).copied().unwrap_or(0);
            out.extend_from_slice(&mask.to_le_bytes());
        }
    }
}
