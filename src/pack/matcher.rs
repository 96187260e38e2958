//! Back-reference search
//!
//! For each frame position the matcher scans every earlier own-emitted
//! frame inside the 14-bit byte window and walks forward while the donor
//! stream covers the candidate stream, keeping the most byte-saving chain.
//! The walk charges a "reduced length", the element count the player pays
//! decode time for, which is also the count stored on the wire: own frames
//! and delay records charge one each, a nested long reference charges one
//! at its start, and short-reference donors charge only at levels 4/5
//! where the player follows them inside an outer reference.
//!
//! The cycle model gates admissions: levels 0/1 refuse long references
//! whose first-frame register walk cannot fit the fast player budget, and
//! levels 4/5 refuse re-offending donors that widening already failed to
//! rescue.

use crate::pack::dict::MaskDict;
use crate::psg::RegDelta;
use crate::timing::{TimingModel, MAX_LONG_REF_INIT_TSTATES};
use crate::track::{covers, Frame, SymbolTable};
use std::collections::HashSet;

/// Byte window a back reference may span
pub const MAX_REF_OFFSET: usize = 16384;

/// Longest chain of frames one reference may cover
pub const MAX_REF_FRAMES: usize = 255;

/// Deepest reference-into-reference chain the player tolerates
pub const MAX_NESTED_LEVEL: u8 = 15;

/// Per-slot reference bookkeeping
///
/// `ref_len == 0` marks an own-emitted frame, `1` a short reference and
/// `> 1` every slot of a long reference of that length; `offset_in_ref`
/// locates the slot inside its chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefInfo {
    /// Chain-start donor slot this reference replays
    pub ref_to: u32,
    /// Covered chain length; 0 for own frames
    pub ref_len: u16,
    /// Elements charged on the wire (chain start only)
    pub charged_len: u16,
    /// Reference-into-reference depth
    pub nested_level: u8,
    /// Position of this slot inside its chain
    pub offset_in_ref: u16,
}

/// A chosen back reference
#[derive(Debug, Clone, Copy)]
pub struct RefMatch {
    /// Donor chain start
    pub pos: usize,
    /// Frames covered
    pub len: usize,
    /// Elements the player is charged for; stored on the wire
    pub charged: usize,
    /// Nesting depth of the new reference
    pub nested_level: u8,
}

/// Read-only packing state the search runs against
pub struct MatchContext<'a> {
    /// Assembled frame stream
    pub frames: &'a [Frame],
    /// Interned deltas
    pub symbols: &'a SymbolTable,
    /// Frozen mask dictionary
    pub dict: &'a MaskDict,
    /// Player cycle model
    pub timing: &'a TimingModel,
    /// Per-slot reference records installed so far
    pub ref_info: &'a [RefInfo],
    /// Body offsets of already serialized frames
    pub frame_offsets: &'a [usize],
    /// Current body length
    pub out_len: usize,
    /// Compression level
    pub level: u8,
    /// Deltas the re-pack loop already widened
    pub widened: &'a HashSet<RegDelta>,
}

/// Bytes the frame at `pos` would occupy if emitted own
pub fn serialized_frame_size(
    frame: &Frame,
    symbols: &SymbolTable,
    dict: &MaskDict,
) -> usize {
    match frame {
        Frame::Delay(n) => {
            if *n <= 16 {
                1
            } else {
                2
            }
        }
        Frame::Regs(rec) => {
            let delta = symbols.delta(rec.symbol);
            if delta.len() == 1 {
                2
            } else if dict.lookup(delta.long_mask()).is_some() {
                1 + delta.len()
            } else {
                2 + delta.len()
            }
        }
    }
}

/// Find the most byte-saving back reference starting at `pos`
///
/// Returns `None` when no admissible reference saves bytes. Ties keep the
/// earliest scanned donor.
pub fn find_ref(ctx: &MatchContext<'_>, pos: usize) -> Option<RefMatch> {
    let max_len = MAX_REF_FRAMES.min(ctx.frames.len() - pos);
    let charge_cap: usize = if ctx.level >= 4 { 255 } else { 128 };

    let mut best: Option<RefMatch> = None;
    let mut best_benefit = 0i64;

    for i in 0..pos {
        // Window test on byte offsets; the record itself counts.
        if ctx.out_len + 3 - ctx.frame_offsets[i] > MAX_REF_OFFSET {
            continue;
        }
        if ctx.ref_info[i].ref_len != 0 {
            continue;
        }
        if !covers(&ctx.frames[i], &ctx.frames[pos], ctx.symbols, ctx.level) {
            continue;
        }

        let mut chain = 0usize;
        let mut charged = 0usize;
        let mut covered_bytes = 0usize;
        let mut sizes: Vec<usize> = Vec::new();

        while chain < max_len && i + chain < pos {
            let donor = &ctx.ref_info[i + chain];
            if chain > 0
                && !covers(
                    &ctx.frames[i + chain],
                    &ctx.frames[pos + chain],
                    ctx.symbols,
                    ctx.level,
                )
            {
                break;
            }
            if donor.ref_len > 1 && ctx.level <= 3 {
                break;
            }
            let charge = match donor.ref_len {
                0 => 1,
                1 => usize::from(ctx.level >= 4),
                _ => usize::from(donor.offset_in_ref == 0),
            };
            if charged + charge > charge_cap {
                break;
            }
            charged += charge;
            covered_bytes +=
                serialized_frame_size(&ctx.frames[pos + chain], ctx.symbols, ctx.dict);
            sizes.push(covered_bytes);
            chain += 1;
        }

        // Never end inside another long reference: pop the partial chain.
        // A partial chain was always entered at its start, so it charged
        // exactly once.
        let mut popped = false;
        while chain > 0 {
            let tail = &ctx.ref_info[i + chain - 1];
            if tail.ref_len > 1 && tail.offset_in_ref < tail.ref_len - 1 {
                chain -= 1;
                sizes.pop();
                popped = true;
            } else {
                break;
            }
        }
        if popped {
            charged -= 1;
        }

        // Short-reference donors at the tail save the player nothing at
        // the fast levels; drop them.
        if ctx.level <= 3 {
            while chain > 0 && ctx.ref_info[i + chain - 1].ref_len == 1 {
                chain -= 1;
                sizes.pop();
            }
        }

        if chain == 0 || charged == 0 {
            continue;
        }

        let record_size: i64 = if chain == 1 { 2 } else { 3 };
        let benefit = *sizes.last().expect("chain is non-empty") as i64 - record_size;
        if benefit <= best_benefit {
            continue;
        }

        if chain > 1 {
            let Frame::Regs(first) = &ctx.frames[i] else {
                unreachable!("chain start covers a register frame");
            };
            let first_delta = ctx.symbols.delta(first.symbol);
            let dict_indexed =
                first_delta.len() > 1 && ctx.dict.lookup(first_delta.long_mask()).is_some();

            if ctx.level < 2 {
                let walk = ctx.timing.pl0x(first_delta, dict_indexed);
                if !ctx.timing.fast_level_allows_long_ref(walk) {
                    continue;
                }
            }
            if ctx.level >= 4 {
                let init = ctx.timing.long_ref_first_time(first_delta, dict_indexed);
                if init > MAX_LONG_REF_INIT_TSTATES && ctx.widened.contains(first_delta) {
                    // Widening already failed to rescue this donor; an own
                    // emission is the only way to hold the budget.
                    continue;
                }
            }
        }

        let donor_nested = (i..i + chain)
            .map(|d| {
                let info = &ctx.ref_info[d];
                if info.ref_len > 0 {
                    info.nested_level
                } else {
                    0
                }
            })
            .max()
            .unwrap_or(0);
        let nested_level = donor_nested + 1;
        if nested_level > MAX_NESTED_LEVEL {
            continue;
        }

        best_benefit = benefit;
        best = Some(RefMatch {
            pos: i,
            len: chain,
            charged,
            nested_level,
        });
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psg::RegisterBank;
    use crate::track::FrameRecord;

    struct Fixture {
        frames: Vec<Frame>,
        symbols: SymbolTable,
        dict: MaskDict,
        timing: TimingModel,
        ref_info: Vec<RefInfo>,
        frame_offsets: Vec<usize>,
        out_len: usize,
        widened: HashSet<RegDelta>,
    }

    impl Fixture {
        fn new(deltas: &[&[(u8, u8)]]) -> Self {
            let mut symbols = SymbolTable::new();
            let mut frames = Vec::new();
            let mut state = RegisterBank::new();
            for writes in deltas {
                let mut delta = RegDelta::new();
                for &(reg, value) in *writes {
                    delta.insert(reg, value);
                    state.write(reg, value);
                }
                let symbol = symbols.intern(delta);
                frames.push(Frame::Regs(FrameRecord { symbol, state }));
            }
            let n = frames.len();
            Fixture {
                frames,
                symbols,
                dict: MaskDict::default(),
                timing: TimingModel::default(),
                ref_info: vec![RefInfo::default(); n],
                frame_offsets: (0..n).map(|i| i * 4).collect(),
                out_len: n * 4,
                widened: HashSet::new(),
            }
        }

        fn ctx(&self, level: u8) -> MatchContext<'_> {
            MatchContext {
                frames: &self.frames,
                symbols: &self.symbols,
                dict: &self.dict,
                timing: &self.timing,
                ref_info: &self.ref_info,
                frame_offsets: &self.frame_offsets,
                out_len: self.out_len,
                level,
                widened: &self.widened,
            }
        }
    }

    #[test]
    fn test_exact_repeat_found() {
        let fx = Fixture::new(&[
            &[(0, 1), (2, 3)],
            &[(0, 2), (2, 4)],
            &[(0, 1), (2, 3)],
        ]);
        let m = find_ref(&fx.ctx(1), 2).expect("match");
        assert_eq!(m.pos, 0);
        assert_eq!(m.len, 1);
        assert_eq!(m.charged, 1);
    }

    #[test]
    fn test_single_register_repeat_saves_nothing() {
        // Own cost of a single-register frame equals a short reference.
        let fx = Fixture::new(&[&[(0, 1)], &[(0, 2)], &[(0, 1)]]);
        assert!(find_ref(&fx.ctx(1), 2).is_none());
    }

    #[test]
    fn test_window_edge_is_exclusive() {
        let mut fx = Fixture::new(&[&[(0, 1), (2, 3)], &[(0, 1), (2, 3)]]);
        fx.frame_offsets = vec![0, MAX_REF_OFFSET];
        // out_len + 3 - 0 lands exactly on the window: still allowed.
        fx.out_len = MAX_REF_OFFSET - 3;
        assert!(find_ref(&fx.ctx(1), 1).is_some());
        // One byte further and the donor falls out of reach.
        fx.out_len = MAX_REF_OFFSET - 2;
        assert!(find_ref(&fx.ctx(1), 1).is_none());
    }

    #[test]
    fn test_donor_must_be_own_emitted() {
        let mut fx = Fixture::new(&[
            &[(0, 1), (2, 3)],
            &[(0, 2), (2, 4)],
            &[(0, 1), (2, 3)],
        ]);
        fx.ref_info[0] = RefInfo {
            ref_to: 0,
            ref_len: 1,
            charged_len: 1,
            nested_level: 1,
            offset_in_ref: 0,
        };
        assert!(find_ref(&fx.ctx(1), 2).is_none());
    }

    #[test]
    fn test_long_chain_with_trailing_short_ref_trimmed() {
        // Donor area [A, B, A] with slot 2 emitted as a short reference;
        // the candidate at slot 3 repeats the donor symbols in order.
        let mut fx = Fixture::new(&[
            &[(0, 1), (2, 3)],
            &[(0, 2), (2, 4)],
            &[(0, 1), (2, 3)],
            &[(0, 1), (2, 3)],
            &[(0, 2), (2, 4)],
            &[(0, 1), (2, 3)],
        ]);
        fx.ref_info[2] = RefInfo {
            ref_to: 0,
            ref_len: 1,
            charged_len: 1,
            nested_level: 1,
            offset_in_ref: 0,
        };
        let m = find_ref(&fx.ctx(1), 3).expect("match");
        assert_eq!(m.pos, 0);
        // A, B own then the short-ref tail is dropped.
        assert_eq!(m.len, 2);
        assert_eq!(m.charged, 2);
    }

    #[test]
    fn test_mid_chain_short_ref_not_charged_at_fast_levels() {
        // Donor area [A, B(short ref), C]; candidate repeats them.
        let mut fx = Fixture::new(&[
            &[(0, 1), (2, 3)],
            &[(0, 2), (2, 4)],
            &[(4, 5), (6, 7)],
            &[(0, 1), (2, 3)],
            &[(0, 2), (2, 4)],
            &[(4, 5), (6, 7)],
        ]);
        fx.ref_info[1] = RefInfo {
            ref_to: 0,
            ref_len: 1,
            charged_len: 1,
            nested_level: 1,
            offset_in_ref: 0,
        };
        let m1 = find_ref(&fx.ctx(1), 3).expect("match");
        assert_eq!((m1.len, m1.charged), (3, 2));
        let m4 = find_ref(&fx.ctx(4), 3).expect("match");
        assert_eq!((m4.len, m4.charged), (3, 3));
    }

    #[test]
    fn test_fast_level_rejects_slow_long_ref() {
        // A full-bank donor pair walks too slowly for the level 0/1
        // budget; the same chain is fine at level 2.
        let full: Vec<(u8, u8)> = (0u8..14).map(|r| (r, r + 1)).collect();
        let full2: Vec<(u8, u8)> = (0u8..14).map(|r| (r, r + 2)).collect();
        let fx = Fixture::new(&[&full, &full2, &full, &full2]);
        assert!(find_ref(&fx.ctx(1), 2).map(|m| m.len) != Some(2));
        assert_eq!(find_ref(&fx.ctx(2), 2).map(|m| m.len), Some(2));
    }
}
