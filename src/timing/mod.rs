//! Player cycle accounting
//!
//! Models the exact T-state cost the target Z80 player spends decoding
//! each element of a packed track. The matcher consults it to refuse
//! references that would blow the per-frame budget of the selected
//! compression level, and the level 4/5 re-pack loop uses it to find long
//! references whose first frame decodes too slowly.
//!
//! Every constant in this module is a frozen contract with the player
//! build: the values are sums of the instruction timings on the exact path
//! the player takes, and changing any of them silently desynchronizes the
//! cycle guarantees of an otherwise valid output file. Where a value is a
//! sum below, the terms follow the player's instruction sequence.

use crate::psg::RegDelta;

/// Hard ceiling on a long reference's first-frame decode time at
/// levels 4/5; exceeding it marks the donor for widening and a re-pack
pub const MAX_LONG_REF_INIT_TSTATES: u32 = 930;

/// Per-frame decode budget the level 0/1 player variant promises
pub const FAST_FRAME_BUDGET: u32 = 661;

/// Fixed decode prologue of an own frame
const FRAME_PROLOGUE: u32 = 98;

/// Fixed offset before the register walk of a short reference
const SHORT_REF_OFFSET: u32 = 141;

/// Fixed offset before the register walk of a long-reference initializer
const LONG_REF_OFFSET: u32 = 168;

/// Shared epilogue after any register walk
const AFTER_PLAY_FRAME: u32 = 70;

/// Extra prologue cycles of the `scf`-adjusted player build
const SCF_ADJUST: u32 = 4;

/// Single-register frame path
const PL00_SINGLE: u32 = 4 + 12 + 4 + 7 + 7 + 7 + 7 + 7 + 4 + 6 + 45;

/// Header decode preamble of an explicit-mask multi-register frame
const PSG2_PREAMBLE: u32 = 4 + 12 + 4 + 7 + 16;

/// Header decode preamble of a dictionary-indexed frame
const DICT_PREAMBLE: u32 = 4 + 12 + 4 + 7 + 12;

/// Register-walk main-loop cost per present register
const WALK_PRESENT: u32 = 54;

/// Register-walk main-loop cost per absent register
const WALK_ABSENT: u32 = 20;

/// Final register test when the register is present
const FINAL_PRESENT: u32 = 55;

/// Final register test when the register is absent
const FINAL_ABSENT: u32 = 15;

/// Cycles the straight-line branch saves by skipping the final test
const PLAY_ALL_SKIP: u32 = 34;

/// Straight-line low-group path (all of R0-R5 present)
const PLAY_ALL_0_5: u32 = 6 * WALK_PRESENT - PLAY_ALL_SKIP;

/// Straight-line high-group path (all of R6-R12 present)
const PLAY_ALL_6_13: u32 = 341;

/// Saved when the straight-line high-group path has no R13 write
const PLAY_ALL_NO_SHAPE: u32 = 35;

/// Trailing-repeat adjustment after an own frame
///
/// `repeats` counts the short references immediately following that point
/// back at this frame; the player short-circuits the first one and falls
/// into a cheaper loop for the rest.
pub fn trb_rep(repeats: u32) -> u32 {
    match repeats {
        0 => 22,
        1 => 13 + 5 + 5 + 42,
        _ => 7 + 4 + 5 + 13 + 11,
    }
}

/// Position of one frame inside a delay run, selecting its decode path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPhase {
    /// The run is exactly one frame
    Single,
    /// First frame of a run longer than 16 frames (two-byte encoding)
    LongFirst,
    /// First frame of a 2..=16 frame run
    First,
    /// Any interior frame
    Mid,
    /// Final frame of a multi-frame run
    Last,
}

/// T-state model of the target player
#[derive(Debug, Clone, Copy)]
pub struct TimingModel {
    add_scf: bool,
}

impl TimingModel {
    /// Create a model; `add_scf` selects the `scf`-adjusted player build
    pub fn new(add_scf: bool) -> Self {
        TimingModel { add_scf }
    }

    fn scf(&self) -> u32 {
        if self.add_scf {
            SCF_ADJUST
        } else {
            0
        }
    }

    /// Register-walk cost of decoding a delta
    ///
    /// `dict_indexed` selects the dictionary header path. Both header
    /// forms fall into the same play routines afterwards: a group with
    /// every register present takes the straight-line branch, anything
    /// else walks its absence mask bit by bit.
    pub fn pl0x(&self, delta: &RegDelta, dict_indexed: bool) -> u32 {
        if delta.len() == 1 {
            return PL00_SINGLE;
        }

        let preamble = if dict_indexed {
            DICT_PREAMBLE
        } else {
            PSG2_PREAMBLE
        };

        let low = if delta.low_count() == 6 {
            PLAY_ALL_0_5
        } else {
            Self::walk_cost((0u8..6).map(|reg| delta.contains(reg)))
        };

        let high = if delta.high_count_no_shape() == 7 {
            let mut cost = PLAY_ALL_6_13;
            if !delta.contains(13) {
                cost -= PLAY_ALL_NO_SHAPE;
            }
            cost
        } else {
            // By-mask direction is R13 down to R6; R6 takes the final test.
            Self::walk_cost(
                (7u8..14)
                    .rev()
                    .chain(std::iter::once(6u8))
                    .map(|reg| delta.contains(reg)),
            )
        };

        preamble + low + high
    }

    /// Mask-walk cost; the last flag is the final register test
    fn walk_cost(present: impl Iterator<Item = bool>) -> u32 {
        let flags: Vec<bool> = present.collect();
        let mut cost = 0;
        for (i, &p) in flags.iter().enumerate() {
            cost += if i + 1 == flags.len() {
                if p {
                    FINAL_PRESENT
                } else {
                    FINAL_ABSENT
                }
            } else if p {
                WALK_PRESENT
            } else {
                WALK_ABSENT
            };
        }
        cost
    }

    /// Decode time of an own frame, excluding the trailing-repeat term
    pub fn own_frame_time(&self, delta: &RegDelta, dict_indexed: bool) -> u32 {
        FRAME_PROLOGUE + self.scf() + self.pl0x(delta, dict_indexed) + AFTER_PLAY_FRAME
    }

    /// Decode time of a short reference replaying the given donor delta
    pub fn short_ref_time(&self, delta: &RegDelta, dict_indexed: bool) -> u32 {
        SHORT_REF_OFFSET + self.scf() + self.pl0x(delta, dict_indexed) + AFTER_PLAY_FRAME
    }

    /// First-frame decode time of a long reference: initializer plus the
    /// register walk of the first covered donor frame
    pub fn long_ref_first_time(&self, delta: &RegDelta, dict_indexed: bool) -> u32 {
        LONG_REF_OFFSET + self.scf() + self.pl0x(delta, dict_indexed) + AFTER_PLAY_FRAME
    }

    /// Decode time of one frame of a delay run
    pub fn delay_time(&self, phase: DelayPhase) -> u32 {
        match phase {
            DelayPhase::Single => 98 + 12 + 7 + 6 + 12 + 10 + 10 + AFTER_PLAY_FRAME + self.scf(),
            DelayPhase::LongFirst => {
                98 + 12 + 7 + 6 + 12 + 17 + 21 + AFTER_PLAY_FRAME + self.scf()
            }
            DelayPhase::First => 98 + 12 + 7 + 6 + 12 + 10 + 16 + AFTER_PLAY_FRAME + self.scf(),
            DelayPhase::Mid => 13 + 11 + 10 + 22,
            DelayPhase::Last => 13 + 11 + 10 + 22 + 27,
        }
    }

    /// Total decode time of a delay run of `frames` frames
    pub fn delay_run_time(&self, frames: u16) -> u32 {
        match frames {
            0 => 0,
            1 => self.delay_time(DelayPhase::Single),
            n => {
                let first = if n > 16 {
                    self.delay_time(DelayPhase::LongFirst)
                } else {
                    self.delay_time(DelayPhase::First)
                };
                first
                    + (n as u32 - 2) * self.delay_time(DelayPhase::Mid)
                    + self.delay_time(DelayPhase::Last)
            }
        }
    }

    /// Level 0/1 admission test for a long reference
    ///
    /// The long-reference preamble burns budget the body cannot recover
    /// from: with a first-frame register walk of `t` cycles, the reference
    /// is only admissible while the preamble surcharge fits the headroom
    /// the fast budget leaves.
    pub fn fast_level_allows_long_ref(&self, first_walk: u32) -> bool {
        let surcharge = (LONG_REF_OFFSET - SHORT_REF_OFFSET) as i64;
        surcharge - (FAST_FRAME_BUDGET as i64 - first_walk as i64) <= 0
    }
}

impl Default for TimingModel {
    fn default() -> Self {
        TimingModel::new(false)
    }
}
