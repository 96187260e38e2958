//! PSG source parser and frame assembly
//!
//! Walks the tokenized PSG source body and assembles the frame stream the
//! packer compresses. Token kinds after the 16-byte header:
//! - `0xFF`: end of frame, advance one frame
//! - `0xFE n`: end of frame, advance `4*n` frames
//! - `0xFD`: end of stream
//! - `r v` with `r <= 13`: write `v` to register `r`, no clock advance
//!
//! Register writes accumulate into the current frame; each frame boundary
//! flushes them through cleaning, diffs the cleaned state against the last
//! emitted state and either emits a delta frame or folds the slot into the
//! running delay. Delay runs coalesce and are chunked into records of at
//! most 256 frames. Optional cut ranges admit only part of the source:
//! frames outside the ranges still update cleaning state so the shadow
//! banks stay truthful, but emit nothing.

use crate::pack::PackOptions;
use crate::psg::{CleanOutcome, CleanStats, Cleaner, RegDelta, RegisterBank, REG_ENV_SHAPE};
use crate::track::{self, Frame, FrameRecord, SymbolTable, MAX_DELAY_RUN};
use crate::{PsgPackError, Result};
use std::collections::HashSet;

/// Counters accumulated while assembling the frame stream
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseStats {
    /// Frame-advance tokens seen in the admitted part of the source
    pub source_frames: u32,
    /// Register-delta frames emitted
    pub emitted_frames: u32,
    /// Silent frames emitted as delays
    pub delay_frames: u32,
    /// Frames whose writes diffed to nothing and became delays
    pub empty_converted: u32,
}

/// Result of parsing a PSG source file
#[derive(Debug, Clone)]
pub struct ParsedTrack {
    /// The 16-byte input header, passed through verbatim
    pub header: [u8; 16],
    /// Assembled frame stream
    pub frames: Vec<Frame>,
    /// Interned deltas
    pub symbols: SymbolTable,
    /// Canonical re-serialization of the post-clean stream, when requested
    pub dump: Option<Vec<u8>>,
    /// Assembly counters
    pub stats: ParseStats,
    /// Cleaning suppression counters
    pub clean_stats: CleanStats,
}

/// Parse a PSG source file into a frame stream
///
/// `force_widen` carries the deltas the level 4/5 re-pack loop wants
/// extended to full register groups; pass an empty set on the first pass.
pub fn parse(
    data: &[u8],
    opts: &PackOptions,
    force_widen: &HashSet<RegDelta>,
) -> Result<ParsedTrack> {
    if data.len() < 16 {
        return Err(PsgPackError::Format(
            "input shorter than the 16-byte header".into(),
        ));
    }
    let mut header = [0u8; 16];
    header.copy_from_slice(&data[..16]);

    let mut cut = CutRanges::new(&opts.cut)?;
    let mut asm = Assembler::new(opts, force_widen);

    let mut pos = 16;
    let mut src_frame: u32 = 0;
    'body: while pos < data.len() {
        let token = data[pos];
        match token {
            0xFD => break,
            0xFF | 0xFE => {
                let count = if token == 0xFF {
                    pos += 1;
                    1
                } else {
                    let n = *data.get(pos + 1).ok_or_else(|| truncated(pos))?;
                    pos += 2;
                    n as u32 * 4
                };
                for _ in 0..count {
                    let admitted = cut.admitted(src_frame);
                    asm.frame_boundary(admitted);
                    src_frame += 1;
                    if cut.exhausted() {
                        break 'body;
                    }
                }
            }
            reg if reg <= 13 => {
                let value = *data.get(pos + 1).ok_or_else(|| truncated(pos))?;
                pos += 2;
                asm.register_write(reg, value);
            }
            reg => {
                return Err(PsgPackError::Format(format!(
                    "invalid register index {} at offset {}",
                    reg, pos
                )));
            }
        }
    }

    asm.finish(!cut.exhausted() && cut.admitted(src_frame));
    Ok(asm.into_track(header))
}

fn truncated(pos: usize) -> PsgPackError {
    PsgPackError::Format(format!("source truncated at offset {}", pos))
}

/// Ordered `[from, to)` intervals over input frame indices
struct CutRanges {
    ranges: Vec<(u32, u32)>,
    idx: usize,
}

impl CutRanges {
    fn new(ranges: &[(u32, u32)]) -> Result<Self> {
        for &(from, to) in ranges {
            if from >= to {
                return Err(PsgPackError::Config(format!(
                    "empty cut range {}..{}",
                    from, to
                )));
            }
        }
        let mut ranges = ranges.to_vec();
        ranges.sort_unstable();
        Ok(CutRanges { ranges, idx: 0 })
    }

    /// Whether the given input frame enters the pipeline; advances past
    /// ranges the frame index has left behind
    fn admitted(&mut self, frame: u32) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        while self.idx < self.ranges.len() && frame >= self.ranges[self.idx].1 {
            self.idx += 1;
        }
        self.idx < self.ranges.len() && frame >= self.ranges[self.idx].0
    }

    /// All ranges exhausted: nothing further can be admitted
    fn exhausted(&self) -> bool {
        !self.ranges.is_empty() && self.idx >= self.ranges.len()
    }
}

struct Assembler<'a> {
    level: u8,
    cleaner: Option<Cleaner>,
    force_widen: &'a HashSet<RegDelta>,
    symbols: SymbolTable,
    frames: Vec<Frame>,
    /// Raw writes of the current partial frame
    changed: RegDelta,
    /// Raw running register state
    raw: RegisterBank,
    /// Post-clean state of the last emitted frame
    prev_emitted: Option<RegisterBank>,
    /// Admitted frames since the last delay flush
    delay: u64,
    /// The most recent flush emitted a frame, which consumes one slot of
    /// the pending delay run
    pending_emitted: bool,
    dump: Option<Vec<u8>>,
    stats: ParseStats,
}

impl<'a> Assembler<'a> {
    fn new(opts: &PackOptions, force_widen: &'a HashSet<RegDelta>) -> Self {
        Assembler {
            level: opts.level,
            cleaner: opts.clean.map(Cleaner::new),
            force_widen,
            symbols: SymbolTable::new(),
            frames: Vec::new(),
            changed: RegDelta::new(),
            raw: RegisterBank::new(),
            prev_emitted: None,
            delay: 0,
            pending_emitted: false,
            dump: opts.dump.then(Vec::new),
            stats: ParseStats::default(),
        }
    }

    fn register_write(&mut self, reg: u8, value: u8) {
        if self.delay > 0 {
            // The pending run starts a new frame's writes; one slot was
            // already consumed by the frame the last flush emitted.
            let run = self.delay as i64 - i64::from(self.pending_emitted);
            self.write_delay(run);
            self.delay = 0;
            self.pending_emitted = false;
        }
        self.changed.insert(reg, value);
        self.raw.write(reg, value);
    }

    fn frame_boundary(&mut self, admitted: bool) {
        if admitted {
            self.stats.source_frames += 1;
        }
        if self.flush(admitted) {
            self.pending_emitted = true;
        }
        if admitted {
            self.delay += 1;
        }
    }

    fn finish(&mut self, admitted: bool) {
        if self.flush(admitted) {
            self.pending_emitted = true;
        }
        let run = self.delay as i64 - i64::from(self.pending_emitted);
        self.write_delay(run);
        self.delay = 0;
        self.pending_emitted = false;
    }

    /// Close the current partial frame
    ///
    /// Returns true when a frame record was emitted. An empty cross-frame
    /// delta emits nothing; the caller folds the slot into the delay run.
    fn flush(&mut self, emit: bool) -> bool {
        if self.changed.is_empty() {
            return false;
        }

        let mut cleaned = self.raw;
        let mut outcome = CleanOutcome::default();
        let cleaning = self.cleaner.is_some();
        if let Some(cleaner) = self.cleaner.as_mut() {
            outcome = cleaner.clean(&mut cleaned);
        }
        let wrote_shape = self.changed.contains(REG_ENV_SHAPE);
        self.changed = RegDelta::new();

        if !emit {
            return false;
        }

        let mut delta = RegDelta::new();
        for reg in 0..REG_ENV_SHAPE {
            let value = cleaned.read(reg);
            let include = match self.prev_emitted {
                None => true,
                Some(prev) => prev.read(reg) != value,
            };
            if include {
                delta.insert(reg, value);
            }
        }
        // R13 is never diffed in: a write retriggers the envelope even at
        // an unchanged value, and a value drift without a write must not
        // fabricate a retrigger.
        if wrote_shape && (!cleaning || !outcome.env_shape_erased) {
            delta.insert(REG_ENV_SHAPE, cleaned.read(REG_ENV_SHAPE));
        }
        self.prev_emitted = Some(cleaned);

        if delta.is_empty() {
            self.stats.empty_converted += 1;
            return false;
        }

        if let Some(dump) = self.dump.as_mut() {
            dump.push(0xFF);
            for (reg, value) in delta.iter() {
                dump.push(reg);
                dump.push(value);
            }
        }

        if self.level < 3 || self.force_widen.contains(&delta) {
            extend_to_full(&mut delta, &cleaned);
        }

        let symbol = self.symbols.intern(delta);
        let record = FrameRecord {
            symbol,
            state: cleaned,
        };
        track::debug_check_record(&record, &self.symbols);
        self.frames.push(Frame::Regs(record));
        self.stats.emitted_frames += 1;
        true
    }

    /// Append `run` delay frames, coalescing with a trailing delay and
    /// re-chunking greedily into records of at most 256 frames
    fn write_delay(&mut self, run: i64) {
        if run <= 0 {
            return;
        }
        let mut total = run as u64;
        self.stats.delay_frames += run as u32;

        if let Some(dump) = self.dump.as_mut() {
            for _ in 0..run {
                dump.push(0xFF);
            }
        }

        while let Some(Frame::Delay(n)) = self.frames.last() {
            total += *n as u64;
            self.frames.pop();
        }
        while total > 0 {
            let chunk = total.min(MAX_DELAY_RUN as u64) as u16;
            self.frames.push(Frame::Delay(chunk));
            total -= chunk as u64;
        }
    }

    fn into_track(self, header: [u8; 16]) -> ParsedTrack {
        ParsedTrack {
            header,
            frames: self.frames,
            symbols: self.symbols,
            dump: self.dump,
            stats: self.stats,
            clean_stats: self
                .cleaner
                .map(|c| c.stats)
                .unwrap_or_default(),
        }
    }
}

/// Widen a nearly full delta to complete register groups
///
/// Five of the six low registers extend to all six; five or six of the
/// seven R6-R12 registers extend to all seven (never touching R13). The
/// larger frame buys the player its straight-line decode branch.
fn extend_to_full(delta: &mut RegDelta, state: &RegisterBank) {
    if delta.low_count() == 5 {
        for reg in 0..6 {
            delta.insert(reg, state.read(reg));
        }
    }
    let high = delta.high_count_no_shape();
    if high == 5 || high == 6 {
        for reg in 6..13 {
            delta.insert(reg, state.read(reg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackOptions;

    fn source(body: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 16];
        data.extend_from_slice(body);
        data
    }

    fn opts(level: u8) -> PackOptions {
        PackOptions {
            level,
            clean: None,
            ..PackOptions::default()
        }
    }

    fn parse_frames(body: &[u8], options: &PackOptions) -> ParsedTrack {
        parse(&source(body), options, &HashSet::new()).expect("parse")
    }

    #[test]
    fn test_empty_track_has_no_frames() {
        let track = parse_frames(&[0xFD], &opts(3));
        assert!(track.frames.is_empty());
    }

    #[test]
    fn test_first_frame_carries_full_low_bank() {
        let track = parse_frames(&[0x00, 0x55, 0x01, 0xAA, 0xFF, 0xFD], &opts(3));
        assert_eq!(track.frames.len(), 1);
        match &track.frames[0] {
            Frame::Regs(rec) => {
                let delta = track.symbols.delta(rec.symbol);
                assert_eq!(delta.len(), 13);
                assert_eq!(delta.get(0), Some(0x55));
                assert_eq!(delta.get(1), Some(0xAA));
                assert_eq!(delta.get(12), Some(0));
                assert!(!delta.contains(13));
            }
            other => panic!("expected delta frame, got {:?}", other),
        }
    }

    #[test]
    fn test_delay_accounting_subtracts_emitted_slot() {
        // Frame with a write, then two empty frames, then another write.
        let track = parse_frames(
            &[0x00, 0x01, 0xFF, 0xFF, 0xFF, 0x00, 0x02, 0xFF, 0xFD],
            &opts(3),
        );
        // Expect: frame, delay(2), frame.
        assert_eq!(track.frames.len(), 3);
        assert!(matches!(track.frames[0], Frame::Regs(_)));
        assert!(matches!(track.frames[1], Frame::Delay(2)));
        assert!(matches!(track.frames[2], Frame::Regs(_)));
    }

    #[test]
    fn test_leading_delays_are_not_shortened() {
        let track = parse_frames(&[0xFF, 0xFF, 0xFF, 0x00, 0x01, 0xFF, 0xFD], &opts(3));
        assert!(matches!(track.frames[0], Frame::Delay(3)));
        assert!(matches!(track.frames[1], Frame::Regs(_)));
    }

    #[test]
    fn test_unchanged_write_becomes_delay() {
        // Second frame rewrites the same value; its delta diffs to nothing.
        let track = parse_frames(
            &[0x00, 0x07, 0xFF, 0x00, 0x07, 0xFF, 0xFD],
            &opts(3),
        );
        assert_eq!(track.frames.len(), 2);
        assert!(matches!(track.frames[0], Frame::Regs(_)));
        assert!(matches!(track.frames[1], Frame::Delay(1)));
        assert_eq!(track.stats.empty_converted, 1);
    }

    #[test]
    fn test_delay_runs_chunk_at_256() {
        let mut body = vec![0x00, 0x01, 0xFF];
        // 300 empty frames via 75 coarse advances.
        body.extend_from_slice(&[0xFE, 75]);
        body.push(0xFD);
        let track = parse_frames(&body, &opts(3));
        assert_eq!(track.frames.len(), 3);
        assert!(matches!(track.frames[0], Frame::Regs(_)));
        assert!(matches!(track.frames[1], Frame::Delay(256)));
        assert!(matches!(track.frames[2], Frame::Delay(44)));
    }

    #[test]
    fn test_delay_coalescing_across_empty_frames() {
        // delay 2, an unchanged-write frame, delay 2 again: one run of 5.
        let track = parse_frames(
            &[
                0x00, 0x07, 0xFF, 0xFF, 0xFF, 0x00, 0x07, 0xFF, 0xFF, 0xFF, 0xFD,
            ],
            &opts(3),
        );
        assert_eq!(track.frames.len(), 2);
        assert!(matches!(track.frames[1], Frame::Delay(5)));
    }

    #[test]
    fn test_widening_below_level_3() {
        // Second frame changes five of the six low registers.
        let mut body = vec![0x00, 0x01, 0xFF];
        for reg in 0u8..5 {
            body.extend_from_slice(&[reg, 0x11]);
        }
        body.push(0xFF);
        body.push(0xFD);

        let widened = parse_frames(&body, &opts(2));
        let plain = parse_frames(&body, &opts(3));

        let delta_of = |track: &ParsedTrack, idx: usize| match &track.frames[idx] {
            Frame::Regs(rec) => track.symbols.delta(rec.symbol).clone(),
            other => panic!("expected delta frame, got {:?}", other),
        };
        assert_eq!(delta_of(&widened, 1).low_count(), 6);
        assert_eq!(delta_of(&plain, 1).low_count(), 5);
    }

    #[test]
    fn test_shape_write_survives_without_diff() {
        // R13 rewritten with the same value still emits (retrigger).
        let track = parse_frames(
            &[0x0D, 0x0A, 0xFF, 0x0D, 0x0A, 0xFF, 0xFD],
            &opts(3),
        );
        assert_eq!(track.frames.len(), 2);
        for frame in &track.frames {
            match frame {
                Frame::Regs(rec) => {
                    assert!(track.symbols.delta(rec.symbol).contains(13));
                }
                other => panic!("expected delta frame, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_shape_erased_when_envelope_idle_and_known() {
        let mut options = opts(3);
        options.clean = Some(Default::default());
        // First R13 write is kept (no prior shape), second is erased and
        // the frame collapses into a delay.
        let track = parse(
            &source(&[0x0D, 0x0A, 0xFF, 0x0D, 0x0A, 0xFF, 0xFD]),
            &options,
            &HashSet::new(),
        )
        .expect("parse");
        assert_eq!(track.frames.len(), 2);
        match &track.frames[0] {
            Frame::Regs(rec) => assert!(track.symbols.delta(rec.symbol).contains(13)),
            other => panic!("expected delta frame, got {:?}", other),
        }
        assert!(matches!(track.frames[1], Frame::Delay(1)));
    }

    #[test]
    fn test_cut_ranges_admit_window_and_keep_state() {
        // Frame 0 sets R0; frames 1.. change R1 each frame. Cutting to
        // frames 2..4 must emit a first frame that reflects the pre-roll
        // state of R0.
        let body = [
            0x00, 0x77, 0x01, 0x01, 0xFF, // frame 0
            0x01, 0x02, 0xFF, // frame 1
            0x01, 0x03, 0xFF, // frame 2
            0x01, 0x04, 0xFF, // frame 3
            0x01, 0x05, 0xFF, // frame 4 (outside)
            0xFD,
        ];
        let mut options = opts(3);
        options.cut = vec![(2, 4)];
        let track = parse(&source(&body), &options, &HashSet::new()).expect("parse");
        assert_eq!(track.frames.len(), 2);
        match &track.frames[0] {
            Frame::Regs(rec) => {
                let delta = track.symbols.delta(rec.symbol);
                assert_eq!(delta.get(0), Some(0x77));
                assert_eq!(delta.get(1), Some(0x03));
            }
            other => panic!("expected delta frame, got {:?}", other),
        }
        match &track.frames[1] {
            Frame::Regs(rec) => {
                let delta = track.symbols.delta(rec.symbol);
                assert_eq!(delta.len(), 1);
                assert_eq!(delta.get(1), Some(0x04));
            }
            other => panic!("expected delta frame, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_register_rejected() {
        let err = parse(&source(&[0x20, 0x01, 0xFD]), &opts(1), &HashSet::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_truncated_pair_rejected() {
        let err = parse(&source(&[0x00]), &opts(1), &HashSet::new());
        assert!(err.is_err());
    }
}
