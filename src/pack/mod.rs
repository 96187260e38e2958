//! Packing pipeline
//!
//! Drives a compression job end to end: parse the source into a frame
//! stream, freeze the mask dictionary, run the matcher over every
//! position, serialize the survivors and close the track. At levels 4/5 a
//! finished pass is audited against the player budget; long references
//! that decode too slowly mark their donor deltas for widening and the
//! whole job reruns from scratch with only the mark set carried forward,
//! until the marks stabilize.
//!
//! Every job owns its complete state; nothing is shared between jobs or
//! passes, so a re-pack is a plain reconstruction.

pub mod dict;
pub mod matcher;
pub mod serializer;

use crate::parser::{parse, ParsedTrack};
use crate::psg::{CleanFlags, CleanStats, RegDelta};
use crate::timing::{trb_rep, TimingModel, MAX_LONG_REF_INIT_TSTATES};
use crate::track::{Frame, SymbolTable};
use crate::{PsgPackError, Result};
use self::dict::MaskDict;
use self::matcher::{find_ref, MatchContext, RefInfo, MAX_NESTED_LEVEL};
use self::serializer::Serializer;
use std::collections::{BTreeMap, HashSet};

/// Compression job configuration
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Compression level 0..=5; higher levels trade player speed for size
    pub level: u8,
    /// Cleaning rules, or `None` to keep the source registers untouched
    pub clean: Option<CleanFlags>,
    /// Admitted `[from, to)` windows over input frame indices; empty
    /// admits the whole source
    pub cut: Vec<(u32, u32)>,
    /// Capture the canonical post-clean re-serialization of the stream
    pub dump: bool,
    /// Model the `scf`-adjusted player build
    pub add_scf: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            level: 1,
            clean: Some(CleanFlags::default()),
            cut: Vec::new(),
            dump: false,
            add_scf: false,
        }
    }
}

/// Compression counters for the CLI summary
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Frame-advance tokens admitted from the source
    pub source_frames: u32,
    /// Records in the assembled stream (deltas and delay runs)
    pub stream_frames: usize,
    /// Delay records emitted
    pub delay_records: u32,
    /// Silent frames covered by delay records
    pub delay_frames: u32,
    /// Frames whose writes diffed to nothing and became delays
    pub empty_converted: u32,
    /// Frames emitted own
    pub own_frames: u32,
    /// Bytes spent on own frames
    pub own_bytes: u32,
    /// Two-byte references
    pub short_refs: u32,
    /// Three-byte references
    pub long_refs: u32,
    /// Frames covered by references
    pub ref_frames: u32,
    /// Pack passes run (more than one only at levels 4/5)
    pub pack_passes: u32,
    /// Source size in bytes
    pub input_bytes: usize,
    /// Packed size in bytes, prologue and end marker included
    pub output_bytes: usize,
    /// Histogram of interned delta sizes
    pub delta_sizes: BTreeMap<usize, u32>,
    /// Cleaning suppression counters
    pub clean: CleanStats,
}

/// Element kinds of the packed body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Delay run
    Delay,
    /// Own frame
    Frame,
    /// Two-byte reference
    ShortRef,
    /// Three-byte reference
    LongRef,
}

impl ElementKind {
    /// CSV column label
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Delay => "delay",
            ElementKind::Frame => "frame",
            ElementKind::ShortRef => "short_ref",
            ElementKind::LongRef => "long_ref",
        }
    }
}

/// One decoded element of the packed body with its player cost
#[derive(Debug, Clone, Copy)]
pub struct ElementTiming {
    /// Body offset of the element
    pub offset: usize,
    /// Encoded size in bytes
    pub bytes: usize,
    /// Frames the player advances while consuming it
    pub frames: u32,
    /// Element kind
    pub kind: ElementKind,
    /// Total decode cost in T-states
    pub tstates: u32,
}

/// A finished compression job
#[derive(Debug, Clone)]
pub struct PackedTrack {
    /// Complete output: 64-byte prologue, body, end marker
    pub data: Vec<u8>,
    /// The 16-byte input header
    pub header: [u8; 16],
    /// Raw-frame dump (input header plus post-clean stream), when requested
    pub dump: Option<Vec<u8>>,
    /// Compression counters
    pub stats: Stats,
    /// Per-element decode timings of the body
    pub report: Vec<ElementTiming>,
}

/// Compress a PSG source file
///
/// Validates the configuration, then runs pack passes until the level 4/5
/// widening marks stabilize (a single pass below level 4).
pub fn pack(input: &[u8], opts: &PackOptions) -> Result<PackedTrack> {
    if opts.level > 5 {
        return Err(PsgPackError::Config(format!(
            "compression level {} out of range 0..=5",
            opts.level
        )));
    }

    let mut widened: HashSet<RegDelta> = HashSet::new();
    let mut passes = 0u32;
    loop {
        passes += 1;
        let track = parse(input, opts, &widened)?;
        let mut job = EncodeJob::new(track, opts, widened.clone());
        job.pack_stream();

        if opts.level >= 4 {
            let marks = job.slow_donor_deltas();
            let mut grew = false;
            for delta in marks {
                if widened.insert(delta) {
                    grew = true;
                }
            }
            if grew {
                assert!(passes < 64, "widening marks failed to stabilize");
                continue;
            }
        }
        return Ok(job.finish(input.len(), passes, opts));
    }
}

/// Single-pass encoder state
struct EncodeJob {
    frames: Vec<Frame>,
    symbols: SymbolTable,
    header: [u8; 16],
    dump_body: Option<Vec<u8>>,
    dict: MaskDict,
    timing: TimingModel,
    level: u8,
    widened: HashSet<RegDelta>,
    ref_info: Vec<RefInfo>,
    frame_offsets: Vec<usize>,
    out: Serializer,
    emissions: Vec<Emission>,
    stats: Stats,
}

#[derive(Debug, Clone, Copy)]
struct Emission {
    kind: ElementKind,
    /// First stream slot the element covers
    frame: usize,
    byte_start: usize,
    byte_len: usize,
}

impl EncodeJob {
    fn new(track: ParsedTrack, opts: &PackOptions, widened: HashSet<RegDelta>) -> Self {
        let ParsedTrack {
            header,
            frames,
            symbols,
            dump,
            stats: parse_stats,
            clean_stats,
        } = track;

        let dict = MaskDict::build(&frames, &symbols);
        let n = frames.len();

        let mut stats = Stats {
            source_frames: parse_stats.source_frames,
            stream_frames: n,
            delay_frames: parse_stats.delay_frames,
            empty_converted: parse_stats.empty_converted,
            clean: clean_stats,
            ..Stats::default()
        };
        for delta in symbols.deltas() {
            *stats.delta_sizes.entry(delta.len()).or_insert(0) += 1;
        }

        EncodeJob {
            frames,
            symbols,
            header,
            dump_body: dump,
            dict,
            timing: TimingModel::new(opts.add_scf),
            level: opts.level,
            widened,
            ref_info: vec![RefInfo::default(); n],
            frame_offsets: Vec::new(),
            out: Serializer::new(),
            emissions: Vec::new(),
            stats,
        }
    }

    /// Serialize the whole stream: delays directly, register frames via
    /// the matcher
    fn pack_stream(&mut self) {
        let mut i = 0usize;
        while i < self.frames.len() {
            while self.frame_offsets.len() <= i {
                self.frame_offsets.push(self.out.len());
            }
            let start = self.out.len();
            match self.frames[i] {
                Frame::Delay(n) => {
                    self.out.delay(n);
                    self.stats.delay_records += 1;
                    self.push_emission(ElementKind::Delay, i, start);
                    i += 1;
                }
                Frame::Regs(_) => {
                    let found = {
                        let ctx = MatchContext {
                            frames: &self.frames,
                            symbols: &self.symbols,
                            dict: &self.dict,
                            timing: &self.timing,
                            ref_info: &self.ref_info,
                            frame_offsets: &self.frame_offsets,
                            out_len: start,
                            level: self.level,
                            widened: &self.widened,
                        };
                        find_ref(&ctx, i)
                    };
                    match found {
                        Some(m) => {
                            let long = m.len > 1;
                            self.out
                                .back_ref(self.frame_offsets[m.pos], m.charged, long);
                            for j in 0..m.len {
                                self.ref_info[i + j] = RefInfo {
                                    ref_to: m.pos as u32,
                                    ref_len: m.len as u16,
                                    charged_len: m.charged as u16,
                                    nested_level: m.nested_level,
                                    offset_in_ref: j as u16,
                                };
                            }
                            if long {
                                self.stats.long_refs += 1;
                                self.push_emission(ElementKind::LongRef, i, start);
                            } else {
                                self.stats.short_refs += 1;
                                self.push_emission(ElementKind::ShortRef, i, start);
                            }
                            self.stats.ref_frames += m.len as u32;
                            i += m.len;
                        }
                        None => {
                            let Frame::Regs(rec) = &self.frames[i] else {
                                unreachable!()
                            };
                            let delta = self.symbols.delta(rec.symbol);
                            self.out.frame(delta, &self.dict);
                            self.stats.own_frames += 1;
                            self.stats.own_bytes += (self.out.len() - start) as u32;
                            self.push_emission(ElementKind::Frame, i, start);
                            i += 1;
                        }
                    }
                }
            }
        }
    }

    fn push_emission(&mut self, kind: ElementKind, frame: usize, byte_start: usize) {
        self.emissions.push(Emission {
            kind,
            frame,
            byte_start,
            byte_len: self.out.len() - byte_start,
        });
    }

    fn dict_indexed(&self, delta: &RegDelta) -> bool {
        delta.len() > 1 && self.dict.lookup(delta.long_mask()).is_some()
    }

    /// Donor deltas of long references whose first frame overruns the
    /// level 4/5 budget
    fn slow_donor_deltas(&self) -> Vec<RegDelta> {
        let mut marks = Vec::new();
        for emission in &self.emissions {
            if emission.kind != ElementKind::LongRef {
                continue;
            }
            let donor = self.ref_info[emission.frame].ref_to as usize;
            let Frame::Regs(rec) = &self.frames[donor] else {
                continue;
            };
            let delta = self.symbols.delta(rec.symbol);
            if self.timing.long_ref_first_time(delta, self.dict_indexed(delta))
                > MAX_LONG_REF_INIT_TSTATES
            {
                marks.push(delta.clone());
            }
        }
        marks
    }

    /// Player decode cost of one donor slot replayed inside a reference
    fn replayed_slot_time(&self, slot: usize, depth: u8) -> u32 {
        assert!(depth <= MAX_NESTED_LEVEL, "reference nesting too deep");
        let info = self.ref_info[slot];
        match info.ref_len {
            0 => match &self.frames[slot] {
                Frame::Delay(n) => self.timing.delay_run_time(*n),
                Frame::Regs(rec) => {
                    let delta = self.symbols.delta(rec.symbol);
                    self.timing.own_frame_time(delta, self.dict_indexed(delta)) + trb_rep(0)
                }
            },
            1 => {
                let donor = info.ref_to as usize;
                let Frame::Regs(rec) = &self.frames[donor] else {
                    unreachable!("short references replay register frames");
                };
                let delta = self.symbols.delta(rec.symbol);
                self.timing.short_ref_time(delta, self.dict_indexed(delta))
            }
            _ if info.offset_in_ref == 0 => self.long_ref_time(slot, depth + 1),
            // Interior slots of a nested reference are charged at its start.
            _ => 0,
        }
    }

    /// Total decode cost of the long reference starting at `slot`
    fn long_ref_time(&self, slot: usize, depth: u8) -> u32 {
        let info = self.ref_info[slot];
        let donor = info.ref_to as usize;
        let Frame::Regs(rec) = &self.frames[donor] else {
            unreachable!("long references start at register frames");
        };
        let delta = self.symbols.delta(rec.symbol);
        let mut total = self
            .timing
            .long_ref_first_time(delta, self.dict_indexed(delta));
        for j in 1..info.ref_len as usize {
            total += self.replayed_slot_time(donor + j, depth);
        }
        total
    }

    /// Count the short references immediately following emission `idx`
    /// that point back at its frame
    fn trailing_repeats(&self, idx: usize) -> u32 {
        let frame = self.emissions[idx].frame;
        let mut count = 0u32;
        for emission in &self.emissions[idx + 1..] {
            if emission.kind == ElementKind::ShortRef
                && self.ref_info[emission.frame].ref_to as usize == frame
            {
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    fn build_report(&self) -> Vec<ElementTiming> {
        let mut report = Vec::with_capacity(self.emissions.len());
        for (idx, emission) in self.emissions.iter().enumerate() {
            let (frames, tstates) = match emission.kind {
                ElementKind::Delay => {
                    let Frame::Delay(n) = self.frames[emission.frame] else {
                        unreachable!()
                    };
                    (n as u32, self.timing.delay_run_time(n))
                }
                ElementKind::Frame => {
                    let Frame::Regs(rec) = &self.frames[emission.frame] else {
                        unreachable!()
                    };
                    let delta = self.symbols.delta(rec.symbol);
                    let time = self.timing.own_frame_time(delta, self.dict_indexed(delta))
                        + trb_rep(self.trailing_repeats(idx));
                    (1, time)
                }
                ElementKind::ShortRef => (1, self.replayed_slot_time(emission.frame, 0)),
                ElementKind::LongRef => {
                    let len = self.ref_info[emission.frame].ref_len as usize;
                    // Covered delay records advance the player by their run
                    // length, not by one frame per record.
                    let frames: u32 = self.frames[emission.frame..emission.frame + len]
                        .iter()
                        .map(|f| match f {
                            Frame::Delay(n) => *n as u32,
                            Frame::Regs(_) => 1,
                        })
                        .sum();
                    (frames, self.long_ref_time(emission.frame, 0))
                }
            };
            report.push(ElementTiming {
                offset: emission.byte_start,
                bytes: emission.byte_len,
                frames,
                kind: emission.kind,
                tstates,
            });
        }
        report
    }

    fn finish(mut self, input_bytes: usize, passes: u32, opts: &PackOptions) -> PackedTrack {
        let report = self.build_report();

        let mut data = Vec::with_capacity(64 + self.out.len() + 1);
        self.dict.write_prologue(&mut data);
        data.extend_from_slice(&std::mem::take(&mut self.out).finish());

        self.stats.pack_passes = passes;
        self.stats.input_bytes = input_bytes;
        self.stats.output_bytes = data.len();

        let dump = if opts.dump {
            let mut dump = Vec::with_capacity(16 + self.dump_body.as_ref().map_or(0, Vec::len));
            dump.extend_from_slice(&self.header);
            if let Some(body) = self.dump_body.take() {
                dump.extend_from_slice(&body);
            }
            Some(dump)
        } else {
            None
        };

        PackedTrack {
            data,
            header: self.header,
            dump,
            stats: self.stats,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_out_of_range() {
        let data = vec![0u8; 17];
        let opts = PackOptions {
            level: 6,
            ..PackOptions::default()
        };
        assert!(matches!(
            pack(&data, &opts),
            Err(PsgPackError::Config(_))
        ));
    }

    #[test]
    fn test_single_pass_below_level_4() {
        let mut data = vec![0u8; 16];
        data.extend_from_slice(&[0x00, 0x01, 0xFF, 0xFD]);
        let packed = pack(&data, &PackOptions::default()).expect("pack");
        assert_eq!(packed.stats.pack_passes, 1);
    }
}
