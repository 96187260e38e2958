//! PSG track compressor for the AY-3-8910/YM2149 family
//!
//! Compresses a frame-accurate log of PSG register writes (the "PSG source"
//! format: register/value pairs separated by end-of-frame markers) into a
//! compact byte stream replayable by a small Z80 player at one frame per
//! video refresh. Compression trades byte size against the player's decode
//! time: every emitted element carries a known T-state cost, and the packer
//! keeps the per-frame decode time inside the budget the selected level
//! promises.
//!
//! # Features
//! - Frame assembly with cross-frame delta extraction and delay coalescing
//! - Audibility-preserving register cleaning (muted tones, idle envelope,
//!   disabled noise)
//! - Greedy back-reference compression over a 14-bit byte window with a
//!   state-aware frame-cover relation
//! - Top-32 register-mask dictionary for 1-byte frame headers
//! - Exact T-state accounting of the target player, driving match policy
//!   and the level 4/5 re-pack loop
//!
//! # Quick start
//! ```no_run
//! use psgpack::pack::{pack, PackOptions};
//!
//! # fn main() -> psgpack::Result<()> {
//! let source = std::fs::read("track.psg")?;
//! let packed = pack(&source, &PackOptions::default())?;
//! std::fs::write("track.mus", &packed.data)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod pack;
pub mod parser;
pub mod psg;
pub mod timing;
pub mod track;

/// Error type for packer operations
///
/// Covers I/O failures, malformed PSG source data and invalid
/// configuration. Internal invariant violations in the matcher and
/// serializer are assertions, not errors: they indicate packer bugs
/// rather than bad input.
#[derive(thiserror::Error, Debug)]
pub enum PsgPackError {
    /// IO error from filesystem or device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed PSG source data
    #[error("malformed PSG source: {0}")]
    Format(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for PsgPackError {
    /// Converts a String into `PsgPackError::Other`.
    fn from(msg: String) -> Self {
        PsgPackError::Other(msg)
    }
}

impl From<&str> for PsgPackError {
    /// Converts a string slice into `PsgPackError::Other`.
    fn from(msg: &str) -> Self {
        PsgPackError::Other(msg.to_string())
    }
}

/// Result type for packer operations
pub type Result<T> = std::result::Result<T, PsgPackError>;

// Public API exports
pub use pack::{pack, PackOptions, PackedTrack, Stats};
pub use parser::{parse, ParsedTrack};
pub use psg::{CleanFlags, RegDelta, RegisterBank};
pub use timing::TimingModel;
pub use track::{Frame, FrameRecord, SymbolTable};
