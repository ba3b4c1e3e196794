//! Codec Engine Capability
//!
//! The entropy coder is an external collaborator. This module defines the
//! narrow capability the rest of the crate drives it through:
//!
//! ```text
//! init(direction, params) ──► engine
//! step(engine, input, output, flush) ──► (consumed, produced, status)
//! end(engine) ──► status
//! ```
//!
//! Implementations:
//! - `GzipEngine`: RFC 1952 gzip member around a raw `flate2` deflate stream

pub mod framing;
pub mod gzip;
pub mod markers;

pub use gzip::GzipEngine;
pub use markers::BitMarkers;

use serde::{Deserialize, Serialize};

/// Transform direction, fixed when a context is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Compress,
    Decompress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Compress => "gzip",
            Direction::Decompress => "gunzip",
        }
    }
}

/// How aggressively a step must emit internally buffered state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Engine may keep data buffered internally
    Normal,
    /// Emit everything buffered and leave a resumable block boundary
    Align,
    /// Like `Align`, and also reset the compression window
    Reset,
    /// End of input: emit everything plus the trailer
    Finish,
}

/// Outcome of a single step (or of finalizing an engine)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecStatus {
    /// At least one byte was consumed or produced
    Progress,
    /// Logical end of stream reached
    End,
    /// No progress was possible; drain output and retry
    Blocked,
    /// Malformed stream or internal fault
    Error(String),
}

impl CodecStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, CodecStatus::Error(_))
    }

    pub fn is_end(&self) -> bool {
        matches!(self, CodecStatus::End)
    }
}

/// Result of `CodecEngine::step`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStep {
    pub consumed: usize,
    pub produced: usize,
    pub status: CodecStatus,
}

/// Compression quality, read once from configuration at context creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    /// Compression level (0..=9)
    pub level: u32,
    /// Memory budget hint (1..=9)
    pub memory_level: u32,
    /// Window size in bits; decompression always uses the maximum
    pub window_bits: u8,
}

/// Largest deflate window, used for every decompressor
pub const MAX_WINDOW_BITS: u8 = 15;

impl Default for QualityParams {
    fn default() -> Self {
        QualityParams {
            level: 6,
            memory_level: 8,
            window_bits: MAX_WINDOW_BITS,
        }
    }
}

/// Engine initialization failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitError(pub String);

/// Capability interface over an external block-oriented codec
///
/// The engine never sees the context's views; it works on plain slices and
/// reports how much of each it used. Its internal state stays private.
pub trait CodecEngine: Send + Sized {
    /// Create an engine for one direction
    fn init(direction: Direction, params: &QualityParams) -> Result<Self, InitError>;

    /// Consume from `input`, write into `output`
    ///
    /// `output` is never empty. `consumed <= input.len()` and
    /// `produced <= output.len()` always hold.
    fn step(&mut self, input: &[u8], output: &mut [u8], flush: FlushMode) -> EngineStep;

    /// Finalize the engine. Called exactly once, by the owning context.
    fn end(&mut self) -> CodecStatus;

    /// Current bit-offset markers of the stream
    fn markers(&self) -> BitMarkers;
}
