//! Bit-offset markers for range access into compressed objects
//!
//! All three positions are bit offsets from the first byte of the gzip
//! member:
//!
//! ```text
//! ┌────────┬──────────────────────────────┬──────────────┬─────────┐
//! │ header │ deflate blocks ...           │ final block  │ trailer │
//! └────────┴──────────────────────────────┴──────────────┴─────────┘
//!          ▲                              ▲              ▲
//!        start                          last           stop
//! ```

use serde::{Deserialize, Serialize};

/// Stream-start, last-flush-point and stream-stop, in bits
///
/// Exact for streams this crate compresses. For a stream from another
/// encoder the decompressor only knows block boundaries when the stream
/// ends in an aligned empty final block; otherwise `last` stays at `start`
/// and `stop` is the byte-aligned end of the deflate data. Such markers
/// bound the stream but do not locate its final block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BitMarkers {
    pub start: u64,
    pub last: u64,
    pub stop: u64,
}

impl BitMarkers {
    /// Markers for a stream whose deflate data begins at `bit`
    pub fn at(bit: u64) -> Self {
        BitMarkers {
            start: bit,
            last: bit,
            stop: bit,
        }
    }

    /// `start <= last <= stop`
    pub fn is_ordered(&self) -> bool {
        self.start <= self.last && self.last <= self.stop
    }

    /// True when no marker moved backwards relative to `earlier`
    pub fn follows(&self, earlier: &BitMarkers) -> bool {
        self.start == earlier.start && self.last >= earlier.last && self.stop >= earlier.stop
    }

    /// Record a resumable boundary; markers never move backwards
    pub(crate) fn advance_last(&mut self, bit: u64) {
        self.last = self.last.max(bit);
        self.stop = self.stop.max(self.last);
    }

    /// Record the end of the final block
    pub(crate) fn close(&mut self, last: Option<u64>, stop: u64) {
        if let Some(last) = last {
            self.last = self.last.max(last);
        }
        self.stop = stop.max(self.last);

        debug_assert!(
            self.is_ordered(),
            "Postcondition: markers must be ordered: {:?}",
            self
        );
    }
}

/// Empty stored block (LEN=0, NLEN=0xffff) left behind by an align flush
const ALIGN_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
/// Empty final fixed-Huffman block: BFINAL=1, BTYPE=01, end-of-block code
const EMPTY_FINAL_FIXED: [u8; 2] = [0x03, 0x00];
/// Bits used by `EMPTY_FINAL_FIXED` before padding
const EMPTY_FINAL_FIXED_BITS: u64 = 10;
/// Empty final stored block, byte aligned after an align flush
const EMPTY_FINAL_STORED: [u8; 5] = [0x01, 0x00, 0x00, 0xff, 0xff];

const TAIL_LEN: usize = ALIGN_MARKER.len() + EMPTY_FINAL_STORED.len();

/// Tracks the last few bytes of a deflate stream to locate its final block
#[derive(Debug, Clone, Default)]
pub(crate) struct DeflateTail {
    window: [u8; TAIL_LEN],
    filled: usize,
    total: u64,
}

impl DeflateTail {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        let bytes = if bytes.len() > TAIL_LEN {
            &bytes[bytes.len() - TAIL_LEN..]
        } else {
            bytes
        };
        let keep = (TAIL_LEN - bytes.len()).min(self.filled);
        self.window.copy_within(self.filled - keep..self.filled, 0);
        self.window[keep..keep + bytes.len()].copy_from_slice(bytes);
        self.filled = keep + bytes.len();
    }

    /// Total deflate bytes seen
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    fn ends_with(&self, pattern: &[u8]) -> bool {
        self.window[..self.filled].ends_with(pattern)
    }

    /// Locate the final block as `(last, stop)` bit offsets within the
    /// deflate data, when it is an empty block following an align flush
    pub(crate) fn final_block(&self) -> Option<(u64, u64)> {
        let end = self.total * 8;
        let fixed_len = EMPTY_FINAL_FIXED.len() as u64;
        let stored_len = EMPTY_FINAL_STORED.len() as u64;

        if self.ends_with(&EMPTY_FINAL_FIXED)
            && self.window[..self.filled - EMPTY_FINAL_FIXED.len()].ends_with(&ALIGN_MARKER)
        {
            let last = end - fixed_len * 8;
            return Some((last, last + EMPTY_FINAL_FIXED_BITS));
        }
        if self.ends_with(&EMPTY_FINAL_STORED)
            && self.window[..self.filled - EMPTY_FINAL_STORED.len()].ends_with(&ALIGN_MARKER)
        {
            return Some((end - stored_len * 8, end));
        }
        None
    }
}
