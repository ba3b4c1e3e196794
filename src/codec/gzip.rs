//! Gzip engine over raw `flate2` deflate streams
//!
//! `flate2` supplies the deflate math. This engine owns the member framing
//! (header, CRC-32/ISIZE trailer) so that header length, deflate length
//! and the final block position are known exactly, which is what the
//! bit-offset markers need.
//!
//! Flush mapping on compress:
//!
//! | FlushMode | deflate flush                      |
//! |-----------|------------------------------------|
//! | Normal    | `FlushCompress::None`              |
//! | Align     | `FlushCompress::Sync`              |
//! | Reset     | `FlushCompress::Full`              |
//! | Finish    | `Sync` once, then `Finish`         |
//!
//! The align flush issued before finishing leaves the final block empty and
//! byte aligned, so `last` points exactly at it.

use crate::codec::framing::{
    member_header, HeaderParser, Pending, Trailer, TrailerParser, HEADER_LEN, TRAILER_LEN,
};
use crate::codec::markers::DeflateTail;
use crate::codec::{
    BitMarkers, CodecEngine, CodecStatus, Direction, EngineStep, FlushMode, InitError,
    QualityParams,
};
use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Smallest window an align flush is compressed into
const MIN_FLUSH_WINDOW: usize = 64;

/// Gzip codec engine, one direction per instance
pub enum GzipEngine {
    Compress(Encoder),
    Decompress(Decoder),
}

impl std::fmt::Debug for GzipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GzipEngine::Compress(e) => f
                .debug_struct("GzipEngine::Compress")
                .field("phase", &e.phase)
                .field("markers", &e.markers)
                .finish(),
            GzipEngine::Decompress(d) => f
                .debug_struct("GzipEngine::Decompress")
                .field("phase", &d.phase)
                .field("markers", &d.markers)
                .finish(),
        }
    }
}

impl CodecEngine for GzipEngine {
    fn init(direction: Direction, params: &QualityParams) -> Result<Self, InitError> {
        match direction {
            Direction::Compress => Encoder::new(params).map(GzipEngine::Compress),
            Direction::Decompress => Ok(GzipEngine::Decompress(Decoder::new())),
        }
    }

    fn step(&mut self, input: &[u8], output: &mut [u8], flush: FlushMode) -> EngineStep {
        debug_assert!(!output.is_empty(), "Precondition: output window must not be empty");

        let step = match self {
            GzipEngine::Compress(e) => e.step(input, output, flush),
            GzipEngine::Decompress(d) => d.step(input, output),
        };

        debug_assert!(
            step.consumed <= input.len() && step.produced <= output.len(),
            "Postcondition: step stays within its windows"
        );
        step
    }

    fn end(&mut self) -> CodecStatus {
        match self {
            GzipEngine::Compress(e) => e.end(),
            GzipEngine::Decompress(d) => d.end(),
        }
    }

    fn markers(&self) -> BitMarkers {
        match self {
            GzipEngine::Compress(e) => e.markers,
            GzipEngine::Decompress(d) => d.markers,
        }
    }
}

fn status_of(phase_done: bool, consumed: usize, produced: usize) -> CodecStatus {
    if phase_done {
        CodecStatus::End
    } else if consumed > 0 || produced > 0 {
        CodecStatus::Progress
    } else {
        CodecStatus::Blocked
    }
}

// ============================================================================
// Encoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodePhase {
    Header,
    Body,
    Trailer,
    Done,
}

/// Compress half of the engine
pub struct Encoder {
    deflate: Compress,
    phase: EncodePhase,
    header: Pending<HEADER_LEN>,
    trailer: Option<Pending<TRAILER_LEN>>,
    crc: crc32fast::Hasher,
    isize: u32,
    tail: DeflateTail,
    finish_aligned: bool,
    /// Strongest flush completed since input was last consumed
    flushed: Option<FlushCompress>,
    /// The previous deflate call filled its whole window
    window_filled: bool,
    /// Staged flush bytes that did not fit the caller's window
    spill: BytesMut,
    stepped: bool,
    markers: BitMarkers,
}

impl Encoder {
    fn new(params: &QualityParams) -> Result<Self, InitError> {
        if params.level > 9 {
            return Err(InitError(format!("invalid compression level {}", params.level)));
        }
        if !(1..=9).contains(&params.memory_level) {
            return Err(InitError(format!("invalid memory level {}", params.memory_level)));
        }
        Ok(Encoder {
            deflate: Compress::new(Compression::new(params.level), false),
            phase: EncodePhase::Header,
            header: Pending::new(member_header(params.level)),
            trailer: None,
            crc: crc32fast::Hasher::new(),
            isize: 0,
            tail: DeflateTail::default(),
            finish_aligned: false,
            flushed: None,
            window_filled: false,
            spill: BytesMut::new(),
            stepped: false,
            markers: BitMarkers::at(HEADER_LEN as u64 * 8),
        })
    }

    fn step(&mut self, input: &[u8], output: &mut [u8], flush: FlushMode) -> EngineStep {
        self.stepped = true;
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            match self.phase {
                EncodePhase::Header => {
                    produced += self.header.drain_into(&mut output[produced..]);
                    if !self.header.is_done() {
                        break;
                    }
                    self.phase = EncodePhase::Body;
                }
                EncodePhase::Body => {
                    if !self.spill.is_empty() {
                        let n = self.spill.len().min(output.len() - produced);
                        output[produced..produced + n].copy_from_slice(&self.spill[..n]);
                        self.spill.advance(n);
                        produced += n;
                    }
                    if produced == output.len() {
                        break;
                    }
                    let mode = match flush {
                        FlushMode::Normal => FlushCompress::None,
                        FlushMode::Align => FlushCompress::Sync,
                        FlushMode::Reset => FlushCompress::Full,
                        FlushMode::Finish if self.finish_aligned => FlushCompress::Finish,
                        FlushMode::Finish => FlushCompress::Sync,
                    };
                    let aligning = matches!(mode, FlushCompress::Sync | FlushCompress::Full);

                    // Nothing new since the last boundary of at least this strength
                    let repeated = match self.flushed {
                        Some(FlushCompress::Full) => true,
                        Some(previous) => previous == mode,
                        None => false,
                    };
                    if aligning && repeated && consumed == input.len() {
                        if flush == FlushMode::Finish {
                            self.finish_aligned = true;
                            continue;
                        }
                        break;
                    }

                    // Tiny windows get a staging buffer so a flush always has room to finish
                    let window = output.len() - produced;
                    let mut stage = [0u8; MIN_FLUSH_WINDOW];
                    let staged = aligning && window < MIN_FLUSH_WINDOW;
                    let target: &mut [u8] = if staged {
                        &mut stage
                    } else {
                        &mut output[produced..]
                    };
                    let room = target.len();

                    let in_before = self.deflate.total_in();
                    let out_before = self.deflate.total_out();
                    let result = self.deflate.compress(&input[consumed..], target, mode);
                    let n_in = (self.deflate.total_in() - in_before) as usize;
                    let n_out = (self.deflate.total_out() - out_before) as usize;

                    self.crc.update(&input[consumed..consumed + n_in]);
                    self.isize = self.isize.wrapping_add(n_in as u32);
                    self.tail.push(&target[..n_out]);
                    if staged {
                        let direct = n_out.min(window);
                        output[produced..produced + direct].copy_from_slice(&stage[..direct]);
                        self.spill.extend_from_slice(&stage[direct..n_out]);
                        produced += direct;
                    } else {
                        produced += n_out;
                    }
                    consumed += n_in;
                    if n_in > 0 {
                        self.flushed = None;
                    }
                    // A filled window may hide pending bytes or a flush not yet emitted
                    let after_full = self.window_filled;
                    self.window_filled = n_out == room;

                    match result {
                        Err(e) => {
                            return EngineStep {
                                consumed,
                                produced,
                                status: CodecStatus::Error(e.to_string()),
                            }
                        }
                        Ok(Status::StreamEnd) => self.close_body(),
                        Ok(Status::Ok) | Ok(Status::BufError) => {
                            let drained = consumed == input.len() && n_out < room;
                            if aligning && drained {
                                if after_full {
                                    continue;
                                }
                                self.flushed = Some(mode);
                                self.mark_boundary();
                                if flush == FlushMode::Finish {
                                    self.finish_aligned = true;
                                    continue;
                                }
                                break;
                            }
                            if n_in == 0 && n_out == 0 {
                                break;
                            }
                            if produced == output.len()
                                || (consumed == input.len() && mode == FlushCompress::None)
                            {
                                break;
                            }
                        }
                    }
                }
                EncodePhase::Trailer => {
                    if let Some(trailer) = self.trailer.as_mut() {
                        produced += trailer.drain_into(&mut output[produced..]);
                        if trailer.is_done() {
                            self.phase = EncodePhase::Done;
                        }
                    }
                    break;
                }
                EncodePhase::Done => break,
            }
        }

        EngineStep {
            consumed,
            produced,
            status: status_of(self.phase == EncodePhase::Done, consumed, produced),
        }
    }

    /// Everything emitted so far is decodable; next block starts here
    fn mark_boundary(&mut self) {
        let bit = (HEADER_LEN as u64 + self.deflate.total_out()) * 8;
        self.markers.advance_last(bit);
    }

    fn close_body(&mut self) {
        debug_assert!(self.spill.is_empty(), "Precondition: staged flush bytes drained");
        let base = HEADER_LEN as u64 * 8;
        match self.tail.final_block() {
            Some((last, stop)) => self.markers.close(Some(base + last), base + stop),
            None => self.markers.close(None, base + self.tail.total() * 8),
        }

        let trailer = Trailer {
            crc: self.crc.clone().finalize(),
            isize: self.isize,
        };
        self.trailer = Some(Pending::new(trailer.to_bytes()));
        self.phase = EncodePhase::Trailer;
    }

    fn end(&mut self) -> CodecStatus {
        if self.phase == EncodePhase::Done || !self.stepped {
            CodecStatus::Progress
        } else {
            CodecStatus::Error("stream freed prematurely".to_string())
        }
    }
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodePhase {
    Header,
    Body,
    Trailer,
    Done,
}

/// Decompress half of the engine
pub struct Decoder {
    inflate: Decompress,
    phase: DecodePhase,
    header: HeaderParser,
    trailer: TrailerParser,
    crc: crc32fast::Hasher,
    isize: u32,
    tail: DeflateTail,
    consumed_any: bool,
    markers: BitMarkers,
}

impl Decoder {
    fn new() -> Self {
        // Raw inflate always runs with the maximum 32K window
        Decoder {
            inflate: Decompress::new(false),
            phase: DecodePhase::Header,
            header: HeaderParser::default(),
            trailer: TrailerParser::default(),
            crc: crc32fast::Hasher::new(),
            isize: 0,
            tail: DeflateTail::default(),
            consumed_any: false,
            markers: BitMarkers::default(),
        }
    }

    fn error(consumed: usize, produced: usize, message: impl Into<String>) -> EngineStep {
        EngineStep {
            consumed,
            produced,
            status: CodecStatus::Error(message.into()),
        }
    }

    fn step(&mut self, input: &[u8], output: &mut [u8]) -> EngineStep {
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            match self.phase {
                DecodePhase::Header => {
                    if consumed == input.len() {
                        break;
                    }
                    match self.header.feed(&input[consumed..]) {
                        Ok(n) => consumed += n,
                        Err(msg) => {
                            self.consumed_any = true;
                            return Self::error(consumed, produced, msg);
                        }
                    }
                    if self.header.is_done() {
                        self.markers = BitMarkers::at(self.header.len() as u64 * 8);
                        self.phase = DecodePhase::Body;
                    }
                }
                DecodePhase::Body => {
                    if produced == output.len() {
                        break;
                    }
                    let in_before = self.inflate.total_in();
                    let out_before = self.inflate.total_out();
                    let result = self.inflate.decompress(
                        &input[consumed..],
                        &mut output[produced..],
                        FlushDecompress::None,
                    );
                    let n_in = (self.inflate.total_in() - in_before) as usize;
                    let n_out = (self.inflate.total_out() - out_before) as usize;

                    self.tail.push(&input[consumed..consumed + n_in]);
                    self.crc.update(&output[produced..produced + n_out]);
                    self.isize = self.isize.wrapping_add(n_out as u32);
                    consumed += n_in;
                    produced += n_out;

                    match result {
                        Err(e) => return Self::error(consumed, produced, e.to_string()),
                        Ok(Status::StreamEnd) => self.close_body(),
                        Ok(Status::Ok) | Ok(Status::BufError) => {
                            if (n_in == 0 && n_out == 0) || produced == output.len() {
                                break;
                            }
                        }
                    }
                }
                DecodePhase::Trailer => {
                    if consumed == input.len() {
                        break;
                    }
                    consumed += self.trailer.feed(&input[consumed..]);
                    if let Some(trailer) = self.trailer.trailer() {
                        if trailer.crc != self.crc.clone().finalize() {
                            return Self::error(consumed, produced, "incorrect data check");
                        }
                        if trailer.isize != self.isize {
                            return Self::error(consumed, produced, "incorrect length check");
                        }
                        self.phase = DecodePhase::Done;
                    }
                }
                DecodePhase::Done => break,
            }
        }

        self.consumed_any |= consumed > 0;
        EngineStep {
            consumed,
            produced,
            status: status_of(self.phase == DecodePhase::Done, consumed, produced),
        }
    }

    fn close_body(&mut self) {
        let base = self.markers.start;
        match self.tail.final_block() {
            Some((last, stop)) => self.markers.close(Some(base + last), base + stop),
            None => self.markers.close(None, base + self.tail.total() * 8),
        }
        self.phase = DecodePhase::Trailer;
    }

    fn end(&mut self) -> CodecStatus {
        if self.consumed_any {
            CodecStatus::Progress
        } else {
            // Nothing ever arrived: an empty body is a complete empty object
            CodecStatus::End
        }
    }
}
