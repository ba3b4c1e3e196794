//! Gzip Member Framing (RFC 1952)
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (10 bytes + optional)     │
//! │ - id: 1f 8b                      │
//! │ - method: 8 (deflate)            │
//! │ - flags: u8                      │
//! │ - mtime: u32                     │
//! │ - xfl, os: u8                    │
//! │ - [extra] [name] [comment] [crc] │
//! ├──────────────────────────────────┤
//! │ Raw deflate blocks               │
//! ├──────────────────────────────────┤
//! │ Trailer (8 bytes)                │
//! │ - crc32 of uncompressed data     │
//! │ - isize: length mod 2^32         │
//! └──────────────────────────────────┘
//! ```
//!
//! Both parsers accept input in arbitrarily small pieces.

/// Gzip magic
pub const GZIP_ID: [u8; 2] = [0x1f, 0x8b];
/// Compression method: deflate
pub const CM_DEFLATE: u8 = 8;
/// Fixed header size
pub const HEADER_LEN: usize = 10;
/// Trailer size
pub const TRAILER_LEN: usize = 8;
/// OS byte written by the encoder (Unix)
pub const OS_UNIX: u8 = 3;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xe0;

/// Fixed header emitted by the encoder: no mtime, no optional fields
pub fn member_header(level: u32) -> [u8; HEADER_LEN] {
    let xfl = match level {
        9 => 2,
        0 | 1 => 4,
        _ => 0,
    };
    [
        GZIP_ID[0], GZIP_ID[1], CM_DEFLATE, 0, 0, 0, 0, 0, xfl, OS_UNIX,
    ]
}

/// CRC-32 and length of the uncompressed data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub crc: u32,
    pub isize: u32,
}

impl Trailer {
    pub fn to_bytes(self) -> [u8; TRAILER_LEN] {
        let mut buf = [0u8; TRAILER_LEN];
        buf[..4].copy_from_slice(&self.crc.to_le_bytes());
        buf[4..].copy_from_slice(&self.isize.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; TRAILER_LEN]) -> Self {
        Trailer {
            crc: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            isize: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Fixed-size byte run handed out across as many output windows as needed
#[derive(Debug, Clone)]
pub(crate) struct Pending<const N: usize> {
    bytes: [u8; N],
    pos: usize,
}

impl<const N: usize> Pending<N> {
    pub(crate) fn new(bytes: [u8; N]) -> Self {
        Pending { bytes, pos: 0 }
    }

    /// Copy as much as fits; returns bytes written
    pub(crate) fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = (N - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pos == N
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Fixed,
    ExtraLen,
    Extra { remaining: usize },
    Name,
    Comment,
    HeaderCrc,
    Done,
}

/// Incremental gzip header parser
#[derive(Debug, Clone)]
pub(crate) struct HeaderParser {
    state: HeaderState,
    /// Scratch for fixed-width fields (fixed header, XLEN, CRC16)
    field: [u8; HEADER_LEN],
    have: usize,
    flags: u8,
    len: usize,
    crc: crc32fast::Hasher,
}

impl Default for HeaderParser {
    fn default() -> Self {
        HeaderParser {
            state: HeaderState::Fixed,
            field: [0; HEADER_LEN],
            have: 0,
            flags: 0,
            len: 0,
            crc: crc32fast::Hasher::new(),
        }
    }
}

impl HeaderParser {
    pub(crate) fn is_done(&self) -> bool {
        self.state == HeaderState::Done
    }

    /// Total header bytes consumed so far
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Consume header bytes from `input`; stops at the end of the header
    pub(crate) fn feed(&mut self, input: &[u8]) -> Result<usize, &'static str> {
        let mut consumed = 0;
        while consumed < input.len() && !self.is_done() {
            self.push(input[consumed])?;
            consumed += 1;
        }
        Ok(consumed)
    }

    fn push(&mut self, byte: u8) -> Result<(), &'static str> {
        debug_assert!(!self.is_done(), "Precondition: header already complete");
        self.len += 1;
        if self.state != HeaderState::HeaderCrc {
            self.crc.update(&[byte]);
        }

        match self.state {
            HeaderState::Fixed => {
                self.field[self.have] = byte;
                self.have += 1;
                match self.have {
                    2 if self.field[..2] != GZIP_ID => return Err("incorrect header check"),
                    3 if byte != CM_DEFLATE => return Err("unknown compression method"),
                    4 if byte & FRESERVED != 0 => return Err("unknown header flags set"),
                    4 => self.flags = byte,
                    HEADER_LEN => self.next_after(0),
                    _ => {}
                }
            }
            HeaderState::ExtraLen => {
                self.field[self.have] = byte;
                self.have += 1;
                if self.have == 2 {
                    let xlen = u16::from_le_bytes([self.field[0], self.field[1]]) as usize;
                    if xlen == 0 {
                        self.next_after(FEXTRA);
                    } else {
                        self.state = HeaderState::Extra { remaining: xlen };
                    }
                }
            }
            HeaderState::Extra { remaining } => {
                if remaining == 1 {
                    self.next_after(FEXTRA);
                } else {
                    self.state = HeaderState::Extra {
                        remaining: remaining - 1,
                    };
                }
            }
            HeaderState::Name => {
                if byte == 0 {
                    self.next_after(FNAME);
                }
            }
            HeaderState::Comment => {
                if byte == 0 {
                    self.next_after(FCOMMENT);
                }
            }
            HeaderState::HeaderCrc => {
                self.field[self.have] = byte;
                self.have += 1;
                if self.have == 2 {
                    let expected = u16::from_le_bytes([self.field[0], self.field[1]]);
                    let actual = (self.crc.clone().finalize() & 0xffff) as u16;
                    if expected != actual {
                        return Err("header crc mismatch");
                    }
                    self.state = HeaderState::Done;
                }
            }
            HeaderState::Done => {}
        }
        Ok(())
    }

    /// Move to the first optional field after `finished`
    fn next_after(&mut self, finished: u8) {
        self.have = 0;
        let order = [FEXTRA, FNAME, FCOMMENT, FHCRC];
        let start = order
            .iter()
            .position(|&f| f == finished)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.state = order[start..]
            .iter()
            .find(|&&f| self.flags & f != 0)
            .map(|&f| match f {
                FEXTRA => HeaderState::ExtraLen,
                FNAME => HeaderState::Name,
                FCOMMENT => HeaderState::Comment,
                _ => HeaderState::HeaderCrc,
            })
            .unwrap_or(HeaderState::Done);
    }
}

/// Incremental trailer reader
#[derive(Debug, Clone, Default)]
pub(crate) struct TrailerParser {
    buf: [u8; TRAILER_LEN],
    have: usize,
}

impl TrailerParser {
    pub(crate) fn feed(&mut self, input: &[u8]) -> usize {
        let n = (TRAILER_LEN - self.have).min(input.len());
        self.buf[self.have..self.have + n].copy_from_slice(&input[..n]);
        self.have += n;
        n
    }

    /// Parsed trailer once all eight bytes arrived
    pub(crate) fn trailer(&self) -> Option<Trailer> {
        (self.have == TRAILER_LEN).then(|| Trailer::from_bytes(&self.buf))
    }
}
