//! Storage Collaborator
//!
//! The cache's object store hands out writable segments; filters fill them
//! and commit. Committed bytes are frozen into shared `Bytes` so later
//! readers (the validate path, delivery) never copy them.
//!
//! ```text
//! acquire_segment(min) ──► Segment { space, used }
//!                               │ filled by the engine or a backend read
//! commit(segment) ──────► Bytes (appended to the object)
//!                               └── unused space kept for the next acquire
//! ```
//!
//! Implementations:
//! - `InMemoryObject`: chunk chain in memory, for tests, the CLI and benches
//! - `SimulatedObject` (in `simulated`): fault-injecting wrapper

use crate::codec::BitMarkers;
use crate::error::FilterError;
use bytes::{Bytes, BytesMut};

/// Writable region of object storage
///
/// `space` is fully initialized; `used` counts the bytes written so far.
#[derive(Debug)]
pub struct Segment {
    space: BytesMut,
    used: usize,
}

impl Segment {
    /// Fresh zeroed segment of `size` bytes
    pub fn with_capacity(size: usize) -> Self {
        Segment {
            space: BytesMut::zeroed(size),
            used: 0,
        }
    }

    fn from_space(space: BytesMut) -> Self {
        Segment { space, used: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.space.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.space.len() - self.used
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used == self.space.len()
    }

    /// Bytes written so far
    pub fn filled(&self) -> &[u8] {
        &self.space[..self.used]
    }

    /// Unwritten tail
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.space[self.used..]
    }

    /// Extend the in-use length after writing into `spare_mut`
    pub fn extend(&mut self, n: usize) {
        assert!(
            n <= self.remaining(),
            "Precondition: segment extend {} exceeds remaining {}",
            n,
            self.remaining()
        );
        self.used += n;
    }

    /// Split into (written bytes, untouched space)
    fn split(mut self) -> (BytesMut, BytesMut) {
        let written = self.space.split_to(self.used);
        (written, self.space)
    }
}

/// Object storage as seen by a fetch filter
pub trait ObjectStorage {
    /// Obtain a segment with at least `min_size` writable bytes
    fn acquire_segment(&mut self, min_size: usize) -> Result<Segment, FilterError>;

    /// Append the segment's written bytes to the object
    ///
    /// Returns the committed bytes as a shared slice. Committing an empty
    /// segment is a no-op returning empty bytes.
    fn commit(&mut self, segment: Segment) -> Bytes;

    /// Total committed object size; never decreases
    fn object_len(&self) -> u64;
}

/// Object record metadata
pub trait ObjectMetadata {
    /// Persist the gzip bit-offset markers on the object record
    fn set_bit_markers(&mut self, markers: BitMarkers);
}

// ============================================================================
// InMemoryObject
// ============================================================================

/// In-memory object body with optional size limit
#[derive(Debug)]
pub struct InMemoryObject {
    chunks: Vec<Bytes>,
    len: u64,
    /// Capacity of segments handed out and not yet committed
    outstanding: u64,
    segment_size: usize,
    limit: Option<u64>,
    spare: BytesMut,
    markers: Option<BitMarkers>,
}

impl InMemoryObject {
    /// Object that grows in `segment_size` steps without bound
    pub fn new(segment_size: usize) -> Self {
        debug_assert!(segment_size > 0, "Precondition: segment size must be positive");
        InMemoryObject {
            chunks: Vec::new(),
            len: 0,
            outstanding: 0,
            segment_size,
            limit: None,
            spare: BytesMut::new(),
            markers: None,
        }
    }

    /// Object refusing to grow past `limit` bytes
    pub fn with_limit(segment_size: usize, limit: u64) -> Self {
        InMemoryObject {
            limit: Some(limit),
            ..Self::new(segment_size)
        }
    }

    /// Committed chunks in order
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Whole body concatenated (copies)
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.len as usize);
        for chunk in &self.chunks {
            body.extend_from_slice(chunk);
        }
        body
    }

    /// Markers recorded by a completed fetch, if any
    pub fn bit_markers(&self) -> Option<BitMarkers> {
        self.markers
    }

    fn size_for(&self, min_size: usize) -> Result<usize, FilterError> {
        let wanted = min_size.max(self.segment_size);
        match self.limit {
            None => Ok(wanted),
            Some(limit) => {
                let room = limit.saturating_sub(self.len + self.outstanding);
                if room < min_size.max(1) as u64 {
                    return Err(FilterError::AllocationFailure {
                        what: "storage segment",
                        size: min_size,
                    });
                }
                Ok(wanted.min(room as usize))
            }
        }
    }
}

impl ObjectStorage for InMemoryObject {
    fn acquire_segment(&mut self, min_size: usize) -> Result<Segment, FilterError> {
        let size = self.size_for(min_size)?;
        let segment = if self.spare.len() >= min_size.max(1) {
            let mut space = std::mem::take(&mut self.spare);
            space.truncate(size);
            Segment::from_space(space)
        } else {
            Segment::with_capacity(size)
        };
        self.outstanding += segment.capacity() as u64;
        Ok(segment)
    }

    fn commit(&mut self, segment: Segment) -> Bytes {
        self.outstanding = self.outstanding.saturating_sub(segment.capacity() as u64);
        let (written, rest) = segment.split();
        if !rest.is_empty() {
            self.spare = rest;
        }
        if written.is_empty() {
            return Bytes::new();
        }

        let bytes = written.freeze();
        self.len += bytes.len() as u64;
        self.chunks.push(bytes.clone());

        debug_assert!(
            self.limit.map_or(true, |limit| self.len <= limit),
            "Invariant violated: object grew past its limit"
        );
        bytes
    }

    fn object_len(&self) -> u64 {
        self.len
    }
}

impl ObjectMetadata for InMemoryObject {
    fn set_bit_markers(&mut self, markers: BitMarkers) {
        debug_assert!(markers.is_ordered(), "Precondition: markers must be ordered");
        self.markers = Some(markers);
    }
}
