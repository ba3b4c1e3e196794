//! Bounded scratch buffer for push-style consumers
//!
//! Allocated lazily, at most once per context, at the configured capacity.
//! The fill length marks how much has been produced but not yet flushed.

use crate::error::FilterError;

#[derive(Debug)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
    fill: usize,
}

impl ScratchBuffer {
    /// Allocate `capacity` bytes, reporting failure instead of aborting
    pub fn allocate(capacity: usize) -> Result<Self, FilterError> {
        let failure = FilterError::AllocationFailure {
            what: "scratch buffer",
            size: capacity,
        };
        if capacity == 0 {
            return Err(failure);
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|_| failure)?;
        buf.resize(capacity, 0);
        Ok(ScratchBuffer { buf, fill: 0 })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn fill(&self) -> usize {
        self.fill
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.fill == self.buf.len()
    }

    /// Produced, unflushed bytes
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.fill]
    }

    /// Writable tail of the buffer
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.fill..]
    }

    pub(crate) fn extend(&mut self, n: usize) {
        self.fill += n;
        debug_assert!(
            self.fill <= self.buf.len(),
            "Invariant violated: fill {} exceeds capacity {}",
            self.fill,
            self.buf.len()
        );
    }

    /// Rewind after the filled prefix was handed downstream
    pub(crate) fn reset(&mut self) {
        self.fill = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_reset() {
        let mut scratch = ScratchBuffer::allocate(8).unwrap();
        assert_eq!(scratch.capacity(), 8);
        scratch.spare_mut()[..3].copy_from_slice(b"abc");
        scratch.extend(3);
        assert_eq!(scratch.filled(), b"abc");
        assert_eq!(scratch.spare_mut().len(), 5);
        scratch.spare_mut().fill(b'x');
        scratch.extend(5);
        assert!(scratch.is_full());
        scratch.reset();
        assert_eq!(scratch.fill(), 0);
    }

    #[test]
    fn test_zero_capacity_is_allocation_failure() {
        let err = ScratchBuffer::allocate(0).unwrap_err();
        assert_eq!(err.kind(), "allocation_failure");
    }

    #[test]
    fn test_absurd_capacity_is_allocation_failure() {
        assert!(ScratchBuffer::allocate(usize::MAX).is_err());
    }
}
