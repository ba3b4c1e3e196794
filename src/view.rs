//! Input cursor over shared, reference-counted bytes
//!
//! The view never owns a copy of the data: attaching a `Bytes` only bumps a
//! reference count, and the context advances `consumed` as the engine eats.

use bytes::Bytes;

/// Non-owning window over caller bytes plus a consumed cursor
#[derive(Debug, Clone, Default)]
pub struct InputView {
    data: Bytes,
    consumed: usize,
}

impl InputView {
    pub fn new(data: Bytes) -> Self {
        InputView { data, consumed: 0 }
    }

    /// Bytes not yet handed to the engine
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    #[inline]
    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.consumed
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.consumed == self.data.len()
    }

    /// Mark `n` more bytes as consumed
    pub fn advance(&mut self, n: usize) {
        debug_assert!(
            n <= self.remaining_len(),
            "Precondition: cannot consume {} of {} remaining bytes",
            n,
            self.remaining_len()
        );
        self.consumed += n;
    }

    /// Drop the reference to exhausted data so its owner can reclaim it
    pub(crate) fn release(&mut self) {
        debug_assert!(self.is_exhausted(), "Precondition: only exhausted input is released");
        self.data = Bytes::new();
        self.consumed = 0;
    }
}
