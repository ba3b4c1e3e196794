//! Process-wide gzip counters
//!
//! Contexts created per direction and filter failures per kind. Relaxed
//! atomics: the counters are monotonic and only read for reporting.

use crate::codec::Direction;
use crate::error::FilterError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

struct Stats {
    n_gzip: AtomicU64,
    n_gunzip: AtomicU64,
    allocation_failures: AtomicU64,
    codec_errors: AtomicU64,
    premature_ends: AtomicU64,
    trailing_garbage: AtomicU64,
    short_reads: AtomicU64,
    sink_errors: AtomicU64,
}

static STATS: Stats = Stats {
    n_gzip: AtomicU64::new(0),
    n_gunzip: AtomicU64::new(0),
    allocation_failures: AtomicU64::new(0),
    codec_errors: AtomicU64::new(0),
    premature_ends: AtomicU64::new(0),
    trailing_garbage: AtomicU64::new(0),
    short_reads: AtomicU64::new(0),
    sink_errors: AtomicU64::new(0),
};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub n_gzip: u64,
    pub n_gunzip: u64,
    pub allocation_failures: u64,
    pub codec_errors: u64,
    pub premature_ends: u64,
    pub trailing_garbage: u64,
    pub short_reads: u64,
    pub sink_errors: u64,
}

impl StatsSnapshot {
    pub fn failures(&self) -> u64 {
        self.allocation_failures
            + self.codec_errors
            + self.premature_ends
            + self.trailing_garbage
            + self.short_reads
            + self.sink_errors
    }
}

pub(crate) fn record_context(direction: Direction) {
    let counter = match direction {
        Direction::Compress => &STATS.n_gzip,
        Direction::Decompress => &STATS.n_gunzip,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_failure(err: &FilterError) {
    let counter = match err {
        FilterError::AllocationFailure { .. } => &STATS.allocation_failures,
        FilterError::Codec { .. } => &STATS.codec_errors,
        FilterError::PrematureEnd { .. } => &STATS.premature_ends,
        FilterError::TrailingGarbage { .. } => &STATS.trailing_garbage,
        FilterError::Backend(_) => &STATS.short_reads,
        FilterError::Sink(_) => &STATS.sink_errors,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        n_gzip: STATS.n_gzip.load(Ordering::Relaxed),
        n_gunzip: STATS.n_gunzip.load(Ordering::Relaxed),
        allocation_failures: STATS.allocation_failures.load(Ordering::Relaxed),
        codec_errors: STATS.codec_errors.load(Ordering::Relaxed),
        premature_ends: STATS.premature_ends.load(Ordering::Relaxed),
        trailing_garbage: STATS.trailing_garbage.load(Ordering::Relaxed),
        short_reads: STATS.short_reads.load(Ordering::Relaxed),
        sink_errors: STATS.sink_errors.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and tests run in parallel: only check growth
    #[test]
    fn test_counters_only_grow() {
        let before = snapshot();
        record_context(Direction::Compress);
        record_context(Direction::Decompress);
        record_failure(&FilterError::PrematureEnd { tag: "U F -".into() });
        let after = snapshot();

        assert!(after.n_gzip > before.n_gzip);
        assert!(after.n_gunzip > before.n_gunzip);
        assert!(after.premature_ends > before.premature_ends);
        assert!(after.failures() > before.failures());
    }
}
