//! Simulated Collaborators with Fault Injection
//!
//! Storage and backend wrappers that fail, shrink reads, or cut
//! connections according to one seeded RNG. Storage and backend share the
//! injector, so a seed fixes the entire fault schedule of a run.
//!
//! ```text
//! for seed in 0..N {
//!     let faults = FaultInjector::new(seed, FaultConfig::moderate());
//!     let object = SimulatedObject::new(InMemoryObject::new(..), faults.clone());
//!     let backend = SimulatedBackend::new(ScriptedBackend::chunked(..), faults);
//!     // drive a fetch, check invariants, report the seed on failure
//! }
//! ```

use crate::backend::BackendConnection;
use crate::codec::BitMarkers;
use crate::error::FilterError;
use crate::storage::{ObjectMetadata, ObjectStorage, Segment};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io;
use std::sync::Arc;

/// Fault probabilities
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability that a segment acquisition fails
    pub acquire_fail_prob: f64,
    /// Probability that a backend read returns fewer bytes than asked
    pub short_read_prob: f64,
    /// Probability that a backend read fails outright
    pub read_error_prob: f64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::moderate()
    }
}

impl FaultConfig {
    /// No faults - for baseline runs
    pub fn no_faults() -> Self {
        FaultConfig {
            acquire_fail_prob: 0.0,
            short_read_prob: 0.0,
            read_error_prob: 0.0,
        }
    }

    /// Fragmented reads only; every run should still succeed
    pub fn calm() -> Self {
        FaultConfig {
            short_read_prob: 0.5,
            ..Self::no_faults()
        }
    }

    pub fn moderate() -> Self {
        FaultConfig {
            acquire_fail_prob: 0.002,
            short_read_prob: 0.3,
            read_error_prob: 0.002,
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        FaultConfig {
            acquire_fail_prob: 0.02,
            short_read_prob: 0.6,
            read_error_prob: 0.02,
        }
    }
}

/// Counters of injected faults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub acquire_attempts: u64,
    pub acquire_failures: u64,
    pub read_attempts: u64,
    pub short_reads: u64,
    pub read_errors: u64,
}

struct InjectorInner {
    rng: ChaCha8Rng,
    stats: FaultStats,
}

/// Seeded fault source shared by the simulated collaborators of one run
#[derive(Clone)]
pub struct FaultInjector {
    config: FaultConfig,
    inner: Arc<Mutex<InjectorInner>>,
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl FaultInjector {
    pub fn new(seed: u64, config: FaultConfig) -> Self {
        FaultInjector {
            config,
            inner: Arc::new(Mutex::new(InjectorInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: FaultStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> FaultStats {
        self.inner.lock().stats.clone()
    }

    fn acquire_fails(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.stats.acquire_attempts += 1;
        let fail = inner.rng.gen_bool(self.config.acquire_fail_prob);
        if fail {
            inner.stats.acquire_failures += 1;
        }
        fail
    }

    /// Decide the fate of one read into a buffer of `len` bytes
    fn read_plan(&self, len: usize) -> Result<usize, io::Error> {
        let mut inner = self.inner.lock();
        inner.stats.read_attempts += 1;
        if inner.rng.gen_bool(self.config.read_error_prob) {
            inner.stats.read_errors += 1;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated connection reset",
            ));
        }
        if len > 1 && inner.rng.gen_bool(self.config.short_read_prob) {
            inner.stats.short_reads += 1;
            return Ok(inner.rng.gen_range(1..len));
        }
        Ok(len)
    }
}

// ============================================================================
// SimulatedObject
// ============================================================================

/// Object storage wrapper whose segment acquisition may fail
#[derive(Debug)]
pub struct SimulatedObject<O> {
    inner: O,
    faults: FaultInjector,
}

impl<O> SimulatedObject<O> {
    pub fn new(inner: O, faults: FaultInjector) -> Self {
        SimulatedObject { inner, faults }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<O: ObjectStorage> ObjectStorage for SimulatedObject<O> {
    fn acquire_segment(&mut self, min_size: usize) -> Result<Segment, FilterError> {
        if self.faults.acquire_fails() {
            return Err(FilterError::AllocationFailure {
                what: "storage segment",
                size: min_size,
            });
        }
        self.inner.acquire_segment(min_size)
    }

    fn commit(&mut self, segment: Segment) -> Bytes {
        self.inner.commit(segment)
    }

    fn object_len(&self) -> u64 {
        self.inner.object_len()
    }
}

impl<O: ObjectMetadata> ObjectMetadata for SimulatedObject<O> {
    fn set_bit_markers(&mut self, markers: BitMarkers) {
        self.inner.set_bit_markers(markers);
    }
}

// ============================================================================
// SimulatedBackend
// ============================================================================

/// Backend wrapper that fragments reads and drops connections
#[derive(Debug)]
pub struct SimulatedBackend<B> {
    inner: B,
    faults: FaultInjector,
}

impl<B> SimulatedBackend<B> {
    pub fn new(inner: B, faults: FaultInjector) -> Self {
        SimulatedBackend { inner, faults }
    }
}

impl<B: BackendConnection> BackendConnection for SimulatedBackend<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.faults.read_plan(buf.len())?;
        self.inner.read(&mut buf[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::storage::InMemoryObject;

    #[test]
    fn test_same_seed_same_schedule() {
        let schedule = |seed| {
            let faults = FaultInjector::new(seed, FaultConfig::high_chaos());
            let mut backend =
                SimulatedBackend::new(ScriptedBackend::chunked(&[7u8; 4096], 4096), faults.clone());
            let mut sizes = Vec::new();
            let mut buf = [0u8; 64];
            for _ in 0..50 {
                sizes.push(backend.read(&mut buf).map_err(|e| e.kind()));
            }
            (sizes, faults.stats())
        };
        assert_eq!(schedule(42), schedule(42));
        assert_ne!(schedule(1).0, schedule(2).0);
    }

    #[test]
    fn test_no_faults_is_transparent() {
        let faults = FaultInjector::new(0, FaultConfig::no_faults());
        let mut object = SimulatedObject::new(InMemoryObject::new(8), faults.clone());
        for _ in 0..100 {
            let segment = object.acquire_segment(1).unwrap();
            object.commit(segment);
        }
        let mut backend = SimulatedBackend::new(ScriptedBackend::chunked(b"abcdef", 6), faults.clone());
        let mut buf = [0u8; 6];
        assert_eq!(backend.read(&mut buf).unwrap(), 6);

        let stats = faults.stats();
        assert_eq!(stats.acquire_attempts, 100);
        assert_eq!(stats.acquire_failures + stats.short_reads + stats.read_errors, 0);
    }

    #[test]
    fn test_certain_acquire_failure() {
        let config = FaultConfig {
            acquire_fail_prob: 1.0,
            ..FaultConfig::no_faults()
        };
        let mut object = SimulatedObject::new(InMemoryObject::new(8), FaultInjector::new(3, config));
        let err = object.acquire_segment(4).unwrap_err();
        assert_eq!(err.kind(), "allocation_failure");
        assert_eq!(object.object_len(), 0);
    }
}
