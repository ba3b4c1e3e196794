//! Deterministic Simulation Testing for the Fetch and Delivery Filters
//!
//! Every run is driven by one seed: the workload (bodies, budgets, flush
//! points, truncations), the buffer sizes, and the fault schedule of the
//! simulated storage and backend.
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = FetchDSTHarness::new(FetchDSTConfig::moderate(seed));
//!     harness.run(20);
//!     assert!(harness.result().is_success(), "seed {}", seed);
//! }
//! ```
//!
//! Invariants checked per operation:
//! - object size never decreases while a fetch runs
//! - a successful fetch stores exactly the expected bytes and ordered markers
//! - a failed fetch records no markers and fails only for an injected
//!   fault or a malformed body
//! - markers never move backwards across flush points
//! - delivery reproduces the plaintext with pushes bounded by the scratch size

use crate::backend::ScriptedBackend;
use crate::codec::BitMarkers;
use crate::config::GzipConfig;
use crate::delivery::{ByteSink, DeliveryFilter, SinkAction};
use crate::error::FilterError;
use crate::fetch::{Fetch, FetchFilter, FetchMode, Pull};
use crate::simulated::{FaultConfig, FaultInjector, FaultStats, SimulatedBackend, SimulatedObject};
use crate::storage::{InMemoryObject, ObjectStorage};
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{self, Read};

/// Configuration for a fetch DST run
#[derive(Debug, Clone)]
pub struct FetchDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Storage and backend faults
    pub faults: FaultConfig,
    /// Largest generated body
    pub max_body: usize,
    /// Probability of a flush point between pulls (compress only)
    pub flush_point_probability: f64,
    /// Probability that an operation feeds a truncated gzip body
    pub truncate_probability: f64,
}

impl Default for FetchDSTConfig {
    fn default() -> Self {
        FetchDSTConfig {
            seed: 0,
            faults: FaultConfig::moderate(),
            max_body: 3000,
            flush_point_probability: 0.1,
            truncate_probability: 0.1,
        }
    }
}

impl FetchDSTConfig {
    pub fn new(seed: u64) -> Self {
        FetchDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - fragmented reads, no failures
    pub fn calm(seed: u64) -> Self {
        FetchDSTConfig {
            seed,
            faults: FaultConfig::calm(),
            truncate_probability: 0.0,
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        FetchDSTConfig {
            seed,
            faults: FaultConfig::moderate(),
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive fault injection
    pub fn chaos(seed: u64) -> Self {
        FetchDSTConfig {
            seed,
            faults: FaultConfig::high_chaos(),
            flush_point_probability: 0.2,
            truncate_probability: 0.2,
            ..Default::default()
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct FetchDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    /// Failed operations (expected under faults and truncation)
    pub failed_operations: u64,
    pub flush_points: u64,
    pub fault_stats: FaultStats,
    pub invariant_violations: Vec<String>,
}

impl FetchDSTResult {
    pub fn new(seed: u64) -> Self {
        FetchDSTResult {
            seed,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            flush_points: 0,
            fault_stats: FaultStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} ok, {} failed), {} flush points, {} violations",
            self.seed,
            self.total_operations,
            self.successful_operations,
            self.failed_operations,
            self.flush_points,
            self.invariant_violations.len()
        )
    }
}

type DSTObject = SimulatedObject<InMemoryObject>;

/// Outcome of one simulated fetch
struct FetchRun {
    object: InMemoryObject,
    error: Option<FilterError>,
}

/// Sink checking the scratch bound on every push
struct BoundedSink {
    body: Vec<u8>,
    limit: usize,
    oversized: usize,
    ended: bool,
}

impl ByteSink for BoundedSink {
    fn push(&mut self, action: SinkAction, data: &[u8]) -> io::Result<()> {
        if data.len() > self.limit {
            self.oversized += 1;
        }
        self.body.extend_from_slice(data);
        self.ended |= action == SinkAction::End;
        Ok(())
    }
}

pub struct FetchDSTHarness {
    config: FetchDSTConfig,
    rng: ChaCha8Rng,
    faults: FaultInjector,
    result: FetchDSTResult,
}

impl FetchDSTHarness {
    pub fn new(config: FetchDSTConfig) -> Self {
        // Different stream for the fault schedule
        let faults = FaultInjector::new(config.seed.wrapping_add(1), config.faults.clone());
        FetchDSTHarness {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            faults,
            result: FetchDSTResult::new(config.seed),
            config,
        }
    }

    pub fn result(&self) -> &FetchDSTResult {
        &self.result
    }

    pub fn into_result(self) -> FetchDSTResult {
        self.result
    }

    fn violation(&mut self, msg: String) {
        self.result
            .invariant_violations
            .push(format!("seed {}: {}", self.config.seed, msg));
    }

    /// Run `operations` gzip/validate/gunzip/deliver cycles
    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            self.run_operation();
        }
        self.result.fault_stats = self.faults.stats();
    }

    fn random_config(&mut self) -> GzipConfig {
        GzipConfig {
            level: self.rng.gen_range(0..=9),
            memory_level: self.rng.gen_range(1..=9),
            chunk_size: self.rng.gen_range(1..=64),
            buffer_size: self.rng.gen_range(64..=256),
            segment_size: self.rng.gen_range(1..=64),
            ..GzipConfig::default()
        }
    }

    fn random_body(&mut self) -> Vec<u8> {
        let len = self.rng.gen_range(0..=self.config.max_body);
        match self.rng.gen_range(0..3) {
            0 => b"the quick brown fox jumps over the lazy dog "
                .iter()
                .copied()
                .cycle()
                .take(len)
                .collect(),
            1 => (0..len).map(|_| self.rng.gen()).collect(),
            _ => vec![b'A'; len],
        }
    }

    fn record(&mut self, ok: bool) {
        self.result.total_operations += 1;
        if ok {
            self.result.successful_operations += 1;
        } else {
            self.result.failed_operations += 1;
        }
    }

    fn run_operation(&mut self) {
        let config = self.random_config();
        let plain = self.random_body();

        // Compress on fetch
        let gzip = self.fetch(FetchMode::Gzip, &config, &plain);
        let compressed = match self.check_fetch("gzip", gzip, &plain, |object, plain| {
            decode_gzip(&object.body()).map_or(false, |decoded| decoded == plain)
        }) {
            Some(object) => object.body(),
            None => return,
        };

        let truncate = !compressed.is_empty() && self.rng.gen_bool(self.config.truncate_probability);
        if truncate {
            let cut = self.rng.gen_range(1..compressed.len());
            let body = compressed[..cut].to_vec();
            for mode in [FetchMode::Gunzip, FetchMode::TestGunzip] {
                let run = self.fetch(mode, &config, &body);
                self.check_truncated(mode, run);
            }
            return;
        }

        // Validate on fetch stores the gzip bytes unchanged
        let validate = self.fetch(FetchMode::TestGunzip, &config, &compressed);
        self.check_fetch("validate", validate, &compressed, |object, expected| {
            object.body() == expected
        });

        // Decompress on fetch restores the plaintext
        let gunzip = self.fetch(FetchMode::Gunzip, &config, &compressed);
        self.check_fetch("gunzip", gunzip, &plain, |object, expected| {
            object.body() == expected
        });

        self.deliver(&config, &compressed, &plain);
    }

    /// Drive one fetch the way a fetch worker would
    fn fetch(&mut self, mode: FetchMode, config: &GzipConfig, body: &[u8]) -> FetchRun {
        let object = SimulatedObject::new(InMemoryObject::new(config.segment_size), self.faults.clone());
        let mut fetch: Fetch<DSTObject> = Fetch::new(object);
        let read_size = self.rng.gen_range(1..=128);
        let mut backend = SimulatedBackend::new(ScriptedBackend::chunked(body, read_size), self.faults.clone());

        let mut filter: FetchFilter = match FetchFilter::begin(mode, config) {
            Ok(filter) => filter,
            Err(e) => {
                return FetchRun {
                    object: fetch.into_object().into_inner(),
                    error: Some(e),
                }
            }
        };

        let mut error = None;
        let mut last_len = 0;
        let mut last_markers = filter.markers();
        loop {
            let budget = self.rng.gen_range(1..=200);
            let pulled = filter.bytes(&mut fetch, &mut backend, budget);

            let len = fetch.object().object_len();
            if len < last_len {
                self.violation(format!("{:?}: object shrank from {} to {}", mode, last_len, len));
            }
            last_len = len;

            match pulled {
                Ok(Pull::Eof) => break,
                Ok(Pull::Budget) => {}
                Err(e) => {
                    if matches!(e, FilterError::Backend(_)) {
                        fetch.fail(&e);
                    }
                    error = Some(e);
                    break;
                }
            }

            if mode == FetchMode::Gzip && self.rng.gen_bool(self.config.flush_point_probability) {
                self.result.flush_points += 1;
                let flushed = if self.rng.gen_bool(0.5) {
                    filter.align(&mut fetch)
                } else {
                    filter.reset(&mut fetch)
                };
                match flushed {
                    Ok(markers) => {
                        self.check_markers_follow(mode, &last_markers, &markers);
                        last_markers = markers;
                    }
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
        }

        if let Err(e) = filter.end(&mut fetch) {
            error.get_or_insert(e);
        }
        if fetch.is_failed() && error.is_none() {
            self.violation(format!("{:?}: fetch failed without an error", mode));
        }
        let object = fetch.into_object().into_inner();
        if let Some(markers) = object.bit_markers() {
            self.check_markers_follow(mode, &last_markers, &markers);
        }
        FetchRun { object, error }
    }

    fn check_markers_follow(&mut self, mode: FetchMode, earlier: &BitMarkers, later: &BitMarkers) {
        if !later.is_ordered() {
            self.violation(format!("{:?}: markers out of order {:?}", mode, later));
        }
        // Markers start counting once the header is known
        if earlier.start != 0 && !later.follows(earlier) {
            self.violation(format!("{:?}: markers moved back {:?} -> {:?}", mode, earlier, later));
        }
    }

    /// Judge a fetch over a well-formed body
    fn check_fetch(
        &mut self,
        label: &str,
        run: FetchRun,
        expected: &[u8],
        content_ok: impl Fn(&InMemoryObject, &[u8]) -> bool,
    ) -> Option<InMemoryObject> {
        match run.error {
            None => {
                self.record(true);
                if !content_ok(&run.object, expected) {
                    self.violation(format!("{}: stored bytes differ from expected", label));
                }
                if run.object.bit_markers().is_none() {
                    self.violation(format!("{}: completed without markers", label));
                }
                Some(run.object)
            }
            Some(e) => {
                self.record(false);
                if !matches!(e.kind(), "allocation_failure" | "short_read") {
                    self.violation(format!("{}: unexpected failure on valid data: {}", label, e));
                }
                if run.object.bit_markers().is_some() {
                    self.violation(format!("{}: failed fetch recorded markers", label));
                }
                None
            }
        }
    }

    fn check_truncated(&mut self, mode: FetchMode, run: FetchRun) {
        self.record(run.error.is_none());
        match run.error {
            None => self.violation(format!("{:?}: truncated body accepted", mode)),
            Some(e) => {
                if !matches!(
                    e.kind(),
                    "codec_error" | "premature_end" | "allocation_failure" | "short_read"
                ) {
                    self.violation(format!("{:?}: truncated body failed oddly: {}", mode, e));
                }
            }
        }
        if run.object.bit_markers().is_some() {
            self.violation(format!("{:?}: truncated body recorded markers", mode));
        }
    }

    /// Deliver the stored gzip object to a client that cannot take gzip
    fn deliver(&mut self, config: &GzipConfig, compressed: &[u8], plain: &[u8]) {
        let mut filter: DeliveryFilter = match DeliveryFilter::gunzip(config) {
            Ok(filter) => filter,
            Err(e) => {
                self.violation(format!("deliver: begin failed: {}", e));
                return;
            }
        };
        let mut sink = BoundedSink {
            body: Vec::new(),
            limit: config.buffer_size,
            oversized: 0,
            ended: false,
        };

        let mut pos = 0;
        while pos < compressed.len() {
            let n = self.rng.gen_range(0..=64).min(compressed.len() - pos);
            let chunk = Bytes::copy_from_slice(&compressed[pos..pos + n]);
            pos += n;
            if let Err(e) = filter.bytes(chunk, &mut sink) {
                self.violation(format!("deliver: chunk failed: {}", e));
                self.record(false);
                return;
            }
            if filter.buffered() > config.buffer_size {
                self.violation(format!("deliver: {} bytes buffered", filter.buffered()));
            }
        }

        match filter.end(&mut sink, false) {
            Ok(_) => self.record(true),
            Err(e) => {
                self.record(false);
                self.violation(format!("deliver: end failed: {}", e));
            }
        }
        if sink.body != plain {
            self.violation("deliver: plaintext differs".to_string());
        }
        if sink.oversized > 0 {
            self.violation(format!("deliver: {} pushes above the scratch size", sink.oversized));
        }
        if !sink.ended {
            self.violation("deliver: no end push".to_string());
        }
    }
}

/// Independent decoder used as the oracle for compressed objects
fn decode_gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Run a batch of DST runs with consecutive seeds
pub fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> FetchDSTConfig,
) -> Vec<FetchDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = FetchDSTHarness::new(config_fn(seed));
        harness.run(ops_per_run);
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[FetchDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_failed: u64 = results.iter().map(|r| r.failed_operations).sum();
    let total_flush_points: u64 = results.iter().map(|r| r.flush_points).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops ({} failed), {} flush points",
        passed, total, total_ops, total_failed, total_flush_points
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}
