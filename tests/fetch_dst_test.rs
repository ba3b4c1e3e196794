//! Fetch Filter DST Tests
//!
//! Deterministic simulation tests (seed-based) for the fetch and delivery
//! filters. Each seed picks bodies, buffer sizes, budgets, flush points and
//! a fault schedule for storage and backend.
//!
//! ## Test Categories
//!
//! - **Calm tests**: fragmented reads only, every operation must succeed
//! - **Moderate tests**: rare allocation and connection failures
//! - **Chaos tests**: frequent faults, truncated bodies, many flush points

use cache_gzip::dst::{run_dst_batch, summarize_batch, FetchDSTConfig, FetchDSTHarness};

// =============================================================================
// Single Seed Tests
// =============================================================================

#[test]
fn test_fetch_dst_single_calm() {
    let mut harness = FetchDSTHarness::new(FetchDSTConfig::calm(12345));
    harness.run(50);

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert_eq!(result.failed_operations, 0);
    assert!(result.fault_stats.short_reads > 0, "calm mode fragments reads");
}

#[test]
fn test_fetch_dst_single_moderate() {
    let mut harness = FetchDSTHarness::new(FetchDSTConfig::moderate(54321));
    harness.run(50);

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Faults must surface as failed fetches, not broken objects: {:?}",
        result.invariant_violations
    );
    assert!(result.total_operations >= 50);
}

#[test]
fn test_fetch_dst_single_chaos() {
    let mut harness = FetchDSTHarness::new(FetchDSTConfig::chaos(99999));
    harness.run(40);

    let result = harness.result();
    println!("{}", result.summary());
    println!("Fault stats: {:?}", result.fault_stats);

    assert!(result.total_operations >= 40);
    assert!(result.failed_operations > 0, "chaos should fail some fetches");
}

// =============================================================================
// Multi-Seed Batch Tests (DST)
// =============================================================================

#[test]
fn test_fetch_dst_50_seeds_calm() {
    let results = run_dst_batch(0, 50, 10, FetchDSTConfig::calm);

    let summary = summarize_batch(&results);
    println!("50 Seeds Calm:\n{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(
        passed,
        results.len(),
        "All calm runs should pass. Failed seeds: {:?}",
        results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.seed)
            .collect::<Vec<_>>()
    );
}

#[test]
fn test_fetch_dst_50_seeds_moderate() {
    let results = run_dst_batch(1000, 50, 10, FetchDSTConfig::moderate);

    let summary = summarize_batch(&results);
    println!("50 Seeds Moderate:\n{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert!(
        passed >= 40,
        "At least 80% of moderate runs should pass. Passed: {}/{}",
        passed,
        results.len()
    );
}

#[test]
fn test_fetch_dst_30_seeds_chaos() {
    let results = run_dst_batch(2000, 30, 10, FetchDSTConfig::chaos);

    let summary = summarize_batch(&results);
    println!("30 Seeds Chaos:\n{}", summary);

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    assert!(total_ops >= 30 * 10, "Should complete all operations: {}", total_ops);
    let flush_points: u64 = results.iter().map(|r| r.flush_points).sum();
    assert!(flush_points > 0, "chaos runs insert flush points");
}

// =============================================================================
// Stress
// =============================================================================

#[test]
fn test_fetch_dst_flush_point_stress() {
    let mut config = FetchDSTConfig::calm(7777);
    config.flush_point_probability = 0.5;

    let mut harness = FetchDSTHarness::new(config);
    harness.run(30);

    let result = harness.result();
    println!("Flush point stress:\n{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result.flush_points > 0, "Should have some flush points");
}

#[test]
fn test_fetch_dst_truncation_stress() {
    let mut config = FetchDSTConfig::calm(8888);
    config.truncate_probability = 0.5;

    let mut harness = FetchDSTHarness::new(config);
    harness.run(40);

    let result = harness.result();
    println!("Truncation stress:\n{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    // Every truncated body is a failed fetch
    assert!(result.failed_operations > 0);
}

// =============================================================================
// Determinism Verification
// =============================================================================

#[test]
fn test_fetch_dst_determinism() {
    fn run_seed(seed: u64) -> (u64, u64, u64) {
        let mut harness = FetchDSTHarness::new(FetchDSTConfig::moderate(seed));
        harness.run(20);
        let result = harness.result();
        (
            result.successful_operations,
            result.failed_operations,
            result.flush_points,
        )
    }

    let seed = 42424242;
    let run1 = run_seed(seed);
    let run2 = run_seed(seed);

    assert_eq!(
        run1, run2,
        "Same seed should produce identical results: {:?} vs {:?}",
        run1, run2
    );
}
