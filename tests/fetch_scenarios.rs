//! End-to-end fetch and delivery scenarios
//!
//! Each test drives a filter the way the cache does: a backend feeding a
//! fetch filter into an object, or a stored object pushed through a
//! delivery filter into a client sink.

use cache_gzip::{
    BitMarkers, DeliveryFilter, Fetch, FetchFilter, FetchMode, FilterError, GzipConfig, InMemoryObject,
    ObjectStorage, Pull, ScriptedBackend, TrailingGarbage,
};
use flate2::{Decompress, FlushDecompress, Status};
use std::io::Read;

fn drain(
    mode: FetchMode,
    config: &GzipConfig,
    backend: &mut ScriptedBackend,
    budget: usize,
) -> (Fetch<InMemoryObject>, Result<(), FilterError>) {
    let mut fetch = Fetch::new(InMemoryObject::new(config.segment_size));
    let mut filter: FetchFilter = FetchFilter::begin(mode, config).unwrap();
    let pulled = loop {
        match filter.bytes(&mut fetch, backend, budget) {
            Ok(Pull::Budget) => {}
            Ok(Pull::Eof) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    let ended = filter.end(&mut fetch);
    (fetch, pulled.and(ended))
}

fn gzip(plain: &[u8]) -> Vec<u8> {
    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::chunked(plain, 11);
    let (fetch, result) = drain(FetchMode::Gzip, &config, &mut backend, 32);
    result.unwrap();
    fetch.into_object().body()
}

fn gunzip_reference(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

/// Raw-inflate a slice of deflate data
fn inflate_raw(deflate: &[u8], flush: FlushDecompress, expect_end: bool, capacity: usize) -> Vec<u8> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(capacity);
    let status = inflater.decompress_vec(deflate, &mut out, flush).unwrap();
    assert_eq!(inflater.total_in() as usize, deflate.len());
    if expect_end {
        assert_eq!(status, Status::StreamEnd);
    }
    out
}

// =============================================================================
// Decompress on fetch
// =============================================================================

#[test]
fn test_empty_backend_body() {
    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::default();
    let (fetch, result) = drain(FetchMode::Gunzip, &config, &mut backend, 64);

    result.unwrap();
    assert!(!fetch.is_failed());
    let object = fetch.into_object();
    assert_eq!(object.object_len(), 0);
    let markers = object.bit_markers().unwrap();
    assert!(markers.is_ordered());
}

#[test]
fn test_one_byte_reads() {
    let plain: Vec<u8> = (0..100u8).collect();
    let compressed = gzip(&plain);

    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::chunked(&compressed, 1);
    let (fetch, result) = drain(FetchMode::Gunzip, &config, &mut backend, 1);

    result.unwrap();
    assert_eq!(fetch.into_object().body(), plain);
}

#[test]
fn test_truncated_body_fails() {
    let compressed = gzip(&b"a body that loses its trailer ".repeat(10));
    let truncated = &compressed[..compressed.len() - 4];

    for mode in [FetchMode::Gunzip, FetchMode::TestGunzip] {
        let config = GzipConfig::test();
        let mut backend = ScriptedBackend::chunked(truncated, 9);
        let (fetch, result) = drain(mode, &config, &mut backend, 40);

        let err = result.unwrap_err();
        assert!(
            matches!(err, FilterError::PrematureEnd { .. } | FilterError::Codec { .. }),
            "{:?}: {}",
            mode,
            err
        );
        assert!(fetch.is_failed());
        assert!(fetch.object().bit_markers().is_none());
    }
}

#[test]
fn test_corrupt_body_is_codec_error() {
    let mut compressed = gzip(&b"checksummed ".repeat(20));
    let crc_at = compressed.len() - 8;
    compressed[crc_at] ^= 0xff;

    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::chunked(&compressed, 16);
    let (fetch, result) = drain(FetchMode::Gunzip, &config, &mut backend, 64);

    let err = result.unwrap_err();
    assert_eq!(err.kind(), "codec_error");
    assert!(err.to_string().starts_with("U F -: codec error"));
    assert!(fetch.is_failed());
}

#[test]
fn test_gunzip_rejects_trailing_garbage_when_configured() {
    let mut data = gzip(b"member");
    data.extend_from_slice(b"GARBAGE");

    let config = GzipConfig {
        trailing_garbage: TrailingGarbage::Reject,
        chunk_size: 64,
        ..GzipConfig::test()
    };
    let mut backend = ScriptedBackend::chunked(&data, 64);
    let (fetch, result) = drain(FetchMode::Gunzip, &config, &mut backend, 64);

    let err = result.unwrap_err();
    assert!(matches!(err, FilterError::TrailingGarbage { unconsumed: 7, .. }));
    assert!(fetch.is_failed());
}

// =============================================================================
// Compress on fetch with flush points
// =============================================================================

#[test]
fn test_align_boundaries_are_resumable() {
    let plain = vec![b'A'; 1000];
    let budget = 100;
    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::chunked(&plain, 100);
    let mut fetch = Fetch::new(InMemoryObject::new(config.segment_size));
    let mut filter: FetchFilter = FetchFilter::begin(FetchMode::Gzip, &config).unwrap();

    let mut boundaries: Vec<(usize, BitMarkers)> = Vec::new();
    let mut consumed = 0;
    while filter.bytes(&mut fetch, &mut backend, budget).unwrap() == Pull::Budget {
        consumed += budget;
        let markers = filter.align(&mut fetch).unwrap();
        if let Some((_, previous)) = boundaries.last() {
            assert!(markers.follows(previous));
        }
        assert_eq!(markers.last % 8, 0, "align leaves a byte boundary");
        boundaries.push((consumed, markers));
    }
    filter.end(&mut fetch).unwrap();

    let body = fetch.into_object().body();
    assert_eq!(gunzip_reference(&body), plain);

    for (consumed, markers) in &boundaries {
        let prefix = &body[10..(markers.last / 8) as usize];
        let inflated = inflate_raw(prefix, FlushDecompress::Sync, false, plain.len() + 64);
        assert_eq!(inflated, &plain[..*consumed]);
    }
}

#[test]
fn test_reset_starts_an_independent_suffix() {
    let plain: Vec<u8> = b"0123456789abcdef".iter().copied().cycle().take(800).collect();
    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::chunked(&plain, 50);
    let mut fetch = Fetch::new(InMemoryObject::new(config.segment_size));
    let mut filter: FetchFilter = FetchFilter::begin(FetchMode::Gzip, &config).unwrap();

    assert_eq!(filter.bytes(&mut fetch, &mut backend, 400).unwrap(), Pull::Budget);
    let markers = filter.reset(&mut fetch).unwrap();
    while filter.bytes(&mut fetch, &mut backend, 400).unwrap() == Pull::Budget {}
    filter.end(&mut fetch).unwrap();

    let object = fetch.into_object();
    let body = object.body();
    let stored = object.bit_markers().unwrap();
    assert!(stored.follows(&markers));

    // No back-references cross a reset point
    let suffix = &body[(markers.last / 8) as usize..body.len() - 8];
    let inflated = inflate_raw(suffix, FlushDecompress::Finish, true, plain.len() + 64);
    assert_eq!(inflated, &plain[400..]);
}

#[test]
fn test_stored_markers_match_final_block() {
    let plain = b"markers point at the final block".repeat(8);
    let compressed = gzip(&plain);

    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::chunked(&compressed, 13);
    let (fetch, result) = drain(FetchMode::TestGunzip, &config, &mut backend, 26);
    result.unwrap();

    let object = fetch.into_object();
    let markers = object.bit_markers().unwrap();
    assert_eq!(markers.start, 80);
    assert!(markers.is_ordered());
    assert!(markers.stop <= ((compressed.len() - 8) * 8) as u64);
    assert_eq!(object.body(), compressed);
}

// =============================================================================
// Delivery
// =============================================================================

#[test]
fn test_delivery_gzip_for_clients() {
    let plain = b"delivered compressed to a client that accepts gzip\n".repeat(40);
    let config = GzipConfig::test();
    let mut filter: DeliveryFilter = DeliveryFilter::gzip(&config).unwrap();
    let mut client = Vec::new();

    for chunk in plain.chunks(17) {
        filter.bytes(bytes::Bytes::copy_from_slice(chunk), &mut client).unwrap();
    }
    let teardown = filter.end(&mut client, false).unwrap();

    assert_eq!(teardown.summary.bytes_in, plain.len() as u64);
    assert_eq!(teardown.summary.bytes_out, client.len() as u64);
    assert_eq!(gunzip_reference(&client), plain);
}

#[test]
fn test_delivery_of_a_fetched_object() {
    let plain = b"stored compressed, delivered plain. ".repeat(50);
    let config = GzipConfig::test();
    let mut backend = ScriptedBackend::chunked(&plain, 64);
    let (fetch, result) = drain(FetchMode::Gzip, &config, &mut backend, 64);
    result.unwrap();
    let object = fetch.into_object();

    let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config).unwrap();
    let mut client = Vec::new();
    for chunk in object.chunks() {
        filter.bytes(chunk.clone(), &mut client).unwrap();
    }
    filter.end(&mut client, false).unwrap();
    assert_eq!(client, plain);
}

#[test]
fn test_delivery_of_truncated_object_fails() {
    let compressed = gzip(b"cut short");
    let config = GzipConfig::test();
    let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config).unwrap();
    let mut client = Vec::new();

    filter
        .bytes(bytes::Bytes::copy_from_slice(&compressed[..compressed.len() - 3]), &mut client)
        .unwrap();
    let err = filter.end(&mut client, false).unwrap_err();
    assert_eq!(err.kind(), "premature_end");
}
