//! Batch partition and wire-format properties, exercised through the
//! public API the backends use when seeding and claiming.

use std::collections::{HashMap, HashSet};

use chrono::{TimeZone, Utc};
use gridsweep::compute::{compute_parameter, ChunkOutcome};
use gridsweep::models::{plan_chunks, Chunk, ChunkStatus};

fn seed_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
}

/// The seeded chunks partition [0, N) for a grid of batch shapes: no gap,
/// no overlap, ceil(N/S) chunks, remainder in the final chunk.
#[test]
fn seeded_chunks_partition_the_batch() {
    for total in [1u64, 7, 99, 100, 101, 1000, 9999, 10_000] {
        for size in [1u64, 7, 100, 128, 10_000] {
            let chunks = plan_chunks(total, size, seed_time());
            let expected_chunks = total.div_ceil(size);
            assert_eq!(chunks.len() as u64, expected_chunks, "N={} S={}", total, size);

            let mut next_start = 0u64;
            for chunk in &chunks {
                assert_eq!(chunk.start_param, next_start);
                assert!(chunk.end_param > chunk.start_param);
                assert_eq!(chunk.total_params, total);
                assert_eq!(chunk.total_chunks, expected_chunks);
                assert_eq!(chunk.status, ChunkStatus::Pending);
                next_start = chunk.end_param;
            }
            assert_eq!(next_start, total);

            let expected_last = total - (expected_chunks - 1) * size;
            assert_eq!(chunks.last().unwrap().params_count, expected_last);
        }
    }
}

/// Chunk ids are unique, zero-padded, and sort the same way numerically
/// and lexicographically.
#[test]
fn chunk_ids_sort_consistently() {
    let chunks = plan_chunks(10_000, 7, seed_time());

    let ids: HashSet<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
    assert_eq!(ids.len(), chunks.len());

    let mut sorted = chunks.clone();
    sorted.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
    let positions: Vec<u64> = sorted.iter().map(|c| c.start_param).collect();
    let mut expected = positions.clone();
    expected.sort_unstable();
    assert_eq!(positions, expected);
}

/// A chunk survives both wire encodings unchanged: the broker's JSON
/// payload and the streams backend's flat string map.
#[test]
fn chunk_survives_both_wire_formats() {
    let mut chunk = plan_chunks(1000, 100, seed_time()).remove(3);
    chunk.retry_count = 2;
    chunk.last_error = Some("simulated processing fault".to_string());
    chunk.failed_at = Some(Utc::now().to_rfc3339());

    let json = serde_json::to_vec(&chunk).expect("chunk serializes");
    let from_json: Chunk = serde_json::from_slice(&json).expect("chunk parses");
    assert_eq!(from_json, chunk);

    let fields: HashMap<String, String> = chunk.to_stream_fields().into_iter().collect();
    // Streams values are all stringified decimals.
    assert_eq!(fields["start_param"], "300");
    assert_eq!(fields["retry_count"], "2");
    let from_fields = Chunk::from_stream_fields(&fields).expect("field map parses");
    assert_eq!(from_fields, chunk);
}

/// Reprocessing a chunk reproduces the same aggregates: redelivered work
/// publishes an identical result record, so first-record-wins dedup by
/// chunk id is a correct consumer strategy.
#[test]
fn reprocessed_chunk_yields_identical_aggregates() {
    let chunk = plan_chunks(1000, 100, seed_time()).remove(5);

    let run = |worker_id: u32| {
        let results: Vec<_> = (chunk.start_param..chunk.end_param)
            .map(|p| compute_parameter(p, worker_id))
            .collect();
        ChunkOutcome::from_results(&results)
    };

    let first = run(1);
    let second = run(2);
    assert_eq!(first, second);
    assert_eq!(first.count, chunk.params_count);

    let encoded = serde_json::to_string(&first).expect("outcome serializes");
    let decoded: ChunkOutcome = serde_json::from_str(&encoded).expect("outcome parses");
    assert_eq!(decoded, first);
}
