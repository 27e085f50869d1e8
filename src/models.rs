//! Data model for the distributed sweep: chunks, claims, results, stats.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compute::ChunkOutcome;

/// Width of the zero-padded chunk identifier ("00000", "00001", ...).
/// Padding keeps lexicographic and numeric ordering in agreement.
const CHUNK_ID_WIDTH: usize = 5;

/// Lifecycle status of a chunk on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Waiting in the task queue (or in the retry queue on its way back).
    Pending,
    /// Retry budget exhausted; parked in the dead-letter queue.
    DeadLettered,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "dead_lettered" => Some(ChunkStatus::DeadLettered),
            _ => None,
        }
    }
}

/// A contiguous half-open interval of parameter indices; the unit of
/// distribution between workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-padded identifier, doubles as the sort key.
    pub chunk_id: String,
    /// First parameter index (inclusive).
    pub start_param: u64,
    /// Last parameter index (exclusive).
    pub end_param: u64,
    /// Number of parameters in this chunk (`end_param - start_param`).
    pub params_count: u64,
    /// Batch-wide parameter count, constant across chunks.
    pub total_params: u64,
    /// Batch-wide chunk count, constant across chunks.
    pub total_chunks: u64,
    /// ISO-8601 UTC timestamp of seeding.
    pub created_at: String,
    pub status: ChunkStatus,
    /// Failed delivery attempts so far; only advanced by the broker backend.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
}

impl Chunk {
    /// Format a numeric chunk index as its wire identifier.
    pub fn format_id(index: u64) -> String {
        format!("{:0width$}", index, width = CHUNK_ID_WIDTH)
    }

    /// Flatten into the string field map used by the streams backend.
    /// Optional fields are omitted rather than serialized empty.
    pub fn to_stream_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("chunk_id".to_string(), self.chunk_id.clone()),
            ("start_param".to_string(), self.start_param.to_string()),
            ("end_param".to_string(), self.end_param.to_string()),
            ("params_count".to_string(), self.params_count.to_string()),
            ("total_params".to_string(), self.total_params.to_string()),
            ("total_chunks".to_string(), self.total_chunks.to_string()),
            ("created_at".to_string(), self.created_at.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("retry_count".to_string(), self.retry_count.to_string()),
        ];
        if let Some(ref err) = self.last_error {
            fields.push(("last_error".to_string(), err.clone()));
        }
        if let Some(ref at) = self.failed_at {
            fields.push(("failed_at".to_string(), at.clone()));
        }
        fields
    }

    /// Rebuild a chunk from a stream entry's field map.
    /// Returns None when a required field is missing or malformed.
    pub fn from_stream_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let get_u64 = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok());

        Some(Chunk {
            chunk_id: fields.get("chunk_id")?.clone(),
            start_param: get_u64("start_param")?,
            end_param: get_u64("end_param")?,
            params_count: get_u64("params_count")?,
            total_params: get_u64("total_params")?,
            total_chunks: get_u64("total_chunks")?,
            created_at: fields.get("created_at")?.clone(),
            status: fields
                .get("status")
                .and_then(|s| ChunkStatus::from_str(s))
                .unwrap_or(ChunkStatus::Pending),
            retry_count: fields
                .get("retry_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_error: fields.get("last_error").cloned(),
            failed_at: fields.get("failed_at").cloned(),
        })
    }
}

/// Divide `[0, total_params)` into chunks of at most `chunk_size` parameters.
///
/// The returned chunks partition the batch without gap or overlap; the final
/// chunk absorbs the remainder when `chunk_size` does not divide
/// `total_params` evenly.
pub fn plan_chunks(total_params: u64, chunk_size: u64, created_at: DateTime<Utc>) -> Vec<Chunk> {
    if total_params == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let total_chunks = total_params.div_ceil(chunk_size);
    let created_at = created_at.to_rfc3339();

    (0..total_chunks)
        .map(|index| {
            let start_param = index * chunk_size;
            let end_param = (start_param + chunk_size).min(total_params);
            Chunk {
                chunk_id: Chunk::format_id(index),
                start_param,
                end_param,
                params_count: end_param - start_param,
                total_params,
                total_chunks,
                created_at: created_at.clone(),
                status: ChunkStatus::Pending,
                retry_count: 0,
                last_error: None,
                failed_at: None,
            }
        })
        .collect()
}

/// Record appended to the result container after a chunk completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub chunk_id: String,
    pub worker_id: String,
    /// Always "completed"; failed chunks never reach the result container.
    pub status: String,
    pub duration_seconds: f64,
    pub completed_at: String,
    /// JSON-encoded string of `{sum, count, min, max, avg}`.
    pub result_data: String,
}

impl ResultRecord {
    pub fn new(
        chunk_id: &str,
        worker_id: &str,
        result_data: String,
        duration_seconds: f64,
    ) -> Self {
        Self {
            chunk_id: chunk_id.to_string(),
            worker_id: worker_id.to_string(),
            status: "completed".to_string(),
            duration_seconds,
            completed_at: Utc::now().to_rfc3339(),
            result_data,
        }
    }

    /// Flatten into the string field map used by the streams backend.
    pub fn to_stream_fields(&self) -> Vec<(String, String)> {
        vec![
            ("chunk_id".to_string(), self.chunk_id.clone()),
            ("worker_id".to_string(), self.worker_id.clone()),
            ("status".to_string(), self.status.clone()),
            (
                "duration_seconds".to_string(),
                self.duration_seconds.to_string(),
            ),
            ("completed_at".to_string(), self.completed_at.clone()),
            ("result_data".to_string(), self.result_data.clone()),
        ]
    }
}

/// Point-in-time view of the shared containers, for operator inspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub backend: String,
    pub tasks_total: u64,
    /// Delivered-but-unacked chunks (best effort).
    pub tasks_pending: u64,
    pub results_count: u64,
    /// Chunks waiting out their retry delay; broker backend only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u64>,
    /// Terminally failed chunks; broker backend only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_count: Option<u64>,
    pub consumers: Vec<String>,
}

/// Terminal status of a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Interrupted | RunStatus::Failed => 1,
        }
    }
}

/// Final one-line JSON summary printed to stdout before exit: the
/// configuration snapshot merged with runtime counters.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub worker_id: u32,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub total_parameters: u64,
    pub chunk_size: u64,
    pub idle_timeout_seconds: u64,
    pub simulate_work_ms: u64,
    pub simulate_fault_rate: f64,
    pub chunks_processed: u64,
    pub params_processed: u64,
    /// Aggregates over the results computed in this process. Static mode
    /// only; in queue mode per-chunk results go to the result container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregates: Option<ChunkOutcome>,
    pub duration_seconds: f64,
    pub params_per_second: f64,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_chunk_id_zero_padded() {
        assert_eq!(Chunk::format_id(0), "00000");
        assert_eq!(Chunk::format_id(42), "00042");
        assert_eq!(Chunk::format_id(99999), "99999");
    }

    #[test]
    fn test_plan_chunks_exact_division() {
        let chunks = plan_chunks(1000, 100, seed_time());
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.params_count == 100));
        assert!(chunks.iter().all(|c| c.total_chunks == 10));
    }

    #[test]
    fn test_plan_chunks_remainder() {
        let chunks = plan_chunks(1050, 100, seed_time());
        assert_eq!(chunks.len(), 11);
        assert_eq!(chunks.last().unwrap().params_count, 50);
        assert_eq!(chunks.last().unwrap().start_param, 1000);
        assert_eq!(chunks.last().unwrap().end_param, 1050);
    }

    #[test]
    fn test_plan_chunks_partitions_without_gap_or_overlap() {
        for (total, size) in [(1u64, 1u64), (1, 100), (99, 10), (100, 10), (101, 10), (10000, 73)]
        {
            let chunks = plan_chunks(total, size, seed_time());
            assert_eq!(chunks.len() as u64, total.div_ceil(size));

            let mut covered = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.start_param, covered, "gap before chunk {}", i);
                assert!(chunk.end_param > chunk.start_param);
                assert_eq!(chunk.params_count, chunk.end_param - chunk.start_param);
                covered = chunk.end_param;
            }
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn test_plan_chunks_degenerate() {
        assert!(plan_chunks(0, 100, seed_time()).is_empty());
        assert!(plan_chunks(100, 0, seed_time()).is_empty());
        // Chunk larger than the batch collapses to a single chunk.
        let chunks = plan_chunks(5, 100, seed_time());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].params_count, 5);
    }

    #[test]
    fn test_stream_fields_round_trip() {
        let chunks = plan_chunks(250, 100, seed_time());
        for chunk in &chunks {
            let fields: HashMap<String, String> = chunk.to_stream_fields().into_iter().collect();
            let parsed = Chunk::from_stream_fields(&fields).expect("round trip");
            assert_eq!(&parsed, chunk);
        }
    }

    #[test]
    fn test_stream_fields_round_trip_with_failure_metadata() {
        let mut chunk = plan_chunks(100, 100, seed_time()).remove(0);
        chunk.retry_count = 2;
        chunk.last_error = Some("simulated processing fault".to_string());
        chunk.failed_at = Some("2026-07-01T00:05:00+00:00".to_string());
        chunk.status = ChunkStatus::DeadLettered;

        let fields: HashMap<String, String> = chunk.to_stream_fields().into_iter().collect();
        let parsed = Chunk::from_stream_fields(&fields).expect("round trip");
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_from_stream_fields_rejects_malformed() {
        let mut fields: HashMap<String, String> = plan_chunks(100, 100, seed_time())[0]
            .to_stream_fields()
            .into_iter()
            .collect();
        fields.insert("start_param".to_string(), "not-a-number".to_string());
        assert!(Chunk::from_stream_fields(&fields).is_none());

        fields.remove("start_param");
        assert!(Chunk::from_stream_fields(&fields).is_none());
    }

    #[test]
    fn test_chunk_json_round_trip() {
        let mut chunk = plan_chunks(300, 100, seed_time()).remove(2);
        chunk.retry_count = 1;
        chunk.last_error = Some("boom".to_string());

        let json = serde_json::to_string(&chunk).unwrap();
        let parsed: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_chunk_json_optional_fields_default() {
        // Messages seeded before a failure carry no error metadata.
        let json = r#"{
            "chunk_id": "00003",
            "start_param": 300,
            "end_param": 400,
            "params_count": 100,
            "total_params": 1000,
            "total_chunks": 10,
            "created_at": "2026-07-01T00:00:00+00:00",
            "status": "pending"
        }"#;
        let chunk: Chunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.retry_count, 0);
        assert!(chunk.last_error.is_none());
        assert!(chunk.failed_at.is_none());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [ChunkStatus::Pending, ChunkStatus::DeadLettered] {
            assert_eq!(ChunkStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ChunkStatus::from_str("unknown"), None);
    }

    #[test]
    fn test_run_status_exit_codes() {
        assert_eq!(RunStatus::Completed.exit_code(), 0);
        assert_eq!(RunStatus::Interrupted.exit_code(), 1);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
    }
}
