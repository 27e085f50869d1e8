//! Compute kernel: the deterministic per-parameter function and the
//! per-chunk aggregation of its outputs.
//!
//! The kernel here is a placeholder computation; real deployments swap in
//! their own algorithm behind the same signature. It must stay free of
//! shared state so any number of workers can call it concurrently.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Output of the kernel for a single parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamResult {
    pub param_id: u64,
    pub result: f64,
    /// First 16 hex chars of a SHA-256 digest over the input encoding.
    pub hash: String,
    pub worker_id: u32,
    pub timestamp: String,
}

/// Process a single parameter.
///
/// The numeric result is `(param_id * 7 + 13) % 1000` plus the decimal
/// fraction written as `0.<param_id % 100>`, which makes every value
/// reproducible from the parameter index alone.
pub fn compute_parameter(param_id: u64, worker_id: u32) -> ParamResult {
    let input = format!("param_{}_worker_{}", param_id, worker_id);
    let digest = Sha256::digest(input.as_bytes());
    let hash = hex::encode(digest)[..16].to_string();

    let base = ((param_id * 7 + 13) % 1000) as f64;
    let fraction: f64 = format!("0.{}", param_id % 100).parse().unwrap_or(0.0);

    ParamResult {
        param_id,
        result: base + fraction,
        hash,
        worker_id,
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// Aggregate metrics over one chunk's parameter results. Serialized as the
/// `result_data` payload of a result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl ChunkOutcome {
    /// Fold per-parameter results into chunk aggregates.
    /// An empty input (a chunk abandoned before its first parameter)
    /// yields all-zero aggregates.
    pub fn from_results(results: &[ParamResult]) -> Self {
        if results.is_empty() {
            return Self {
                sum: 0.0,
                count: 0,
                min: 0.0,
                max: 0.0,
                avg: 0.0,
            };
        }

        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for r in results {
            sum += r.result;
            min = min.min(r.result);
            max = max.max(r.result);
        }

        Self {
            sum,
            count: results.len() as u64,
            min,
            max,
            avg: sum / results.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_formula() {
        // param 0: (0*7 + 13) % 1000 = 13, fraction "0.0"
        assert!((compute_parameter(0, 0).result - 13.0).abs() < 1e-9);
        // param 7: (49 + 13) % 1000 = 62, fraction "0.7"
        assert!((compute_parameter(7, 0).result - 62.7).abs() < 1e-9);
        // param 142: (994 + 13) % 1000 = 7, fraction "0.42"
        assert!((compute_parameter(142, 0).result - 7.42).abs() < 1e-9);
        // param 100: fraction wraps back to "0.0"
        assert!((compute_parameter(100, 0).result - 713.0).abs() < 1e-9);
    }

    #[test]
    fn test_kernel_deterministic_per_worker() {
        let a = compute_parameter(12345, 2);
        let b = compute_parameter(12345, 2);
        assert_eq!(a.result, b.result);
        assert_eq!(a.hash, b.hash);

        // The digest folds in the worker id; the numeric result does not.
        let c = compute_parameter(12345, 3);
        assert_eq!(a.result, c.result);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_kernel_digest_shape() {
        let r = compute_parameter(1, 0);
        assert_eq!(r.hash.len(), 16);
        assert!(r.hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_outcome_aggregates() {
        let results: Vec<ParamResult> = (10..20).map(|p| compute_parameter(p, 0)).collect();
        let outcome = ChunkOutcome::from_results(&results);

        assert_eq!(outcome.count, 10);
        let expected_sum: f64 = results.iter().map(|r| r.result).sum();
        assert!((outcome.sum - expected_sum).abs() < 1e-9);
        assert!(outcome.min <= outcome.max);
        assert!((outcome.avg - expected_sum / 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_outcome_empty() {
        let outcome = ChunkOutcome::from_results(&[]);
        assert_eq!(outcome.count, 0);
        assert_eq!(outcome.sum, 0.0);
        assert_eq!(outcome.min, 0.0);
        assert_eq!(outcome.max, 0.0);
        assert_eq!(outcome.avg, 0.0);
    }
}
