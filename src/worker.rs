//! Worker runtime: bootstrap, the consume loop, stale-claim recovery,
//! idle exit and graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::compute::{compute_parameter, ChunkOutcome, ParamResult};
use crate::config::WorkerConfig;
use crate::models::{RunStatus, RunSummary};
use crate::queue::{connect_backend, ClaimedChunk, QueueBackend, QueueError, QueueResult};

/// How long a non-seeder waits for the seeder before attempting the
/// idempotent seed itself.
const SEED_WAIT: Duration = Duration::from_secs(2);
/// Upper bound on claims transferred per reclaim pass.
const RECLAIM_BATCH: usize = 5;

/// Cooperative shutdown flag, shared between the signal listener and the
/// worker loop. Passed explicitly so tests can drive it.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raise the flag on SIGINT or SIGTERM. The current parameter finishes;
/// the loop notices the flag at its next check.
pub fn spawn_signal_listener(flag: ShutdownFlag) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        if ctrl_c.await.is_ok() {
                            warn!("Received SIGINT, shutting down after current parameter");
                            flag.raise();
                        }
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => warn!("Received SIGINT, shutting down after current parameter"),
                _ = term.recv() => warn!("Received SIGTERM, shutting down after current parameter"),
            }
            flag.raise();
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_ok() {
                warn!("Received SIGINT, shutting down after current parameter");
                flag.raise();
            }
        }
    });
}

/// Outcome of processing one claimed chunk.
enum ChunkRun {
    Completed { outcome: ChunkOutcome, duration: f64 },
    Faulted(String),
    Interrupted,
}

/// A queue-mode worker process: one backend session, one consume loop.
pub struct QueueWorker {
    config: WorkerConfig,
    backend: Box<dyn QueueBackend>,
    shutdown: ShutdownFlag,
    consumer: String,
    rng: StdRng,
    chunks_processed: u64,
    params_processed: u64,
}

impl QueueWorker {
    pub async fn connect(config: WorkerConfig, shutdown: ShutdownFlag) -> QueueResult<Self> {
        let backend = connect_backend(&config).await?;
        let consumer = config.consumer_name();
        let rng = match config.fault_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            backend,
            shutdown,
            consumer,
            rng,
            chunks_processed: 0,
            params_processed: 0,
        })
    }

    /// Run to completion. Always returns a summary; fatal errors are
    /// folded into it as `status = failed`.
    pub async fn run(mut self) -> RunSummary {
        let started = Instant::now();

        let status = match self.run_inner().await {
            Ok(status) => status,
            Err(e) => {
                error!("Worker {} failed: {}", self.config.worker_id, e);
                self.backend.disconnect().await;
                return self.summary(started, RunStatus::Failed, Some(e.to_string()));
            }
        };

        self.backend.disconnect().await;
        self.summary(started, status, None)
    }

    async fn run_inner(&mut self) -> QueueResult<RunStatus> {
        self.bootstrap().await?;

        let idle_budget = self.config.idle_budget();
        let mut empty_reads: u32 = 0;
        let mut last_stale_check = Instant::now();

        info!(
            "Worker {} entering consume loop (idle budget {} empty reads)",
            self.config.worker_id, idle_budget
        );

        loop {
            if self.shutdown.is_raised() {
                return Ok(RunStatus::Interrupted);
            }

            // Periodically sweep for chunks stranded by crashed peers.
            if last_stale_check.elapsed() >= self.config.stale_check_interval {
                last_stale_check = Instant::now();
                let recovered = self.reclaim_and_process().await?;
                if recovered {
                    empty_reads = 0;
                    continue;
                }
                if self.shutdown.is_raised() {
                    return Ok(RunStatus::Interrupted);
                }
            }

            match self.claim_chunk().await? {
                Some(claimed) => {
                    empty_reads = 0;
                    if !self.handle_chunk(claimed).await? {
                        return Ok(RunStatus::Interrupted);
                    }
                }
                None => {
                    empty_reads += 1;
                    debug!(
                        "No chunk available ({}/{} empty reads)",
                        empty_reads, idle_budget
                    );
                    if empty_reads >= idle_budget {
                        // Last look for recoverable work before giving up.
                        if self.reclaim_and_process().await? {
                            empty_reads = 0;
                            continue;
                        }
                        info!(
                            "Worker {} idle for {}s with no pending work, exiting",
                            self.config.worker_id,
                            self.config.idle_timeout.as_secs()
                        );
                        return Ok(RunStatus::Completed);
                    }
                }
            }
        }
    }

    /// Seed race: worker 0 goes first; everyone else gives the seeder a
    /// head start, then falls through to the same idempotent attempt so a
    /// missing seeder cannot wedge the batch.
    async fn bootstrap(&mut self) -> QueueResult<()> {
        if self.config.worker_id != 0 && self.backend.task_count().await? == 0 {
            debug!(
                "Worker {} waiting {:?} for the seeder",
                self.config.worker_id, SEED_WAIT
            );
            tokio::time::sleep(SEED_WAIT).await;
        }

        if self.backend.task_count().await? == 0 {
            let total = self.config.total_parameters;
            let chunk_size = self.config.chunk_size;
            match self.backend.seed(total, chunk_size, false).await {
                Ok(0) => debug!("Task container already seeded"),
                Ok(created) => info!("Worker {} seeded {} chunks", self.config.worker_id, created),
                Err(QueueError::Conflict(reason)) => {
                    debug!("Seed race lost ({}), proceeding to claim", reason)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Claim with one transparent reconnect on a lost session. The
    /// reconnect retries on the connect policy; a second loss is fatal.
    async fn claim_chunk(&mut self) -> QueueResult<Option<ClaimedChunk>> {
        let consumer = self.consumer.clone();
        let timeout = self.config.block_timeout;
        match self.backend.claim(&consumer, timeout).await {
            Err(QueueError::Unavailable(reason)) => {
                warn!("Backend unavailable ({}), attempting reconnect", reason);
                self.backend.reconnect().await?;
                self.backend.claim(&consumer, timeout).await
            }
            other => other,
        }
    }

    /// Reclaim stale claims and process them inline. Returns whether any
    /// work was done.
    async fn reclaim_and_process(&mut self) -> QueueResult<bool> {
        let consumer = self.consumer.clone();
        let threshold = self.config.stale_threshold;
        let reclaimed = match self
            .backend
            .reclaim_stale(&consumer, threshold, RECLAIM_BATCH)
            .await
        {
            Err(QueueError::Unavailable(reason)) => {
                warn!("Backend unavailable ({}), attempting reconnect", reason);
                self.backend.reconnect().await?;
                self.backend
                    .reclaim_stale(&consumer, threshold, RECLAIM_BATCH)
                    .await?
            }
            other => other?,
        };

        if reclaimed.is_empty() {
            return Ok(false);
        }

        info!(
            "Recovered {} stale chunk(s) from crashed peers",
            reclaimed.len()
        );
        for claimed in reclaimed {
            if !self.handle_chunk(claimed).await? {
                // Shutdown raised mid-chunk; the remaining reclaimed
                // chunks stay pending for the next sweep.
                return Ok(true);
            }
        }
        Ok(true)
    }

    /// Process one claimed chunk through publish-then-ack. Returns false
    /// when shutdown interrupted the chunk (which is left unacked).
    async fn handle_chunk(&mut self, claimed: ClaimedChunk) -> QueueResult<bool> {
        match self.process_chunk(&claimed).await {
            ChunkRun::Completed { outcome, duration } => {
                // Publish before ack. A crash between the two redelivers
                // the chunk; consumers dedupe result records by chunk id.
                let chunk_id = claimed.chunk.chunk_id.clone();
                let worker_id = self.consumer.clone();
                match self
                    .backend
                    .publish_result(&chunk_id, &worker_id, &outcome, duration)
                    .await
                {
                    Err(QueueError::Unavailable(reason)) => {
                        warn!("Backend unavailable ({}), attempting reconnect", reason);
                        self.backend.reconnect().await?;
                        self.backend
                            .publish_result(&chunk_id, &worker_id, &outcome, duration)
                            .await?;
                    }
                    other => {
                        other?;
                    }
                }
                self.backend.ack(&claimed).await?;
                self.chunks_processed += 1;
                self.params_processed += claimed.chunk.params_count;
                Ok(true)
            }
            ChunkRun::Faulted(reason) => {
                warn!("Chunk {} failed: {}", claimed.chunk.chunk_id, reason);
                self.backend.nack(&claimed, &reason).await?;
                Ok(true)
            }
            ChunkRun::Interrupted => {
                info!(
                    "Shutdown during chunk {}; abandoning claim without ack",
                    claimed.chunk.chunk_id
                );
                Ok(false)
            }
        }
    }

    /// Iterate the kernel over the chunk's range. All-or-nothing: a
    /// shutdown mid-range discards partial work.
    async fn process_chunk(&mut self, claimed: &ClaimedChunk) -> ChunkRun {
        let chunk = &claimed.chunk;
        let started = Instant::now();

        // Synthetic fault, injected before any work or I/O so the retry
        // and dead-letter paths can be exercised deterministically.
        if self.config.simulate_fault_rate > 0.0
            && self.rng.gen::<f64>() < self.config.simulate_fault_rate
        {
            return ChunkRun::Faulted(format!(
                "simulated processing fault on chunk {}",
                chunk.chunk_id
            ));
        }

        debug!(
            "Processing chunk {} (params {}-{}{})",
            chunk.chunk_id,
            chunk.start_param,
            chunk.end_param,
            if claimed.reclaimed { ", reclaimed" } else { "" }
        );

        let mut results: Vec<ParamResult> = Vec::with_capacity(chunk.params_count as usize);
        for param_id in chunk.start_param..chunk.end_param {
            if self.shutdown.is_raised() {
                return ChunkRun::Interrupted;
            }
            results.push(compute_parameter(param_id, self.config.worker_id));
            if self.config.simulate_work_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.simulate_work_ms)).await;
            }
        }

        ChunkRun::Completed {
            outcome: ChunkOutcome::from_results(&results),
            duration: started.elapsed().as_secs_f64(),
        }
    }

    fn summary(&self, started: Instant, status: RunStatus, error: Option<String>) -> RunSummary {
        let duration = started.elapsed().as_secs_f64();
        RunSummary {
            worker_id: self.config.worker_id,
            backend: self.config.backend.as_str().to_string(),
            hostname: get_hostname(),
            total_parameters: self.config.total_parameters,
            chunk_size: self.config.chunk_size,
            idle_timeout_seconds: self.config.idle_timeout.as_secs(),
            simulate_work_ms: self.config.simulate_work_ms,
            simulate_fault_rate: self.config.simulate_fault_rate,
            chunks_processed: self.chunks_processed,
            params_processed: self.params_processed,
            aggregates: None,
            duration_seconds: duration,
            params_per_second: if duration > 0.0 {
                self.params_processed as f64 / duration
            } else {
                0.0
            },
            status,
            error,
        }
    }
}

/// Parameter range for one worker in static mode: an even split of the
/// batch, with the last worker absorbing the remainder.
pub fn static_range(worker_id: u32, total_workers: u32, total_parameters: u64) -> (u64, u64) {
    let per_worker = total_parameters / total_workers as u64;
    let start = worker_id as u64 * per_worker;
    let mut end = start + per_worker;
    if worker_id == total_workers - 1 {
        end += total_parameters % total_workers as u64;
    }
    (start, end)
}

/// Queue-less mode: process a fixed sub-range of the batch and print the
/// same summary shape. No backend session is opened.
pub async fn run_static(config: WorkerConfig, shutdown: ShutdownFlag) -> RunSummary {
    let started = Instant::now();
    let (start, end) = static_range(
        config.worker_id,
        config.total_workers,
        config.total_parameters,
    );

    info!(
        "Worker {} processing static range {}-{} ({} params)",
        config.worker_id,
        start,
        end,
        end - start
    );

    let mut results: Vec<ParamResult> = Vec::with_capacity((end - start) as usize);
    let mut chunks_processed: u64 = 0;
    let mut interrupted = false;

    let mut current = start;
    'outer: while current < end {
        let batch_end = (current + config.chunk_size).min(end);
        for param_id in current..batch_end {
            if shutdown.is_raised() {
                interrupted = true;
                break 'outer;
            }
            results.push(compute_parameter(param_id, config.worker_id));
            if config.simulate_work_ms > 0 {
                tokio::time::sleep(Duration::from_millis(config.simulate_work_ms)).await;
            }
        }
        chunks_processed += 1;
        debug!(
            "Completed batch {}-{} ({}/{} params)",
            current,
            batch_end,
            results.len(),
            end - start
        );
        current = batch_end;
    }

    let params_processed = results.len() as u64;
    let aggregates = ChunkOutcome::from_results(&results);
    info!(
        "Batch aggregates: sum {:.4}, avg {:.4}, min {:.4}, max {:.4} over {} params",
        aggregates.sum, aggregates.avg, aggregates.min, aggregates.max, aggregates.count
    );

    let duration = started.elapsed().as_secs_f64();
    RunSummary {
        worker_id: config.worker_id,
        backend: "static".to_string(),
        hostname: get_hostname(),
        total_parameters: config.total_parameters,
        chunk_size: config.chunk_size,
        idle_timeout_seconds: config.idle_timeout.as_secs(),
        simulate_work_ms: config.simulate_work_ms,
        simulate_fault_rate: config.simulate_fault_rate,
        chunks_processed,
        params_processed,
        aggregates: Some(aggregates),
        duration_seconds: duration,
        params_per_second: if duration > 0.0 {
            params_processed as f64 / duration
        } else {
            0.0
        },
        status: if interrupted {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        },
        error: None,
    }
}

/// Summary for a worker that never got to work, e.g. when the backend
/// session could not be established. Counters are zero; the status-mapped
/// exit code still applies.
pub fn failed_summary(config: &WorkerConfig, error: String) -> RunSummary {
    RunSummary {
        worker_id: config.worker_id,
        backend: config.backend.as_str().to_string(),
        hostname: get_hostname(),
        total_parameters: config.total_parameters,
        chunk_size: config.chunk_size,
        idle_timeout_seconds: config.idle_timeout.as_secs(),
        simulate_work_ms: config.simulate_work_ms,
        simulate_fault_rate: config.simulate_fault_rate,
        chunks_processed: 0,
        params_processed: 0,
        aggregates: None,
        duration_seconds: 0.0,
        params_per_second: 0.0,
        status: RunStatus::Failed,
        error: Some(error),
    }
}

/// Current hostname, when the platform will tell us.
fn get_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_range_even_split() {
        assert_eq!(static_range(0, 3, 9000), (0, 3000));
        assert_eq!(static_range(1, 3, 9000), (3000, 6000));
        assert_eq!(static_range(2, 3, 9000), (6000, 9000));
    }

    #[test]
    fn test_static_range_remainder_goes_last() {
        assert_eq!(static_range(0, 3, 10_000), (0, 3333));
        assert_eq!(static_range(1, 3, 10_000), (3333, 6666));
        assert_eq!(static_range(2, 3, 10_000), (6666, 10_000));
    }

    #[test]
    fn test_static_range_covers_batch() {
        for (workers, total) in [(1u32, 100u64), (3, 10), (4, 10_001), (7, 99)] {
            let mut covered = 0u64;
            for id in 0..workers {
                let (start, end) = static_range(id, workers, total);
                assert_eq!(start, covered);
                covered = end;
            }
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn test_shutdown_flag() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_raised());
        let peer = flag.clone();
        peer.raise();
        assert!(flag.is_raised());
    }

    #[tokio::test]
    async fn test_run_static_completes_and_counts() {
        let config = WorkerConfig {
            worker_id: 1,
            total_workers: 3,
            total_parameters: 90,
            chunk_size: 10,
            simulate_work_ms: 0,
            ..WorkerConfig::default()
        };
        let summary = run_static(config, ShutdownFlag::new()).await;
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.params_processed, 30);
        assert_eq!(summary.chunks_processed, 3);
        assert_eq!(summary.backend, "static");

        // Worker 1 of 3 covers params 30..60; the summary aggregates must
        // match a direct fold of the kernel over that range.
        let expected = ChunkOutcome::from_results(
            &(30..60).map(|p| compute_parameter(p, 1)).collect::<Vec<_>>(),
        );
        assert_eq!(summary.aggregates, Some(expected));
    }

    #[tokio::test]
    async fn test_run_static_interrupts_cleanly() {
        let config = WorkerConfig {
            worker_id: 0,
            total_workers: 1,
            total_parameters: 1000,
            chunk_size: 100,
            simulate_work_ms: 0,
            ..WorkerConfig::default()
        };
        let flag = ShutdownFlag::new();
        flag.raise();
        let summary = run_static(config, flag).await;
        assert_eq!(summary.status, RunStatus::Interrupted);
        assert_eq!(summary.params_processed, 0);
        // Nothing was computed, so the aggregates fold is all zeros.
        assert_eq!(summary.aggregates.as_ref().map(|a| a.count), Some(0));
    }

    #[test]
    fn test_summary_serializes_required_fields() {
        let summary = RunSummary {
            worker_id: 0,
            backend: "streams".to_string(),
            hostname: None,
            total_parameters: 1000,
            chunk_size: 100,
            idle_timeout_seconds: 30,
            simulate_work_ms: 1,
            simulate_fault_rate: 0.0,
            chunks_processed: 10,
            params_processed: 1000,
            aggregates: None,
            duration_seconds: 2.5,
            params_per_second: 400.0,
            status: RunStatus::Completed,
            error: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        for key in [
            "worker_id",
            "backend",
            "total_parameters",
            "chunk_size",
            "chunks_processed",
            "params_processed",
            "duration_seconds",
            "params_per_second",
            "status",
        ] {
            assert!(json.get(key).is_some(), "missing summary field {}", key);
        }
        assert_eq!(json["status"], "completed");
        // Absent optional fields are omitted, not null.
        assert!(json.get("error").is_none());
        assert!(json.get("aggregates").is_none());
    }
}
