//! Queue backend abstraction.
//!
//! Two delivery models live behind this trait: Redis Streams with consumer
//! groups and explicit stale-claim recovery, and a durable AMQP topology
//! with a TTL retry queue and a dead-letter queue. Workers see one
//! contract; each backend keeps its own recovery semantics.

mod broker;
mod streams;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use broker::BrokerBackend;
pub use streams::StreamsBackend;

use crate::compute::ChunkOutcome;
use crate::config::WorkerConfig;
use crate::models::{Chunk, QueueStats};

/// Which queue backend a worker talks to. Dispatch happens once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Redis Streams with a consumer group.
    Streams,
    /// AMQP broker with retry and dead-letter queues.
    Broker,
}

impl BackendKind {
    /// Parse a backend name. Accepts the transport names used by older
    /// deployments as aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "streams" | "redis" => Some(BackendKind::Streams),
            "broker" | "rabbitmq" | "amqp" => Some(BackendKind::Broker),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Streams => "streams",
            BackendKind::Broker => "broker",
        }
    }
}

/// Errors surfaced by every backend implementation.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Session cannot be established or was lost. Retried transparently;
    /// fatal once the retry budget is exhausted.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend answered with a shape we cannot parse; version skew.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A container that must exist after seeding is missing.
    #[error("not found: {0}")]
    NotFound(String),
    /// A concurrent seed attempt won; benign to the loser.
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Bounded retry schedule for session establishment.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(1500),
        }
    }
}

/// Backend-specific delivery handle; opaque outside the backend that
/// issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryHandle {
    /// Stream entry id.
    Stream(String),
    /// AMQP delivery tag.
    Broker(u64),
}

/// A chunk held in-flight by one consumer, alive until ack or release.
#[derive(Debug, Clone)]
pub struct ClaimedChunk {
    pub chunk: Chunk,
    pub handle: DeliveryHandle,
    pub consumer: String,
    pub claimed_at: DateTime<Utc>,
    /// True when this claim was transferred from a stale peer.
    pub reclaimed: bool,
    pub previous_consumer: Option<String>,
}

impl ClaimedChunk {
    pub fn new(chunk: Chunk, handle: DeliveryHandle, consumer: &str) -> Self {
        Self {
            chunk,
            handle,
            consumer: consumer.to_string(),
            claimed_at: Utc::now(),
            reclaimed: false,
            previous_consumer: None,
        }
    }
}

/// The capability set shared by both backends.
///
/// Correctness contract, regardless of backend: no seeded chunk is lost,
/// and per chunk id at most one *successful completion* publishes a result
/// (redelivery after a crash between publish and ack may duplicate a
/// record; consumers dedupe by chunk id).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert the chunk set for a batch. Returns 0 without modifying
    /// state when chunks already exist and `force` is false; purges
    /// every container first when `force` is true.
    async fn seed(&mut self, total_params: u64, chunk_size: u64, force: bool) -> QueueResult<u64>;

    /// Best-effort count of visible chunks in the task container.
    async fn task_count(&mut self) -> QueueResult<u64>;

    /// Take the next available chunk for `consumer`, blocking up to
    /// `block_timeout`. `None` when nothing became available.
    async fn claim(
        &mut self,
        consumer: &str,
        block_timeout: Duration,
    ) -> QueueResult<Option<ClaimedChunk>>;

    /// Confirm completion; the chunk must not be redelivered afterwards.
    async fn ack(&mut self, claimed: &ClaimedChunk) -> QueueResult<bool>;

    /// Report failure. Backends without native retry treat this as
    /// abandoning the claim; the broker backend re-enqueues through the
    /// retry path or dead-letters, then acks the original delivery.
    async fn nack(&mut self, claimed: &ClaimedChunk, reason: &str) -> QueueResult<bool>;

    /// Append a result record; returns the backend message id.
    async fn publish_result(
        &mut self,
        chunk_id: &str,
        worker_id: &str,
        outcome: &ChunkOutcome,
        duration_seconds: f64,
    ) -> QueueResult<String>;

    /// Transfer ownership of up to `max_count` claims idle longer than
    /// `min_idle` to `consumer`. Backends whose broker redelivers unacked
    /// messages on disconnect return an empty list.
    async fn reclaim_stale(
        &mut self,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> QueueResult<Vec<ClaimedChunk>>;

    /// Snapshot of the shared containers.
    async fn stats(&mut self) -> QueueResult<QueueStats>;

    /// Delete all batch state: tasks, retries, dead letters, results.
    async fn purge(&mut self) -> QueueResult<()>;

    /// Tear down and re-establish the session, using the same retry
    /// policy as the initial connect.
    async fn reconnect(&mut self) -> QueueResult<()>;

    /// Close the session. Idempotent; safe after any error.
    async fn disconnect(&mut self);
}

/// Connect the backend selected by the configuration. The single dynamic
/// dispatch point; everything downstream works against the trait.
pub async fn connect_backend(config: &WorkerConfig) -> QueueResult<Box<dyn QueueBackend>> {
    match config.backend {
        BackendKind::Streams => {
            let backend = StreamsBackend::connect(&config.redis, RetryPolicy::default()).await?;
            Ok(Box::new(backend))
        }
        BackendKind::Broker => {
            let backend = BrokerBackend::connect(
                &config.amqp,
                config.max_retries,
                config.retry_delay,
                RetryPolicy::new(3, Duration::from_secs(2)),
            )
            .await?;
            Ok(Box::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("streams"), Some(BackendKind::Streams));
        assert_eq!(BackendKind::parse("REDIS"), Some(BackendKind::Streams));
        assert_eq!(BackendKind::parse("broker"), Some(BackendKind::Broker));
        assert_eq!(BackendKind::parse("RabbitMQ"), Some(BackendKind::Broker));
        assert_eq!(BackendKind::parse("amqp"), Some(BackendKind::Broker));
        assert_eq!(BackendKind::parse("sqs"), None);
    }

    #[test]
    fn test_backend_kind_round_trip() {
        for kind in [BackendKind::Streams, BackendKind::Broker] {
            assert_eq!(BackendKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_retry_policy_default_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert!(policy.delay >= Duration::from_secs(1));
        assert!(policy.delay <= Duration::from_secs(2));
    }
}
