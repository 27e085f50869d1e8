//! Streams backend: Redis Streams with a consumer group.
//!
//! One append-only stream of chunks, one of results. Delivery exclusivity
//! comes from the consumer group; crash recovery is explicit, by scanning
//! the pending entry list and transferring stale claims with XCLAIM.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use super::{ClaimedChunk, DeliveryHandle, QueueBackend, QueueError, QueueResult, RetryPolicy};
use crate::compute::ChunkOutcome;
use crate::config::RedisConfig;
use crate::models::{plan_chunks, Chunk, QueueStats, ResultRecord};

/// Stream of task chunks.
const TASK_STREAM: &str = "sweep:tasks";
/// Stream of result records.
const RESULT_STREAM: &str = "sweep:results";
/// Consumer group shared by all workers.
const CONSUMER_GROUP: &str = "sweep-workers";
/// Short-lived lock so only one peer inserts the chunk set.
const SEED_LOCK: &str = "sweep:seed-lock";
const SEED_LOCK_TTL_MS: u64 = 30_000;

/// A stream entry as the wire returns it: id plus flat field map.
type StreamEntry = (String, HashMap<String, String>);

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
        {
            QueueError::Unavailable(e.to_string())
        } else {
            QueueError::Protocol(e.to_string())
        }
    }
}

pub struct StreamsBackend {
    client: redis::Client,
    conn: ConnectionManager,
    url: String,
    retry: RetryPolicy,
}

impl StreamsBackend {
    /// Connect with bounded retries.
    pub async fn connect(config: &RedisConfig, retry: RetryPolicy) -> QueueResult<Self> {
        let url = config.url();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| QueueError::Unavailable(format!("invalid redis url {}: {}", url, e)))?;

        let conn = Self::open_manager(&client, &url, &retry).await?;
        Ok(Self {
            client,
            conn,
            url,
            retry,
        })
    }

    async fn open_manager(
        client: &redis::Client,
        url: &str,
        retry: &RetryPolicy,
    ) -> QueueResult<ConnectionManager> {
        let mut last_error = String::new();
        for attempt in 1..=retry.attempts {
            info!(
                "Connecting to Redis at {} (attempt {}/{})",
                url, attempt, retry.attempts
            );
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => {
                    info!("Connected to Redis");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("Redis connection attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                    if attempt < retry.attempts {
                        tokio::time::sleep(retry.delay).await;
                    }
                }
            }
        }
        Err(QueueError::Unavailable(format!(
            "redis unreachable after {} attempts: {}",
            retry.attempts, last_error
        )))
    }

    /// Create the stream and consumer group, tolerating both existing.
    async fn ensure_group(&mut self) -> QueueResult<()> {
        let result: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(TASK_STREAM)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;
        match result {
            Ok(_) => {
                info!(
                    "Created stream '{}' with consumer group '{}'",
                    TASK_STREAM, CONSUMER_GROUP
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group '{}' already exists", CONSUMER_GROUP);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_len(&mut self, stream: &str) -> QueueResult<u64> {
        let len: u64 = redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut self.conn)
            .await?;
        Ok(len)
    }

    async fn append(&mut self, stream: &str, fields: &[(String, String)]) -> QueueResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        let message_id: String = cmd.query_async(&mut self.conn).await?;
        Ok(message_id)
    }

    fn entry_to_claim(entry: &StreamEntry, consumer: &str) -> QueueResult<ClaimedChunk> {
        let (id, fields) = entry;
        let chunk = Chunk::from_stream_fields(fields).ok_or_else(|| {
            QueueError::Protocol(format!("malformed chunk in stream entry {}", id))
        })?;
        Ok(ClaimedChunk::new(
            chunk,
            DeliveryHandle::Stream(id.clone()),
            consumer,
        ))
    }

    fn stream_id<'a>(&self, claimed: &'a ClaimedChunk) -> QueueResult<&'a str> {
        match &claimed.handle {
            DeliveryHandle::Stream(id) => Ok(id),
            DeliveryHandle::Broker(_) => Err(QueueError::Protocol(
                "broker delivery handle passed to streams backend".to_string(),
            )),
        }
    }

    /// Pending entries as `(id, consumer, idle_ms, delivery_count)` rows.
    async fn pending_entries(
        &mut self,
        count: usize,
    ) -> QueueResult<Vec<(String, String, u64, u64)>> {
        let result: redis::RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(TASK_STREAM)
            .arg(CONSUMER_GROUP)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut self.conn)
            .await;
        match result {
            Ok(rows) => Ok(rows),
            // No group yet means nothing has been seeded; not an error.
            Err(e) if e.code() == Some("NOGROUP") => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl QueueBackend for StreamsBackend {
    async fn seed(&mut self, total_params: u64, chunk_size: u64, force: bool) -> QueueResult<u64> {
        self.ensure_group().await?;

        if force {
            warn!("Force seeding: purging existing task and result streams");
            self.purge().await?;
            self.ensure_group().await?;
        }

        let current = self.stream_len(TASK_STREAM).await?;
        if current > 0 {
            info!(
                "Task stream already holds {} entries, skipping seed",
                current
            );
            return Ok(0);
        }

        // One peer wins the insert; the lock expires on its own so a
        // seeder that dies mid-insert does not wedge the batch forever.
        let acquired: Option<String> = redis::cmd("SET")
            .arg(SEED_LOCK)
            .arg(Utc::now().to_rfc3339())
            .arg("NX")
            .arg("PX")
            .arg(SEED_LOCK_TTL_MS)
            .query_async(&mut self.conn)
            .await?;
        if acquired.is_none() {
            return Err(QueueError::Conflict(
                "another worker is seeding the task stream".to_string(),
            ));
        }

        let chunks = plan_chunks(total_params, chunk_size, Utc::now());
        info!(
            "Seeding {} chunks ({} params, {} per chunk)",
            chunks.len(),
            total_params,
            chunk_size
        );

        for chunk in &chunks {
            self.append(TASK_STREAM, &chunk.to_stream_fields()).await?;
        }

        info!("Seeded {} chunks into '{}'", chunks.len(), TASK_STREAM);
        Ok(chunks.len() as u64)
    }

    async fn task_count(&mut self) -> QueueResult<u64> {
        // Entries stay in the stream after ack, so XLEN overcounts once
        // processing starts; the bootstrap empty-check only needs 0/non-0.
        self.stream_len(TASK_STREAM).await
    }

    async fn claim(
        &mut self,
        consumer: &str,
        block_timeout: Duration,
    ) -> QueueResult<Option<ClaimedChunk>> {
        // Reply shape: [[stream, [[id, {fields}], ...]], ...]; nil when the
        // block window closes empty.
        let reply: Option<Vec<(String, Vec<StreamEntry>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_timeout.as_millis() as u64)
            .arg("STREAMS")
            .arg(TASK_STREAM)
            .arg(">")
            .query_async(&mut self.conn)
            .await?;

        let Some(streams) = reply else {
            return Ok(None);
        };

        for (_, entries) in &streams {
            if let Some(entry) = entries.first() {
                let claimed = Self::entry_to_claim(entry, consumer)?;
                debug!(
                    "Claimed chunk {} (params {}-{})",
                    claimed.chunk.chunk_id, claimed.chunk.start_param, claimed.chunk.end_param
                );
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    async fn ack(&mut self, claimed: &ClaimedChunk) -> QueueResult<bool> {
        let id = self.stream_id(claimed)?.to_string();
        let acked: u64 = redis::cmd("XACK")
            .arg(TASK_STREAM)
            .arg(CONSUMER_GROUP)
            .arg(&id)
            .query_async(&mut self.conn)
            .await?;
        if acked == 0 {
            warn!("Entry {} was not in the pending list", id);
        }
        Ok(acked > 0)
    }

    async fn nack(&mut self, claimed: &ClaimedChunk, reason: &str) -> QueueResult<bool> {
        // No retry path here: leaving the entry in the pending list is the
        // failure signal, and stale reclaim will hand it to another worker.
        warn!(
            "Abandoning chunk {} ({}); it stays pending until reclaimed",
            claimed.chunk.chunk_id, reason
        );
        Ok(true)
    }

    async fn publish_result(
        &mut self,
        chunk_id: &str,
        worker_id: &str,
        outcome: &ChunkOutcome,
        duration_seconds: f64,
    ) -> QueueResult<String> {
        let result_data = serde_json::to_string(outcome)
            .map_err(|e| QueueError::Protocol(format!("serializing result data: {}", e)))?;
        let record = ResultRecord::new(chunk_id, worker_id, result_data, duration_seconds);

        let message_id = self.append(RESULT_STREAM, &record.to_stream_fields()).await?;

        info!(
            "Published result for chunk {} ({:.2}s)",
            chunk_id, duration_seconds
        );
        Ok(message_id)
    }

    async fn reclaim_stale(
        &mut self,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> QueueResult<Vec<ClaimedChunk>> {
        let pending = self.pending_entries(max_count * 2).await?;
        let min_idle_ms = min_idle.as_millis() as u64;
        let mut reclaimed = Vec::new();

        for (entry_id, previous_consumer, idle_ms, _deliveries) in &pending {
            if *idle_ms < min_idle_ms {
                continue;
            }

            // XCLAIM re-checks idle time atomically, so a claim that the
            // original consumer just acked or another peer already took
            // comes back empty.
            let claimed_entries: Vec<StreamEntry> = redis::cmd("XCLAIM")
                .arg(TASK_STREAM)
                .arg(CONSUMER_GROUP)
                .arg(consumer)
                .arg(min_idle_ms)
                .arg(entry_id)
                .query_async(&mut self.conn)
                .await?;

            for entry in &claimed_entries {
                if entry.1.is_empty() {
                    continue;
                }
                let mut claimed = Self::entry_to_claim(entry, consumer)?;
                claimed.reclaimed = true;
                claimed.previous_consumer = Some(previous_consumer.clone());
                warn!(
                    "Reclaimed stale chunk {} from {} (idle {}ms)",
                    claimed.chunk.chunk_id, previous_consumer, idle_ms
                );
                reclaimed.push(claimed);
            }

            if reclaimed.len() >= max_count {
                break;
            }
        }

        Ok(reclaimed)
    }

    async fn stats(&mut self) -> QueueResult<QueueStats> {
        let tasks_total = self.stream_len(TASK_STREAM).await?;
        let results_count = self.stream_len(RESULT_STREAM).await?;

        let pending = self.pending_entries(1000).await?;
        let mut consumers: Vec<String> = pending.iter().map(|p| p.1.clone()).collect();
        consumers.sort();
        consumers.dedup();

        Ok(QueueStats {
            backend: "streams".to_string(),
            tasks_total,
            tasks_pending: pending.len() as u64,
            results_count,
            retry_count: None,
            dead_letter_count: None,
            consumers,
        })
    }

    async fn purge(&mut self) -> QueueResult<()> {
        redis::cmd("DEL")
            .arg(TASK_STREAM)
            .arg(RESULT_STREAM)
            .arg(SEED_LOCK)
            .query_async::<()>(&mut self.conn)
            .await?;
        warn!("Deleted task and result streams");
        Ok(())
    }

    async fn reconnect(&mut self) -> QueueResult<()> {
        warn!("Reconnecting to Redis");
        self.conn = Self::open_manager(&self.client, &self.url, &self.retry).await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        // The connection manager closes with the last clone; nothing to
        // tear down explicitly.
        debug!("Disconnected from Redis");
    }
}
