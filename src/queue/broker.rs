//! Broker backend: durable AMQP topology over lapin.
//!
//! Four exchange/queue pairs, all durable: the main task queue, a retry
//! queue whose per-message TTL dead-letters expired messages back into the
//! task exchange, a terminal dead-letter queue, and the result log. The
//! broker requeues unacked deliveries when a consumer drops, so stale-claim
//! reclaim is a no-op here; failed chunks instead travel the retry path
//! until their budget runs out.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, error, info, warn};

use super::{ClaimedChunk, DeliveryHandle, QueueBackend, QueueError, QueueResult, RetryPolicy};
use crate::compute::ChunkOutcome;
use crate::config::AmqpConfig;
use crate::models::{plan_chunks, Chunk, ChunkStatus, QueueStats, ResultRecord};

const TASK_EXCHANGE: &str = "sweep.tasks.exchange";
const TASK_QUEUE: &str = "sweep.tasks";
const TASK_ROUTING_KEY: &str = "sweep.tasks";
const RETRY_EXCHANGE: &str = "sweep.retry.exchange";
const RETRY_QUEUE: &str = "sweep.tasks.retry";
const RETRY_ROUTING_KEY: &str = "sweep.tasks.retry";
const DLQ_EXCHANGE: &str = "sweep.dlq.exchange";
const DLQ_QUEUE: &str = "sweep.tasks.dlq";
const DLQ_ROUTING_KEY: &str = "sweep.tasks.dlq";
const RESULT_EXCHANGE: &str = "sweep.results.exchange";
const RESULT_QUEUE: &str = "sweep.results";
const RESULT_ROUTING_KEY: &str = "sweep.results";

/// Poll interval while waiting out a claim's block timeout.
const GET_POLL_INTERVAL: Duration = Duration::from_millis(200);

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_) => QueueError::Unavailable(e.to_string()),
            other => QueueError::Protocol(other.to_string()),
        }
    }
}

/// Where a failed chunk goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRoute {
    /// Back through the TTL retry queue.
    Retry,
    /// Budget exhausted; park in the dead-letter queue.
    DeadLetter,
}

/// Stamp failure metadata onto a chunk and decide its route. The retry
/// budget grants `max_retries` attempts beyond the first delivery.
pub fn prepare_failed(chunk: &Chunk, reason: &str, max_retries: u32) -> (Chunk, RetryRoute) {
    let mut updated = chunk.clone();
    let route = if chunk.retry_count < max_retries {
        RetryRoute::Retry
    } else {
        RetryRoute::DeadLetter
    };
    updated.retry_count = chunk.retry_count + 1;
    updated.last_error = Some(reason.to_string());
    updated.failed_at = Some(Utc::now().to_rfc3339());
    if route == RetryRoute::DeadLetter {
        updated.status = ChunkStatus::DeadLettered;
    }
    (updated, route)
}

pub struct BrokerBackend {
    conn: Connection,
    channel: Channel,
    url: String,
    max_retries: u32,
    retry_delay: Duration,
    retry: RetryPolicy,
}

impl BrokerBackend {
    /// Connect with bounded retries and declare the full topology.
    pub async fn connect(
        config: &AmqpConfig,
        max_retries: u32,
        retry_delay: Duration,
        retry: RetryPolicy,
    ) -> QueueResult<Self> {
        let url = config.url();
        let (conn, channel) = Self::open(&url, retry_delay, &retry).await?;
        Ok(Self {
            conn,
            channel,
            url,
            max_retries,
            retry_delay,
            retry,
        })
    }

    async fn open(
        url: &str,
        retry_delay: Duration,
        retry: &RetryPolicy,
    ) -> QueueResult<(Connection, Channel)> {
        let mut last_error = String::new();
        for attempt in 1..=retry.attempts {
            info!(
                "Connecting to AMQP broker (attempt {}/{})",
                attempt, retry.attempts
            );
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(conn) => {
                    let channel = conn.create_channel().await?;
                    channel.basic_qos(1, BasicQosOptions::default()).await?;
                    Self::declare_topology(&channel, retry_delay).await?;
                    info!("Connected to AMQP broker");
                    return Ok((conn, channel));
                }
                Err(e) => {
                    warn!("AMQP connection attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                    if attempt < retry.attempts {
                        tokio::time::sleep(retry.delay).await;
                    }
                }
            }
        }
        Err(QueueError::Unavailable(format!(
            "broker unreachable after {} attempts: {}",
            retry.attempts, last_error
        )))
    }

    async fn declare_topology(channel: &Channel, retry_delay: Duration) -> QueueResult<()> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        // Task path.
        channel
            .exchange_declare(
                TASK_EXCHANGE,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(TASK_QUEUE, durable_queue, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                TASK_QUEUE,
                TASK_EXCHANGE,
                TASK_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Retry path: expiry dead-letters the message back into the task
        // exchange, which re-queues it at the tail of the main queue.
        channel
            .exchange_declare(
                RETRY_EXCHANGE,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await?;
        let mut retry_args = FieldTable::default();
        retry_args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(retry_delay.as_millis() as i32),
        );
        retry_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(TASK_EXCHANGE.to_string().into()),
        );
        retry_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(TASK_ROUTING_KEY.to_string().into()),
        );
        channel
            .queue_declare(RETRY_QUEUE, durable_queue, retry_args)
            .await?;
        channel
            .queue_bind(
                RETRY_QUEUE,
                RETRY_EXCHANGE,
                RETRY_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Dead-letter path, terminal.
        channel
            .exchange_declare(
                DLQ_EXCHANGE,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(DLQ_QUEUE, durable_queue, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                DLQ_QUEUE,
                DLQ_EXCHANGE,
                DLQ_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Result log.
        channel
            .exchange_declare(
                RESULT_EXCHANGE,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(RESULT_QUEUE, durable_queue, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                RESULT_QUEUE,
                RESULT_EXCHANGE,
                RESULT_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    fn json_properties(message_id: &str) -> BasicProperties {
        BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_message_id(message_id.to_string().into())
    }

    async fn publish_json(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> QueueResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        confirm.await?;
        Ok(())
    }

    async fn queue_message_count(&self, queue: &str) -> QueueResult<(u32, u32)> {
        // Declaration is idempotent for a queue that already exists with
        // the same arguments, and the reply carries the counters we need.
        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        let args = if queue == RETRY_QUEUE {
            let mut retry_args = FieldTable::default();
            retry_args.insert(
                "x-message-ttl".into(),
                AMQPValue::LongInt(self.retry_delay.as_millis() as i32),
            );
            retry_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(TASK_EXCHANGE.to_string().into()),
            );
            retry_args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(TASK_ROUTING_KEY.to_string().into()),
            );
            retry_args
        } else {
            FieldTable::default()
        };
        let reply = self.channel.queue_declare(queue, durable_queue, args).await?;
        Ok((reply.message_count(), reply.consumer_count()))
    }

    fn delivery_tag(&self, claimed: &ClaimedChunk) -> QueueResult<u64> {
        match claimed.handle {
            DeliveryHandle::Broker(tag) => Ok(tag),
            DeliveryHandle::Stream(_) => Err(QueueError::Protocol(
                "stream delivery handle passed to broker backend".to_string(),
            )),
        }
    }
}

#[async_trait]
impl QueueBackend for BrokerBackend {
    async fn seed(&mut self, total_params: u64, chunk_size: u64, force: bool) -> QueueResult<u64> {
        if force {
            warn!("Force seeding: purging task, retry, dead-letter and result queues");
            self.purge().await?;
        }

        let (current, _) = self.queue_message_count(TASK_QUEUE).await?;
        if current > 0 {
            info!("Task queue already holds {} messages, skipping seed", current);
            return Ok(0);
        }

        let chunks = plan_chunks(total_params, chunk_size, Utc::now());
        info!(
            "Seeding {} chunks ({} params, {} per chunk)",
            chunks.len(),
            total_params,
            chunk_size
        );

        for chunk in &chunks {
            let payload = serde_json::to_vec(chunk)
                .map_err(|e| QueueError::Protocol(format!("serializing chunk: {}", e)))?;
            self.publish_json(
                TASK_EXCHANGE,
                TASK_ROUTING_KEY,
                &payload,
                Self::json_properties(&chunk.chunk_id),
            )
            .await?;
        }

        info!("Seeded {} chunks into '{}'", chunks.len(), TASK_QUEUE);
        Ok(chunks.len() as u64)
    }

    async fn task_count(&mut self) -> QueueResult<u64> {
        let (count, _) = self.queue_message_count(TASK_QUEUE).await?;
        Ok(count as u64)
    }

    async fn claim(
        &mut self,
        consumer: &str,
        block_timeout: Duration,
    ) -> QueueResult<Option<ClaimedChunk>> {
        let deadline = Instant::now() + block_timeout;
        loop {
            let message = self
                .channel
                .basic_get(TASK_QUEUE, BasicGetOptions::default())
                .await?;

            if let Some(message) = message {
                let chunk: Chunk =
                    serde_json::from_slice(&message.delivery.data).map_err(|e| {
                        QueueError::Protocol(format!("malformed chunk payload: {}", e))
                    })?;
                debug!(
                    "Claimed chunk {} (params {}-{}, retry {})",
                    chunk.chunk_id, chunk.start_param, chunk.end_param, chunk.retry_count
                );
                return Ok(Some(ClaimedChunk::new(
                    chunk,
                    DeliveryHandle::Broker(message.delivery.delivery_tag),
                    consumer,
                )));
            }

            if Instant::now() + GET_POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(GET_POLL_INTERVAL).await;
        }
    }

    async fn ack(&mut self, claimed: &ClaimedChunk) -> QueueResult<bool> {
        let tag = self.delivery_tag(claimed)?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(true)
    }

    async fn nack(&mut self, claimed: &ClaimedChunk, reason: &str) -> QueueResult<bool> {
        let tag = self.delivery_tag(claimed)?;
        let (updated, route) = prepare_failed(&claimed.chunk, reason, self.max_retries);

        let payload = serde_json::to_vec(&updated)
            .map_err(|e| QueueError::Protocol(format!("serializing chunk: {}", e)))?;

        let mut headers = FieldTable::default();
        headers.insert("retry-count".into(), AMQPValue::LongUInt(updated.retry_count));
        headers.insert(
            "last-error".into(),
            AMQPValue::LongString(reason.to_string().into()),
        );
        let properties = Self::json_properties(&updated.chunk_id).with_headers(headers);

        match route {
            RetryRoute::Retry => {
                self.publish_json(RETRY_EXCHANGE, RETRY_ROUTING_KEY, &payload, properties)
                    .await?;
                warn!(
                    "Chunk {} failed, sent to retry queue ({}/{}): {}",
                    updated.chunk_id, updated.retry_count, self.max_retries, reason
                );
            }
            RetryRoute::DeadLetter => {
                self.publish_json(DLQ_EXCHANGE, DLQ_ROUTING_KEY, &payload, properties)
                    .await?;
                error!(
                    "Chunk {} moved to dead-letter queue after {} attempts: {}",
                    updated.chunk_id, updated.retry_count, reason
                );
            }
        }

        // The original delivery must not be acked before the replacement
        // message is in.
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
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

        let payload = serde_json::to_vec(&record)
            .map_err(|e| QueueError::Protocol(format!("serializing result record: {}", e)))?;
        self.publish_json(
            RESULT_EXCHANGE,
            RESULT_ROUTING_KEY,
            &payload,
            Self::json_properties(chunk_id),
        )
        .await?;

        info!(
            "Published result for chunk {} ({:.2}s)",
            chunk_id, duration_seconds
        );
        Ok(chunk_id.to_string())
    }

    async fn reclaim_stale(
        &mut self,
        _consumer: &str,
        _min_idle: Duration,
        _max_count: usize,
    ) -> QueueResult<Vec<ClaimedChunk>> {
        // The broker requeues unacked deliveries when the holding channel
        // closes; there is nothing for peers to reclaim.
        Ok(Vec::new())
    }

    async fn stats(&mut self) -> QueueResult<QueueStats> {
        let (tasks_total, consumer_count) = self.queue_message_count(TASK_QUEUE).await?;
        let (results_count, _) = self.queue_message_count(RESULT_QUEUE).await?;
        let (retry_count, _) = self.queue_message_count(RETRY_QUEUE).await?;
        let (dead_letter_count, _) = self.queue_message_count(DLQ_QUEUE).await?;

        Ok(QueueStats {
            backend: "broker".to_string(),
            tasks_total: tasks_total as u64,
            tasks_pending: 0,
            results_count: results_count as u64,
            retry_count: Some(retry_count as u64),
            dead_letter_count: Some(dead_letter_count as u64),
            consumers: vec![format!("{} active consumer(s)", consumer_count)],
        })
    }

    async fn purge(&mut self) -> QueueResult<()> {
        for queue in [TASK_QUEUE, RESULT_QUEUE, RETRY_QUEUE, DLQ_QUEUE] {
            // Make sure the queue exists before purging a fresh broker.
            self.queue_message_count(queue).await?;
            self.channel
                .queue_purge(queue, QueuePurgeOptions::default())
                .await?;
        }
        warn!("Purged task, result, retry and dead-letter queues");
        Ok(())
    }

    async fn reconnect(&mut self) -> QueueResult<()> {
        warn!("Reconnecting to AMQP broker");
        let (conn, channel) = Self::open(&self.url, self.retry_delay, &self.retry).await?;
        let old = std::mem::replace(&mut self.conn, conn);
        self.channel = channel;
        let _ = old.close(200, "reconnecting").await;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.conn.close(200, "worker shutting down").await {
            debug!("AMQP close: {}", e);
        } else {
            info!("Disconnected from AMQP broker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk_with_retries(retry_count: u32) -> Chunk {
        let mut chunk = plan_chunks(100, 100, Utc::now()).remove(0);
        chunk.retry_count = retry_count;
        chunk
    }

    #[test]
    fn test_first_failure_routes_to_retry() {
        let (updated, route) = prepare_failed(&chunk_with_retries(0), "boom", 3);
        assert_eq!(route, RetryRoute::Retry);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.status, ChunkStatus::Pending);
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
        assert!(updated.failed_at.is_some());
    }

    #[test]
    fn test_exhausted_budget_routes_to_dlq() {
        let (updated, route) = prepare_failed(&chunk_with_retries(3), "boom", 3);
        assert_eq!(route, RetryRoute::DeadLetter);
        assert_eq!(updated.retry_count, 4);
        assert_eq!(updated.status, ChunkStatus::DeadLettered);
    }

    #[test]
    fn test_zero_max_retries_dead_letters_immediately() {
        // With no retry budget the first failure is terminal, and the
        // dead-lettered chunk records exactly one attempt.
        let (updated, route) = prepare_failed(&chunk_with_retries(0), "boom", 0);
        assert_eq!(route, RetryRoute::DeadLetter);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.status, ChunkStatus::DeadLettered);
    }

    #[test]
    fn test_retry_budget_boundary() {
        // retry_count strictly below max_retries keeps retrying; at the
        // boundary the chunk is diverted.
        let (_, route) = prepare_failed(&chunk_with_retries(2), "boom", 3);
        assert_eq!(route, RetryRoute::Retry);
        let (_, route) = prepare_failed(&chunk_with_retries(3), "boom", 3);
        assert_eq!(route, RetryRoute::DeadLetter);
    }

    #[test]
    fn test_failed_chunk_round_trips_as_json() {
        let (updated, _) = prepare_failed(&chunk_with_retries(1), "synthetic fault", 3);
        let json = serde_json::to_vec(&updated).unwrap();
        let parsed: Chunk = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, updated);
    }
}
