//! Usage record publishers.
//!
//! The worker hands batches to a [`UsagePublisher`]; the Kafka publisher is
//! the production path, the log publisher keeps single-node deployments
//! working without a broker, and the memory publisher backs tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::error::UsageError;
use super::record::UsageRecord;

/// Destination for acknowledged usage batches.
///
/// `publish` must return `Ok` only once every record in the batch is
/// acknowledged by the destination; the spool checkpoint advances on that
/// signal.
#[async_trait]
pub trait UsagePublisher: Send + Sync {
    async fn publish(&self, records: &[UsageRecord]) -> Result<(), UsageError>;
}

/// Kafka-backed publisher on a named topic.
pub struct KafkaUsagePublisher {
    producer: FutureProducer,
    topic: String,
    ack_timeout: Duration,
}

impl KafkaUsagePublisher {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, UsageError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "10000")
            .set("acks", "all")
            .create()
            .map_err(|e| UsageError::Publish(e.to_string()))?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            ack_timeout: Duration::from_secs(15),
        })
    }
}

#[async_trait]
impl UsagePublisher for KafkaUsagePublisher {
    async fn publish(&self, records: &[UsageRecord]) -> Result<(), UsageError> {
        for record in records {
            let key = record.record_id.to_string();
            let payload =
                serde_json::to_vec(record).map_err(|e| UsageError::Publish(e.to_string()))?;

            self.producer
                .send(
                    FutureRecord::to(&self.topic).key(&key).payload(&payload),
                    Timeout::After(self.ack_timeout),
                )
                .await
                .map_err(|(e, _)| UsageError::Publish(e.to_string()))?;
        }
        Ok(())
    }
}

/// Fallback publisher that writes records to the structured log.
pub struct LogUsagePublisher;

#[async_trait]
impl UsagePublisher for LogUsagePublisher {
    async fn publish(&self, records: &[UsageRecord]) -> Result<(), UsageError> {
        for record in records {
            tracing::info!(
                target: "gantry::usage",
                record_id = %record.record_id,
                org_id = %record.org_id,
                model = %record.model,
                outcome = ?record.outcome,
                upstream_latency_ms = record.upstream_latency_ms,
                "usage record"
            );
        }
        Ok(())
    }
}

/// In-memory publisher for tests, with a switchable outage.
#[derive(Default)]
pub struct MemoryPublisher {
    records: Mutex<Vec<UsageRecord>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl UsagePublisher for MemoryPublisher {
    async fn publish(&self, records: &[UsageRecord]) -> Result<(), UsageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UsageError::Publish("simulated outage".to_string()));
        }
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}
