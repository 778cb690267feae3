//! Usage accounting pipeline.
//!
//! Handlers enqueue records on a bounded channel and never wait on IO. The
//! worker appends each record to the durable spool before any publish
//! attempt, batches publishes, and advances the spool checkpoint only on
//! broker acknowledgement. Startup drains whatever a previous process left
//! behind.

mod buffer;
mod error;
mod publisher;
mod record;

pub use buffer::UsageSpool;
pub use error::UsageError;
pub use publisher::{KafkaUsagePublisher, LogUsagePublisher, MemoryPublisher, UsagePublisher};
pub use record::{UsageOutcome, UsageRecord};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::UsageConfig;

const BACKOFF_MIN: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Handle the request path uses to emit records.
#[derive(Clone)]
pub struct UsagePipeline {
    tx: mpsc::Sender<UsageRecord>,
    spool: Arc<UsageSpool>,
    high_water: usize,
    enqueue_drops: Arc<AtomicU64>,
}

impl UsagePipeline {
    /// Build the pipeline and its worker. The worker is inert until
    /// [`UsageWorker::start`] is called.
    pub fn new(
        config: &UsageConfig,
        publisher: Arc<dyn UsagePublisher>,
    ) -> Result<(Self, UsageWorker), UsageError> {
        let spool = Arc::new(UsageSpool::open(
            &config.spool_dir,
            config.max_spool_records,
            config.max_spool_bytes,
        )?);

        let (tx, rx) = mpsc::channel(config.channel_capacity);

        let pipeline = Self {
            tx,
            spool: Arc::clone(&spool),
            high_water: config.high_water_records,
            enqueue_drops: Arc::new(AtomicU64::new(0)),
        };

        let worker = UsageWorker {
            rx,
            spool,
            publisher,
            batch_size: config.batch_size,
            linger: Duration::from_millis(config.batch_linger_ms),
        };

        Ok((pipeline, worker))
    }

    /// Enqueue a record without blocking.
    ///
    /// A full channel drops the record and counts it; request serving is
    /// never held up by accounting.
    pub fn emit(&self, record: UsageRecord) {
        metrics::counter!("gantry_usage_records_total",
            "outcome" => format!("{:?}", record.outcome)
        )
        .increment(1);

        if self.tx.try_send(record).is_err() {
            self.enqueue_drops.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gantry_usage_enqueue_drops_total").increment(1);
            tracing::warn!("Usage channel full, record dropped");
        }
    }

    /// Spool depth, for readiness and the admin surface.
    pub fn depth(&self) -> u64 {
        self.spool.depth()
    }

    /// Whether the pipeline is below its high-water mark.
    pub fn below_high_water(&self) -> bool {
        self.depth() <= self.high_water as u64
    }

    /// Records dropped at the channel since startup.
    pub fn enqueue_drops(&self) -> u64 {
        self.enqueue_drops.load(Ordering::Relaxed)
    }
}

/// Background worker: spool writes, batching, publish retries.
pub struct UsageWorker {
    rx: mpsc::Receiver<UsageRecord>,
    spool: Arc<UsageSpool>,
    publisher: Arc<dyn UsagePublisher>,
    batch_size: usize,
    linger: Duration,
}

impl UsageWorker {
    /// Publish the unacked backlog in batch-sized chunks, advancing the
    /// checkpoint after each acknowledged chunk.
    async fn flush_backlog(&self) -> Result<(), UsageError> {
        loop {
            let pending = self.spool.pending()?;
            if pending.is_empty() {
                return Ok(());
            }

            let chunk: Vec<&UsageRecord> = pending
                .iter()
                .take(self.batch_size)
                .map(|(_, r)| r)
                .collect();
            let chunk_owned: Vec<UsageRecord> = chunk.into_iter().cloned().collect();
            let last_seq = pending[chunk_owned.len() - 1].0;

            self.publisher.publish(&chunk_owned).await?;
            self.spool.ack(last_seq + 1)?;

            metrics::counter!("gantry_usage_published_total")
                .increment(chunk_owned.len() as u64);
        }
    }

    /// Pull up to `batch_size` records, waiting at most `linger` for the
    /// first and draining whatever else is immediately available.
    async fn collect_batch(&mut self) -> Vec<UsageRecord> {
        let mut batch = Vec::new();

        match tokio::time::timeout(self.linger, self.rx.recv()).await {
            Ok(Some(record)) => batch.push(record),
            Ok(None) | Err(_) => return batch,
        }

        while batch.len() < self.batch_size {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        batch
    }

    fn spool_batch(&self, batch: &[UsageRecord]) {
        for record in batch {
            if let Err(e) = self.spool.append(record) {
                tracing::error!(error = %e, "Failed to append usage record to spool");
            }
        }
        metrics::gauge!("gantry_usage_spool_depth").set(self.spool.depth() as f64);
    }

    /// Run the worker until cancelled. Drains the spool first so records
    /// from a previous process publish before fresh traffic.
    pub fn start(mut self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Usage worker started");

            let mut backoff = BACKOFF_MIN;
            let mut next_attempt = Instant::now();

            loop {
                if cancel_token.is_cancelled() {
                    break;
                }

                let batch = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    batch = self.collect_batch() => batch,
                };

                self.spool_batch(&batch);

                if self.spool.depth() > 0 && Instant::now() >= next_attempt {
                    match self.flush_backlog().await {
                        Ok(()) => {
                            backoff = BACKOFF_MIN;
                            next_attempt = Instant::now();
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                backoff_ms = backoff.as_millis() as u64,
                                "Usage publish failed, backing off"
                            );
                            metrics::counter!("gantry_usage_publish_errors_total").increment(1);
                            next_attempt = Instant::now() + backoff;
                            backoff = (backoff * 2).min(BACKOFF_MAX);
                        }
                    }
                    metrics::gauge!("gantry_usage_spool_depth").set(self.spool.depth() as f64);
                }
            }

            // Shutdown: persist whatever is still queued, then one final
            // publish attempt.
            let mut remainder = Vec::new();
            while let Ok(record) = self.rx.try_recv() {
                remainder.push(record);
            }
            self.spool_batch(&remainder);

            if let Err(e) = self.flush_backlog().await {
                tracing::warn!(
                    error = %e,
                    depth = self.spool.depth(),
                    "Final usage flush incomplete; spool retained for next start"
                );
            }

            tracing::info!("Usage worker shut down");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> UsageRecord {
        UsageRecord {
            record_id: Uuid::new_v4(),
            idempotency_token: Uuid::new_v4(),
            org_id: "acme".to_string(),
            key_id: "k".to_string(),
            model: "m1".to_string(),
            backend_id: Some("b1".to_string()),
            input_bytes: 1,
            output_bytes: 2,
            upstream_latency_ms: 3,
            outcome: UsageOutcome::Allowed,
            decision_reason: Some("primary".to_string()),
            policy_version: Some(1),
            timestamp_utc: Utc::now(),
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
        }
    }

    fn config(dir: &std::path::Path) -> UsageConfig {
        UsageConfig {
            spool_dir: dir.to_path_buf(),
            batch_linger_ms: 10,
            ..UsageConfig::default()
        }
    }

    #[tokio::test]
    async fn emitted_records_publish() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(MemoryPublisher::new());
        let (pipeline, worker) =
            UsagePipeline::new(&config(dir.path()), publisher.clone()).unwrap();

        let cancel = CancellationToken::new();
        let handle = worker.start(cancel.clone());

        let r = record();
        let id = r.record_id;
        pipeline.emit(r);

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].record_id, id);
        assert_eq!(pipeline.depth(), 0);
    }

    #[tokio::test]
    async fn outage_buffers_then_drains_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(MemoryPublisher::new());
        publisher.set_failing(true);

        let (pipeline, worker) =
            UsagePipeline::new(&config(dir.path()), publisher.clone()).unwrap();
        let cancel = CancellationToken::new();
        let handle = worker.start(cancel.clone());

        let records: Vec<UsageRecord> = (0..5).map(|_| record()).collect();
        let mut expected: Vec<Uuid> = records.iter().map(|r| r.record_id).collect();
        for r in records {
            pipeline.emit(r);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(publisher.published().is_empty());
        assert!(pipeline.depth() > 0);

        publisher.set_failing(false);
        // Emit one more to wake the loop past its backoff window
        tokio::time::sleep(Duration::from_millis(600)).await;
        let extra = record();
        expected.push(extra.record_id);
        pipeline.emit(extra);
        tokio::time::sleep(Duration::from_millis(600)).await;

        cancel.cancel();
        handle.await.unwrap();

        let mut published: Vec<Uuid> =
            publisher.published().iter().map(|r| r.record_id).collect();
        published.sort();
        expected.sort();
        assert_eq!(published, expected);
        assert_eq!(pipeline.depth(), 0);
    }

    #[tokio::test]
    async fn startup_drains_previous_spool() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = record();

        // A previous process spooled a record but never published it.
        {
            let spool = UsageSpool::open(dir.path(), 100, 1 << 20).unwrap();
            spool.append(&orphan).unwrap();
        }

        let publisher = Arc::new(MemoryPublisher::new());
        let (pipeline, worker) =
            UsagePipeline::new(&config(dir.path()), publisher.clone()).unwrap();
        assert_eq!(pipeline.depth(), 1);

        let cancel = CancellationToken::new();
        let handle = worker.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].record_id, orphan.record_id);
    }
}
