//! Pipeline lifecycle.
//!
//! Startup order:
//!
//! 1. declare every event queue and its dead-letter companion
//! 2. open one subscription per event queue
//! 3. spawn the publisher pool
//! 4. spawn one consumer processor per queue
//!
//! Any broker error before step 3 is fatal and nothing is left running.
//!
//! Once the [`ShutdownSignal`] fires, from an OS signal or from the publisher
//! pool giving up, the ingestion buffer is closed right away. Producers
//! blocked on a full buffer are released with an error instead of holding up
//! the HTTP server's graceful shutdown.
//!
//! [`Pipeline::shutdown`] runs the reverse: close the ingestion buffer, let
//! the publisher pool drain it, close the broker connection (which ends the
//! subscriptions and returns unacked deliveries), then wait for the consumer
//! loops. Every wait shares one deadline.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, BrokerGateway};
use crate::buffer::IngestionBuffer;
use crate::config::PipelineConfig;
use crate::consumer::{ConsumerProcessor, ConsumerReport};
use crate::dlq::{dlq_queue_name, DeadLetterQueue};
use crate::envelope::EventKind;
use crate::publisher::{PoolReport, PublisherPool};
use crate::services::Services;
use crate::shutdown::ShutdownSignal;
use crate::store::Store;
use crate::telemetry::Telemetry;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to declare queues: {0}")]
    Declare(#[source] BrokerError),

    #[error("failed to consume queue {queue}: {source}")]
    Consume {
        queue: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("failed to connect to {component}: {reason}")]
    Connect { component: &'static str, reason: String },
}

/// What happened during [`Pipeline::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// `None` if the pool did not drain before the deadline
    pub pool: Option<PoolReport>,
    pub consumers: Vec<(EventKind, ConsumerReport)>,
    pub timed_out: bool,
}

/// Every queue the pipeline uses: the event queues and their dead-letter queues.
pub fn queue_names() -> Vec<String> {
    EventKind::ALL
        .iter()
        .flat_map(|kind| {
            let queue = kind.queue_name();
            [queue.to_string(), dlq_queue_name(queue)]
        })
        .collect()
}

/// A running pipeline.
pub struct Pipeline {
    buffer: IngestionBuffer,
    services: Services,
    gateway: Arc<dyn BrokerGateway>,
    pool: PublisherPool,
    consumers: Vec<(EventKind, JoinHandle<ConsumerReport>)>,
    closer: JoinHandle<()>,
}

impl Pipeline {
    pub async fn start(
        config: &PipelineConfig,
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<dyn Store>,
        telemetry: Arc<dyn Telemetry>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, StartupError> {
        let queues = queue_names();
        let names: Vec<&str> = queues.iter().map(String::as_str).collect();
        gateway.declare_queues(&names).await.map_err(StartupError::Declare)?;

        let mut subscriptions = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let queue = kind.queue_name();
            let subscription = gateway
                .consume(queue)
                .await
                .map_err(|source| StartupError::Consume { queue, source })?;
            subscriptions.push((kind, subscription));
        }

        let buffer = IngestionBuffer::new(config.capacity);
        let services = Services::new(store, telemetry.clone());
        let pool = PublisherPool::spawn(
            config.pool(),
            buffer.clone(),
            gateway.clone(),
            telemetry.clone(),
            shutdown.clone(),
        );
        let closer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                shutdown.recv().await;
                info!("Shutdown signalled, closing ingestion buffer");
                buffer.close();
            })
        };

        let dlq = DeadLetterQueue::new(gateway.clone());
        let consumers = subscriptions
            .into_iter()
            .map(|(kind, subscription)| {
                let processor = ConsumerProcessor::new(
                    kind,
                    services.clone(),
                    dlq.clone(),
                    telemetry.clone(),
                    config.retry_policy(),
                );
                (kind, tokio::spawn(processor.run(subscription)))
            })
            .collect();

        info!(
            queues = ?names,
            capacity = config.capacity,
            pool_size = config.pool_size,
            "Pipeline started"
        );

        Ok(Self {
            buffer,
            services,
            gateway,
            pool,
            consumers,
            closer,
        })
    }

    /// Handle producers enqueue into.
    pub fn buffer(&self) -> &IngestionBuffer {
        &self.buffer
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Whether the publisher pool has stopped (all workers gone).
    pub fn publisher_stopped(&self) -> bool {
        self.pool.is_finished()
    }

    /// Drain and stop everything within `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        info!(timeout_ms = timeout.as_millis() as u64, "Pipeline shutting down");

        self.closer.abort();
        self.buffer.close();
        match tokio::time::timeout_at(deadline, self.pool.join()).await {
            Ok(pool) => report.pool = Some(pool),
            Err(_) => {
                warn!(buffered = self.buffer.len(), "Publisher pool did not drain before the deadline");
                report.timed_out = true;
            }
        }

        self.gateway.close().await;

        for (kind, handle) in self.consumers {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(consumer)) => report.consumers.push((kind, consumer)),
                Ok(Err(e)) => error!(queue = %kind.queue_name(), error = %e, "Consumer task failed"),
                Err(_) => {
                    warn!(queue = %kind.queue_name(), "Consumer did not stop before the deadline");
                    abort.abort();
                    report.timed_out = true;
                }
            }
        }

        info!(timed_out = report.timed_out, "Pipeline stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;
    use crate::telemetry::NoopTelemetry;

    #[test]
    fn test_queue_names() {
        assert_eq!(
            queue_names(),
            vec![
                "discount_club_create",
                "discount_club_create_dlq",
                "users",
                "users_dlq",
                "discount_club_signup",
                "discount_club_signup_dlq",
            ]
        );
    }

    #[tokio::test]
    async fn test_start_on_closed_broker_is_fatal() {
        let broker = MemoryBroker::new();
        broker.close().await;

        let result = Pipeline::start(
            &PipelineConfig::default(),
            Arc::new(broker),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopTelemetry),
            ShutdownSignal::new(),
        )
        .await;
        assert!(matches!(result, Err(StartupError::Declare(BrokerError::Closed))));
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_buffer() {
        let shutdown = ShutdownSignal::new();
        let pipeline = Pipeline::start(
            &PipelineConfig::default(),
            Arc::new(MemoryBroker::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopTelemetry),
            shutdown.clone(),
        )
        .await
        .unwrap();
        assert!(!pipeline.buffer().is_closed());

        shutdown.trigger();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !pipeline.buffer().is_closed() {
            assert!(Instant::now() < deadline, "buffer still open after shutdown");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = pipeline.shutdown(Duration::from_secs(2)).await;
        assert!(!report.timed_out);
    }

    #[tokio::test]
    async fn test_idle_start_and_shutdown() {
        let broker = MemoryBroker::new();
        let pipeline = Pipeline::start(
            &PipelineConfig::default(),
            Arc::new(broker.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopTelemetry),
            ShutdownSignal::new(),
        )
        .await
        .unwrap();

        let report = pipeline.shutdown(Duration::from_secs(2)).await;
        assert!(!report.timed_out);
        assert_eq!(report.pool, Some(PoolReport::default()));
        assert_eq!(report.consumers.len(), 3);
        assert!(broker.is_closed());
    }
}
