//! Publisher pool: moves envelopes from the ingestion buffer to the broker.
//!
//! `size` workers share the buffer. Each takes one envelope at a time,
//! encodes it and publishes it to the queue of its kind. A worker whose
//! publish fails exits with a [`PublishError`] carrying the envelope.
//!
//! A supervisor task watches the workers through a `JoinSet`. Failed
//! workers are restarted after [`RESTART_DELAY`] until `max_restarts` is
//! used up, and the replacement publishes the failed envelope before
//! taking new ones. The next failure after that triggers the process
//! [`ShutdownSignal`] and the envelope goes back into the buffer, waiting
//! for a slot if necessary. Workers exit cleanly once the buffer is closed
//! and drained, and the supervisor then reports a [`PoolReport`].

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{BrokerError, BrokerGateway};
use crate::buffer::IngestionBuffer;
use crate::envelope::{CodecError, Envelope, EventKind};
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{Metric, Telemetry};

/// Pause before a failed worker is replaced.
pub const RESTART_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode {kind} envelope: {source}")]
    Encode {
        kind: EventKind,
        #[source]
        source: CodecError,
    },

    #[error("failed to publish {kind} envelope: {source}")]
    Broker {
        kind: EventKind,
        #[source]
        source: BrokerError,
        /// The envelope that was not published
        envelope: Envelope,
    },

    #[error("publisher worker panicked: {0}")]
    Panicked(String),
}

impl PublishError {
    /// The unpublished envelope, if the failure left one behind.
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            PublishError::Broker { envelope, .. } => Some(envelope),
            PublishError::Encode { .. } | PublishError::Panicked(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: usize,
    pub max_restarts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            max_restarts: 3,
        }
    }
}

/// Summary returned once every worker has exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub published: u64,
    pub restarts: u32,
    pub failed_workers: u32,
}

#[derive(Clone)]
struct Worker {
    buffer: IngestionBuffer,
    gateway: Arc<dyn BrokerGateway>,
    telemetry: Arc<dyn Telemetry>,
    published: Arc<AtomicU64>,
}

impl Worker {
    /// Publish `pending` first if given, then drain the buffer.
    async fn run(self, id: usize, mut pending: Option<Envelope>) -> Result<(), PublishError> {
        debug!(worker = id, retrying = pending.is_some(), "Publisher worker started");
        loop {
            let envelope = match pending.take() {
                Some(envelope) => envelope,
                None => match self.buffer.dequeue().await {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let kind = envelope.kind();
            let body = match envelope.encode() {
                Ok(body) => body,
                Err(source) => {
                    // Encoding is deterministic, retrying cannot help.
                    let e = PublishError::Encode { kind, source };
                    error!(worker = id, error = %e, "Dropping unencodable envelope");
                    self.telemetry.record(Metric::PublishFailed(kind));
                    continue;
                }
            };

            let queue = kind.queue_name();
            let span = info_span!("publish", worker = id, queue = %queue);
            match self.gateway.publish(queue, Bytes::from(body)).instrument(span).await {
                Ok(()) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                    self.telemetry.record(Metric::EnvelopePublished(kind));
                    debug!(worker = id, queue = %queue, "Envelope published");
                }
                Err(source) => {
                    self.telemetry.record(Metric::PublishFailed(kind));
                    return Err(PublishError::Broker { kind, source, envelope });
                }
            }
        }
        debug!(worker = id, "Publisher worker finished, buffer drained");
        Ok(())
    }
}

/// Handle to the supervised worker pool.
pub struct PublisherPool {
    supervisor: JoinHandle<PoolReport>,
}

impl PublisherPool {
    pub fn spawn(
        config: PoolConfig,
        buffer: IngestionBuffer,
        gateway: Arc<dyn BrokerGateway>,
        telemetry: Arc<dyn Telemetry>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let worker = Worker {
            buffer,
            gateway,
            telemetry,
            published: Arc::new(AtomicU64::new(0)),
        };
        let supervisor = tokio::spawn(supervise(config, worker, shutdown));
        info!(size = config.size, max_restarts = config.max_restarts, "Publisher pool started");
        Self { supervisor }
    }

    /// Wait until every worker has exited.
    pub async fn join(self) -> PoolReport {
        match self.supervisor.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Publisher supervisor failed");
                PoolReport::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }
}

async fn supervise(config: PoolConfig, worker: Worker, shutdown: ShutdownSignal) -> PoolReport {
    let mut workers = JoinSet::new();
    let mut next_id = 0;
    for _ in 0..config.size {
        let w = worker.clone();
        let id = next_id;
        workers.spawn(async move { (id, w.run(id, None).await) });
        next_id += 1;
    }

    let mut report = PoolReport::default();
    while let Some(joined) = workers.join_next().await {
        let (id, err) = match joined {
            Ok((id, Ok(()))) => {
                debug!(worker = id, "Publisher worker exited");
                continue;
            }
            Ok((id, Err(e))) => (Some(id), e),
            Err(e) => (None, PublishError::Panicked(e.to_string())),
        };
        report.failed_workers += 1;
        let reason = err.to_string();
        let in_flight = err.into_envelope();

        if report.restarts < config.max_restarts {
            report.restarts += 1;
            let w = worker.clone();
            let new_id = next_id;
            next_id += 1;
            warn!(
                worker = ?id,
                replacement = new_id,
                restarts = report.restarts,
                error = %reason,
                "Publisher worker failed, restarting"
            );
            workers.spawn(async move {
                tokio::time::sleep(RESTART_DELAY).await;
                (new_id, w.run(new_id, in_flight).await)
            });
        } else {
            error!(
                worker = ?id,
                restarts = report.restarts,
                error = %reason,
                "Publisher worker failed with no restarts left, shutting down"
            );
            shutdown.trigger();
            if let Some(envelope) = in_flight {
                let kind = envelope.kind();
                // Waits for a slot; returns once shutdown closes the buffer.
                match worker.buffer.enqueue(envelope).await {
                    Ok(()) => warn!(kind = %kind, "In-flight envelope returned to buffer"),
                    Err(e) => error!(kind = %kind, reason = %e, "In-flight envelope lost"),
                }
            }
        }
    }

    report.published = worker.published.load(Ordering::Relaxed);
    info!(
        published = report.published,
        restarts = report.restarts,
        failed_workers = report.failed_workers,
        "Publisher pool stopped"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Subscription};
    use crate::domain::User;
    use crate::envelope::Event;
    use crate::telemetry::{NoopTelemetry, PipelineMetrics};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn envelope(email: &str) -> Envelope {
        let user = User {
            id: None,
            name: "Ann".to_string(),
            email: email.to_string(),
            active: true,
        };
        Envelope::new(EventKind::CreateUser, &user).unwrap()
    }

    /// Fails the first `failures` publishes, then forwards to a memory broker.
    struct FlakyGateway {
        inner: MemoryBroker,
        failures: AtomicU32,
        fail_after: Duration,
    }

    impl FlakyGateway {
        fn new(inner: MemoryBroker, failures: u32) -> Self {
            Self {
                inner,
                failures: AtomicU32::new(failures),
                fail_after: Duration::ZERO,
            }
        }

        /// Hang for `delay` before each failing publish returns.
        fn failing_after(mut self, delay: Duration) -> Self {
            self.fail_after = delay;
            self
        }
    }

    #[async_trait]
    impl BrokerGateway for FlakyGateway {
        async fn declare_queues(&self, names: &[&str]) -> Result<(), BrokerError> {
            self.inner.declare_queues(names).await
        }

        async fn publish(&self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                tokio::time::sleep(self.fail_after).await;
                return Err(BrokerError::Connection("connection reset".to_string()));
            }
            self.inner.publish(queue, body).await
        }

        async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
            self.inner.consume(queue).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    async fn users_broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_queues(&["users"]).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publishes_everything_then_drains() {
        let broker = users_broker().await;
        let buffer = IngestionBuffer::new(10);
        let metrics = Arc::new(PipelineMetrics::new());
        for i in 0..5 {
            buffer.enqueue(envelope(&format!("u{}@example.com", i))).await.unwrap();
        }

        let pool = PublisherPool::spawn(
            PoolConfig { size: 2, max_restarts: 1 },
            buffer.clone(),
            Arc::new(broker.clone()),
            metrics.clone(),
            ShutdownSignal::new(),
        );
        buffer.close();
        let report = pool.join().await;

        assert_eq!(report, PoolReport { published: 5, restarts: 0, failed_workers: 0 });
        assert_eq!(broker.ready_len("users"), 5);
        assert_eq!(metrics.snapshot().published["users"], 5);

        let first: Envelope = Envelope::decode(&broker.peek("users")[0]).unwrap();
        assert_eq!(first.kind(), EventKind::CreateUser);
    }

    #[tokio::test]
    async fn test_failed_worker_is_restarted() {
        let broker = users_broker().await;
        let buffer = IngestionBuffer::new(10);
        buffer.enqueue(envelope("a@example.com")).await.unwrap();
        buffer.enqueue(envelope("b@example.com")).await.unwrap();
        let shutdown = ShutdownSignal::new();

        let pool = PublisherPool::spawn(
            PoolConfig { size: 1, max_restarts: 3 },
            buffer.clone(),
            Arc::new(FlakyGateway::new(broker.clone(), 1)),
            Arc::new(NoopTelemetry),
            shutdown.clone(),
        );

        while broker.ready_len("users") < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        buffer.close();
        let report = pool.join().await;

        assert_eq!(report.published, 2);
        assert_eq!(report.restarts, 1);
        assert_eq!(report.failed_workers, 1);
        assert!(!shutdown.is_shutdown());
    }

    fn published_emails(broker: &MemoryBroker) -> Vec<String> {
        broker
            .peek("users")
            .iter()
            .map(|body| match Event::from_envelope(&Envelope::decode(body).unwrap()).unwrap() {
                Event::CreateUser(user) => user.email,
                other => panic!("unexpected event {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failed_envelope_survives_full_buffer() {
        let broker = users_broker().await;
        let buffer = IngestionBuffer::new(1);
        buffer.enqueue(envelope("a@example.com")).await.unwrap();

        let gateway = FlakyGateway::new(broker.clone(), 1).failing_after(Duration::from_millis(100));
        let pool = PublisherPool::spawn(
            PoolConfig { size: 1, max_restarts: 1 },
            buffer.clone(),
            Arc::new(gateway),
            Arc::new(NoopTelemetry),
            ShutdownSignal::new(),
        );

        // Takes the slot freed when the worker picked up the first envelope,
        // so the buffer is full when that publish fails.
        buffer.enqueue(envelope("b@example.com")).await.unwrap();
        assert_eq!(buffer.len(), 1);

        while broker.ready_len("users") < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        buffer.close();
        let report = pool.join().await;

        assert_eq!(report.published, 2);
        assert_eq!(report.restarts, 1);
        assert_eq!(published_emails(&broker), ["a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn test_exhausted_restarts_trigger_shutdown() {
        let broker = users_broker().await;
        let buffer = IngestionBuffer::new(10);
        buffer.enqueue(envelope("a@example.com")).await.unwrap();
        let shutdown = ShutdownSignal::new();

        let pool = PublisherPool::spawn(
            PoolConfig { size: 1, max_restarts: 2 },
            buffer.clone(),
            Arc::new(FlakyGateway::new(broker.clone(), u32::MAX)),
            Arc::new(NoopTelemetry),
            shutdown.clone(),
        );

        assert!(shutdown.wait_with_timeout(Duration::from_secs(2)).await);
        let report = pool.join().await;

        assert_eq!(report.published, 0);
        assert_eq!(report.restarts, 2);
        assert_eq!(report.failed_workers, 3);
        // The envelope went back to the buffer instead of being dropped.
        assert_eq!(buffer.len(), 1);
        assert_eq!(broker.ready_len("users"), 0);
    }
}
