//! Consumer processors.
//!
//! One [`ConsumerProcessor`] runs per queue. For every delivery it decodes
//! the envelope, runs the business operation and then settles the delivery:
//!
//! | Result | Settlement |
//! |---|---|
//! | success | ack |
//! | duplicate key | ack (already applied by an earlier delivery) |
//! | transient store failure | backoff, then requeue (no limit) |
//! | decode error or failed precondition | backoff and requeue while `attempt < max_redeliveries`, else dead-letter and ack |
//!
//! A delivery is never acked before its writes have completed, so a
//! processor killed mid-delivery leaves the message to be redelivered.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{Delivery, Subscription};
use crate::dlq::DeadLetterQueue;
use crate::envelope::{CodecError, Envelope, EventKind};
use crate::services::{ServiceError, Services};
use crate::telemetry::{Metric, Telemetry};

/// Shift cap for the exponential backoff (base * 32 at most).
const MAX_BACKOFF_SHIFT: u32 = 5;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("queue {queue} received a {kind} envelope")]
    WrongQueue { queue: &'static str, kind: EventKind },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ConsumerError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ConsumerError::Service(e) if e.is_duplicate())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ConsumerError::Service(e) if e.is_transient())
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Duplicate,
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries allowed before a permanently failing message is dead-lettered
    pub max_redeliveries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// `base * 2^min(attempt - 1, 5)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_delay * (1u32 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Deliveries settled by one processor, by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub acked: u64,
    pub duplicates: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl ConsumerReport {
    fn count(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acked => self.acked += 1,
            DeliveryOutcome::Duplicate => self.duplicates += 1,
            DeliveryOutcome::Requeued => self.requeued += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.acked + self.duplicates + self.requeued + self.dead_lettered
    }
}

pub struct ConsumerProcessor {
    kind: EventKind,
    services: Services,
    dlq: DeadLetterQueue,
    telemetry: Arc<dyn Telemetry>,
    policy: RetryPolicy,
}

impl ConsumerProcessor {
    pub fn new(
        kind: EventKind,
        services: Services,
        dlq: DeadLetterQueue,
        telemetry: Arc<dyn Telemetry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            kind,
            services,
            dlq,
            telemetry,
            policy,
        }
    }

    pub fn queue(&self) -> &'static str {
        self.kind.queue_name()
    }

    /// Decode a message body and run its business operation.
    pub async fn apply(&self, body: &[u8]) -> Result<(), ConsumerError> {
        let envelope = Envelope::decode(body)?;
        if envelope.kind() != self.kind {
            return Err(ConsumerError::WrongQueue {
                queue: self.queue(),
                kind: envelope.kind(),
            });
        }
        let event = envelope.open()?;
        self.services.apply(&event).await?;
        Ok(())
    }

    /// Handle one delivery and settle it.
    pub async fn process(&self, delivery: Delivery) -> DeliveryOutcome {
        let attempt = delivery.attempt();
        let outcome = match self.apply(delivery.body()).await {
            Ok(()) => {
                debug!("Delivery applied");
                settle_ack(delivery).await;
                DeliveryOutcome::Acked
            }
            Err(e) if e.is_duplicate() => {
                debug!(error = %e, "Duplicate delivery, already applied");
                settle_ack(delivery).await;
                DeliveryOutcome::Duplicate
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Transient failure, requeueing");
                self.requeue_after_backoff(delivery).await
            }
            Err(e) if attempt < self.policy.max_redeliveries => {
                warn!(
                    error = %e,
                    max_redeliveries = self.policy.max_redeliveries,
                    "Delivery failed, requeueing"
                );
                self.requeue_after_backoff(delivery).await
            }
            Err(e) => {
                warn!(error = %e, "Redeliveries exhausted, dead-lettering");
                match self
                    .dlq
                    .add(self.queue(), delivery.body(), &e.to_string(), attempt)
                    .await
                {
                    Ok(_) => {
                        settle_ack(delivery).await;
                        DeliveryOutcome::DeadLettered
                    }
                    Err(_) => self.requeue_after_backoff(delivery).await,
                }
            }
        };

        self.telemetry.record(Metric::Delivery {
            kind: self.kind,
            outcome,
        });
        outcome
    }

    async fn requeue_after_backoff(&self, delivery: Delivery) -> DeliveryOutcome {
        let backoff = self.policy.backoff(delivery.attempt());
        debug!(backoff_ms = backoff.as_millis() as u64, "Backing off before requeue");
        tokio::time::sleep(backoff).await;
        if let Err(e) = delivery.nack(true).await {
            warn!(error = %e, "Failed to requeue delivery, broker will redeliver it");
        }
        DeliveryOutcome::Requeued
    }

    /// Process deliveries until the subscription ends.
    pub async fn run(self, mut subscription: Box<dyn Subscription>) -> ConsumerReport {
        let queue = self.queue();
        let mut report = ConsumerReport::default();
        info!(queue = %queue, "Consumer started");

        while let Some(delivery) = subscription.next().await {
            let span = info_span!("delivery", queue = %queue, attempt = delivery.attempt());
            let outcome = self.process(delivery).instrument(span).await;
            report.count(outcome);
        }

        info!(
            queue = %queue,
            acked = report.acked,
            duplicates = report.duplicates,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "Consumer stopped"
        );
        report
    }
}

async fn settle_ack(delivery: Delivery) {
    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to ack delivery, it will be redelivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerGateway, MemoryBroker};
    use crate::dlq::{dlq_queue_name, FailedEnvelope};
    use crate::domain::{Club, User};
    use crate::store::{MemoryStore, PlanStatus, Store, StoreError};
    use crate::telemetry::PipelineMetrics;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct DownStore;

    fn down<T>() -> Result<T, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    #[async_trait]
    impl Store for DownStore {
        async fn insert_club(&self, _: &Club) -> Result<i64, StoreError> {
            down()
        }
        async fn insert_user(&self, _: &User) -> Result<i64, StoreError> {
            down()
        }
        async fn user_id(&self, _: &str) -> Result<i64, StoreError> {
            down()
        }
        async fn club_id(&self, _: &str) -> Result<i64, StoreError> {
            down()
        }
        async fn user_state(&self, _: i64) -> Result<bool, StoreError> {
            down()
        }
        async fn insert_user_club(&self, _: i64, _: i64) -> Result<(), StoreError> {
            down()
        }
        async fn cancel_user_club(&self, _: i64) -> Result<u64, StoreError> {
            down()
        }
        async fn user_plan_status(&self, _: i64) -> Result<Option<PlanStatus>, StoreError> {
            down()
        }
        async fn user(&self, _: &str) -> Result<User, StoreError> {
            down()
        }
    }

    const POLICY: RetryPolicy = RetryPolicy {
        max_redeliveries: 3,
        base_delay: Duration::from_millis(1),
    };

    async fn setup(kind: EventKind, store: Arc<dyn Store>) -> (MemoryBroker, ConsumerProcessor, Arc<PipelineMetrics>) {
        let broker = MemoryBroker::new();
        let queue = kind.queue_name();
        broker
            .declare_queues(&[queue, dlq_queue_name(queue).as_str()])
            .await
            .unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let gateway: Arc<dyn BrokerGateway> = Arc::new(broker.clone());
        let processor = ConsumerProcessor::new(
            kind,
            Services::new(store, metrics.clone()),
            DeadLetterQueue::new(gateway),
            metrics.clone(),
            POLICY,
        );
        (broker, processor, metrics)
    }

    fn user_body(email: &str) -> Bytes {
        let user = User {
            id: None,
            name: "Ann".to_string(),
            email: email.to_string(),
            active: true,
        };
        Bytes::from(Envelope::new(EventKind::CreateUser, &user).unwrap().encode().unwrap())
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_redeliveries: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(6), Duration::from_millis(3200));
        assert_eq!(policy.backoff(40), Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_success_then_duplicate_both_ack() {
        let store = Arc::new(MemoryStore::new());
        let (broker, processor, metrics) = setup(EventKind::CreateUser, store.clone()).await;
        broker.publish("users", user_body("ann@example.com")).await.unwrap();
        broker.publish("users", user_body("ann@example.com")).await.unwrap();

        let mut sub = broker.consume("users").await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(processor.process(first).await, DeliveryOutcome::Acked);
        let second = sub.next().await.unwrap();
        assert_eq!(processor.process(second).await, DeliveryOutcome::Duplicate);

        assert_eq!(store.user_count(), 1);
        assert_eq!(broker.ready_len("users"), 0);
        assert_eq!(broker.unacked_len("users"), 0);
        let snap = metrics.snapshot();
        assert_eq!((snap.acked, snap.duplicates), (1, 1));
    }

    #[tokio::test]
    async fn test_malformed_body_is_dead_lettered_after_max_redeliveries() {
        let (broker, processor, _) = setup(EventKind::CreateUser, Arc::new(MemoryStore::new())).await;
        broker.publish("users", Bytes::from_static(b"not json")).await.unwrap();
        let mut sub = broker.consume("users").await.unwrap();

        for attempt in 1..POLICY.max_redeliveries {
            let delivery = sub.next().await.unwrap();
            assert_eq!(delivery.attempt(), attempt);
            assert_eq!(processor.process(delivery).await, DeliveryOutcome::Requeued);
        }
        let last = sub.next().await.unwrap();
        assert_eq!(processor.process(last).await, DeliveryOutcome::DeadLettered);

        assert_eq!(broker.ready_len("users"), 0);
        let dead = broker.peek("users_dlq");
        assert_eq!(dead.len(), 1);
        let failed: FailedEnvelope = serde_json::from_slice(&dead[0]).unwrap();
        assert_eq!(failed.body, "not json");
        assert_eq!(failed.attempts, POLICY.max_redeliveries);
    }

    #[tokio::test]
    async fn test_wrong_queue_is_rejected() {
        let (_, processor, _) = setup(EventKind::CreateClub, Arc::new(MemoryStore::new())).await;
        let err = processor.apply(&user_body("ann@example.com")).await.unwrap_err();
        assert!(matches!(err, ConsumerError::WrongQueue { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_past_limit() {
        let (broker, processor, metrics) = setup(EventKind::CreateUser, Arc::new(DownStore)).await;
        broker.publish("users", user_body("ann@example.com")).await.unwrap();
        let mut sub = broker.consume("users").await.unwrap();

        for _ in 0..POLICY.max_redeliveries + 2 {
            let delivery = sub.next().await.unwrap();
            assert_eq!(processor.process(delivery).await, DeliveryOutcome::Requeued);
        }
        assert_eq!(broker.ready_len("users"), 1);
        assert!(broker.peek("users_dlq").is_empty());
        assert_eq!(metrics.snapshot().requeued, u64::from(POLICY.max_redeliveries) + 2);
    }

    #[tokio::test]
    async fn test_run_ends_when_broker_closes() {
        let (broker, processor, _) = setup(EventKind::CreateUser, Arc::new(MemoryStore::new())).await;
        broker.publish("users", user_body("a@example.com")).await.unwrap();
        broker.publish("users", user_body("b@example.com")).await.unwrap();

        let sub = broker.consume("users").await.unwrap();
        let handle = tokio::spawn(processor.run(sub));
        while broker.ready_len("users") > 0 || broker.unacked_len("users") > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broker.close().await;

        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.acked, 2);
        assert_eq!(report.total(), 2);
    }
}
