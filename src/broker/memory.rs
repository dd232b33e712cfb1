//! In-process broker gateway.
//!
//! Models the acknowledgement semantics of a real broker closely enough to
//! test the pipeline's failure paths:
//!
//! - every delivery sits in an *unacked* set until settled
//! - `nack(requeue = true)` puts the message at the back of its queue
//! - dropping a [`Subscription`] or closing the broker returns that
//!   consumer's unacked messages to the front of their queues

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{Acker, BrokerError, BrokerGateway, Delivery, Subscription};

#[derive(Debug, Clone)]
struct Message {
    body: Bytes,
    /// Times this message has been handed to a consumer.
    deliveries: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, (u64, Message)>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    closed: bool,
    next_tag: u64,
    next_consumer: u64,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState, BrokerError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    /// Return a consumer's unacked messages to the front of their queues.
    fn recover(&mut self, consumer: Option<u64>) -> usize {
        let mut recovered = 0;
        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| consumer.map_or(true, |c| c == *owner))
                .map(|(tag, _)| *tag)
                .collect();
            // Highest tag first so the oldest delivery ends up at the very front.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some((_, message)) = queue.unacked.remove(&tag) {
                    queue.ready.push_front(message);
                    recovered += 1;
                }
            }
        }
        recovered
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Broker gateway backed by process memory. Clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the ready messages, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<Bytes> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerGateway for MemoryBroker {
    async fn declare_queues(&self, names: &[&str]) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        for name in names {
            state.queues.entry((*name).to_string()).or_default();
            info!(queue = %name, "Queue declared");
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.queue_mut(queue)?.ready.push_back(Message {
                body,
                deliveries: 0,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.queue_mut(queue)?;
        state.next_consumer += 1;
        let consumer = state.next_consumer;
        debug!(queue = %queue, consumer = consumer, "Consumer registered");

        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            consumer,
        }))
    }

    async fn close(&self) {
        let recovered = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.recover(None)
        };
        self.inner.notify.notify_waiters();
        info!(requeued = recovered, "Broker connection closed");
    }
}

enum Take {
    Delivery(Delivery),
    Empty,
    Closed,
}

struct MemorySubscription {
    inner: Arc<Inner>,
    queue: String,
    consumer: u64,
}

impl MemorySubscription {
    fn try_take(&self) -> Take {
        let mut state = self.inner.lock();
        if state.closed {
            return Take::Closed;
        }
        state.next_tag += 1;
        let tag = state.next_tag;
        let Ok(queue) = state.queue_mut(&self.queue) else {
            return Take::Closed;
        };
        let Some(mut message) = queue.ready.pop_front() else {
            return Take::Empty;
        };
        message.deliveries += 1;
        let attempt = message.deliveries;
        let body = message.body.clone();
        queue.unacked.insert(tag, (self.consumer, message));

        Take::Delivery(Delivery::new(
            self.queue.clone(),
            body,
            attempt,
            Box::new(MemoryAcker {
                inner: self.inner.clone(),
                queue: self.queue.clone(),
                tag,
            }),
        ))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Take::Delivery(delivery) => return Some(delivery),
                Take::Closed => return None,
                Take::Empty => notified.await,
            }
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let recovered = self.inner.lock().recover(Some(self.consumer));
        if recovered > 0 {
            debug!(
                queue = %self.queue,
                consumer = self.consumer,
                requeued = recovered,
                "Consumer dropped with unacked deliveries"
            );
            self.inner.notify.notify_waiters();
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(self, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let queue = state.queue_mut(&self.queue)?;
            let (_, message) = queue.unacked.remove(&self.tag).ok_or_else(|| {
                BrokerError::Command(format!("unknown delivery tag {}", self.tag))
            })?;
            if !requeue {
                return Ok(());
            }
            queue.ready.push_back(message);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)
    }
}
