//! Redis Streams broker gateway.
//!
//! Each queue is a stream named `clubrelay:queue:<queue>` read through a
//! consumer group, so a message stays in the group's pending list until it is
//! acknowledged.
//!
//! | Gateway op | Redis |
//! |---|---|
//! | declare | `XGROUP CREATE <stream> <group> 0 MKSTREAM` (BUSYGROUP is fine) |
//! | publish | `XADD <stream> * body <bytes> attempt 1` |
//! | consume | `XAUTOCLAIM` idle entries, requeue own pending (`0`), then read `>` |
//! | ack | `XACK` + `XDEL` |
//! | nack(requeue) | `MULTI`: `XADD` with `attempt + 1`, `XACK` + `XDEL` of the old id |
//!
//! Pending entries found when a subscription starts were delivered to a
//! consumer that never settled them. They are requeued like a nack, so the
//! redelivery carries `attempt + 1` and counts toward the redelivery limit.
//!
//! Publishes take a pooled connection per call, so concurrent publisher
//! workers never share a connection.

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, pipe, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Acker, BrokerError, BrokerGateway, Delivery, Subscription};

/// Prefix for stream keys.
pub const STREAM_PREFIX: &str = "clubrelay:queue:";

/// How long a blocking read waits before re-checking for shutdown.
const READ_BLOCK_MS: usize = 1000;

/// Pending entries idle longer than this are claimed from dead consumers.
const PENDING_IDLE_THRESHOLD_MS: u64 = 30000;

/// Pending entries requeued per read while recovering.
const RECOVER_BATCH: usize = 100;

/// Pause after a failed read before trying again.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Stream key for a queue name.
pub fn stream_key(queue: &str) -> String {
    format!("{}{}", STREAM_PREFIX, queue)
}

/// Broker gateway over Redis Streams.
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    group: String,
    consumer: String,
    closed: watch::Sender<bool>,
}

impl RedisBroker {
    /// Create the connection pool and verify the server answers.
    pub async fn connect(
        url: &str,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (closed, _) = watch::channel(false);
        let broker = Self {
            pool,
            group: group.into(),
            consumer: consumer.into(),
            closed,
        };
        info!(
            group = %broker.group,
            consumer = %broker.consumer,
            "Connected to Redis broker"
        );
        Ok(broker)
    }

    /// Requeue every entry pending for this consumer with `attempt + 1`.
    async fn recover_pending(&self, conn: &mut Connection, stream: &str) -> Result<usize, BrokerError> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(RECOVER_BATCH);
        let mut recovered = 0;
        loop {
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[stream], &["0"], &opts)
                .await
                .map_err(|e| BrokerError::Command(e.to_string()))?;
            let entries: Vec<StreamId> = reply
                .into_iter()
                .flat_map(|r| r.keys)
                .flat_map(|k| k.ids)
                .collect();
            if entries.is_empty() {
                return Ok(recovered);
            }

            for entry in entries {
                match entry.get::<Vec<u8>>("body") {
                    Some(body) => {
                        let attempt = entry_attempt(&entry) + 1;
                        requeue(conn, stream, &self.group, &entry.id, &body, attempt).await?;
                        debug!(stream = %stream, id = %entry.id, attempt = attempt, "Pending entry requeued");
                        recovered += 1;
                    }
                    None => {
                        // Acked elsewhere and deleted, only the pending slot is left.
                        warn!(stream = %stream, id = %entry.id, "Dropping pending entry without body");
                        xack_del(conn, stream, &self.group, &entry.id).await?;
                    }
                }
            }
        }
    }

    async fn conn(&self) -> Result<Connection, BrokerError> {
        if *self.closed.borrow() {
            return Err(BrokerError::Closed);
        }
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

async fn xadd(conn: &mut Connection, stream: &str, body: &[u8], attempt: u32) -> Result<String, BrokerError> {
    cmd("XADD")
        .arg(stream)
        .arg("*")
        .arg("body")
        .arg(body.to_vec())
        .arg("attempt")
        .arg(attempt)
        .query_async(conn)
        .await
        .map_err(|e| BrokerError::Command(e.to_string()))
}

/// Atomically re-add an entry with `attempt` and drop the old id.
async fn requeue(
    conn: &mut Connection,
    stream: &str,
    group: &str,
    id: &str,
    body: &[u8],
    attempt: u32,
) -> Result<(), BrokerError> {
    let _: () = pipe()
        .atomic()
        .cmd("XADD")
        .arg(stream)
        .arg("*")
        .arg("body")
        .arg(body)
        .arg("attempt")
        .arg(attempt)
        .ignore()
        .cmd("XACK")
        .arg(stream)
        .arg(group)
        .arg(id)
        .ignore()
        .cmd("XDEL")
        .arg(stream)
        .arg(id)
        .ignore()
        .query_async(conn)
        .await
        .map_err(|e| BrokerError::Command(e.to_string()))?;
    Ok(())
}

fn entry_attempt(entry: &StreamId) -> u32 {
    entry.get("attempt").unwrap_or(1)
}

async fn xack_del(conn: &mut Connection, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
    let _: u64 = cmd("XACK")
        .arg(stream)
        .arg(group)
        .arg(id)
        .query_async(&mut *conn)
        .await
        .map_err(|e| BrokerError::Command(e.to_string()))?;
    let _: u64 = cmd("XDEL")
        .arg(stream)
        .arg(id)
        .query_async(&mut *conn)
        .await
        .map_err(|e| BrokerError::Command(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl BrokerGateway for RedisBroker {
    async fn declare_queues(&self, names: &[&str]) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        for name in names {
            let stream = stream_key(name);
            let created: Result<(), _> = cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match created {
                Ok(()) => info!(queue = %name, stream = %stream, "Queue declared"),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(queue = %name, "Queue already declared")
                }
                Err(e) => {
                    error!(queue = %name, error = %e, "Failed to declare queue");
                    return Err(BrokerError::Command(e.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let id = xadd(&mut conn, &stream_key(queue), &body, 1).await?;
        debug!(queue = %queue, id = %id, "Message published");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let stream = stream_key(queue);
        let mut conn = self.conn().await?;

        // Take over entries abandoned by consumers that died mid-delivery.
        let claimed: Result<RedisValue, _> = cmd("XAUTOCLAIM")
            .arg(&stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(PENDING_IDLE_THRESHOLD_MS)
            .arg("0-0")
            .arg("COUNT")
            .arg(100)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await;
        if let Err(e) = claimed {
            debug!(queue = %queue, error = %e, "XAUTOCLAIM failed, skipping abandoned entries");
        }

        let recovered = self.recover_pending(&mut conn, &stream).await?;
        info!(queue = %queue, consumer = %self.consumer, recovered = recovered, "Consuming queue");
        Ok(Box::new(RedisSubscription {
            pool: self.pool.clone(),
            queue: queue.to_string(),
            stream,
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            closed: self.closed.subscribe(),
        }))
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.pool.close();
        info!("Broker connection closed");
    }
}

struct RedisSubscription {
    pool: Pool,
    queue: String,
    stream: String,
    group: String,
    consumer: String,
    closed: watch::Receiver<bool>,
}

impl RedisSubscription {
    fn delivery(&self, entry: StreamId) -> Result<Delivery, String> {
        let body: Vec<u8> = entry.get("body").ok_or_else(|| entry.id.clone())?;
        let attempt = entry_attempt(&entry);
        Ok(Delivery::new(
            self.queue.clone(),
            Bytes::from(body),
            attempt,
            Box::new(RedisAcker {
                pool: self.pool.clone(),
                stream: self.stream.clone(),
                group: self.group.clone(),
                id: entry.id,
            }),
        ))
    }

    async fn read(&self, conn: &mut Connection) -> Result<Option<StreamReadReply>, String> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(READ_BLOCK_MS);
        conn.xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if *self.closed.borrow() {
                return None;
            }

            let mut conn = match self.pool.get().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Failed to get Redis connection");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };

            let mut closed = self.closed.clone();
            let result = tokio::select! {
                _ = closed.changed() => return None,
                result = self.read(&mut conn) => result,
            };

            match result {
                Ok(reply) => {
                    let entry = reply
                        .into_iter()
                        .flat_map(|r| r.keys)
                        .flat_map(|k| k.ids)
                        .next();
                    match entry {
                        Some(entry) => match self.delivery(entry) {
                            Ok(delivery) => return Some(delivery),
                            Err(id) => {
                                // Pending entry whose fields were already deleted.
                                warn!(queue = %self.queue, id = %id, "Dropping entry without body");
                                if let Err(e) = xack_del(&mut conn, &self.stream, &self.group, &id).await {
                                    warn!(queue = %self.queue, error = %e, "Failed to drop empty entry");
                                }
                            }
                        },
                        None => {}
                    }
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Stream read error");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
    }
}

struct RedisAcker {
    pool: Pool,
    stream: String,
    group: String,
    id: String,
}

impl RedisAcker {
    async fn conn(&self) -> Result<Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        xack_del(&mut conn, &self.stream, &self.group, &self.id).await
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        if requeue {
            let entries: Vec<(String, Vec<(String, Vec<u8>)>)> = cmd("XRANGE")
                .arg(&self.stream)
                .arg(&self.id)
                .arg(&self.id)
                .query_async(&mut conn)
                .await
                .map_err(|e| BrokerError::Command(e.to_string()))?;

            let Some((_, fields)) = entries.into_iter().next() else {
                return Err(BrokerError::Command(format!("entry {} vanished", self.id)));
            };
            let field = |name: &str| {
                fields
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.clone())
            };
            let body = field("body").unwrap_or_default();
            let attempt = field("attempt")
                .and_then(|raw| String::from_utf8(raw).ok())
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(1);

            return self::requeue(&mut conn, &self.stream, &self.group, &self.id, &body, attempt + 1).await;
        }
        xack_del(&mut conn, &self.stream, &self.group, &self.id).await
    }
}
