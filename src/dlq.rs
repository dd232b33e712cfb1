//! Dead-letter path for deliveries that will never succeed.
//!
//! A delivery that keeps failing business checks (or cannot be decoded at
//! all) is wrapped in a [`FailedEnvelope`] and published to the queue's
//! companion `<queue>_dlq`. The original delivery is only acknowledged once
//! that publish went through.
//!
//! ```rust,ignore
//! let dlq = DeadLetterQueue::new(gateway.clone());
//! dlq.add("discount_club_signup", delivery.body(), "user 7 is not active", 5).await?;
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::broker::{BrokerError, BrokerGateway};
use crate::envelope::EventKind;

/// Suffix appended to a queue name to form its dead-letter queue.
pub const DLQ_SUFFIX: &str = "_dlq";

pub fn dlq_queue_name(queue: &str) -> String {
    format!("{}{}", queue, DLQ_SUFFIX)
}

/// A dead-lettered delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEnvelope {
    /// Queue the delivery came from
    pub queue: String,

    /// Event kind served by that queue, if it is one of ours
    pub kind: Option<EventKind>,

    /// Original message body, lossily decoded as UTF-8
    pub body: String,

    /// Error from the last attempt
    pub error: String,

    pub attempts: u32,

    /// RFC 3339 timestamp
    pub failed_at: String,
}

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dead-letter publish failed: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    gateway: Arc<dyn BrokerGateway>,
}

impl DeadLetterQueue {
    pub fn new(gateway: Arc<dyn BrokerGateway>) -> Self {
        Self { gateway }
    }

    /// Publish a failed delivery to `<queue>_dlq`.
    pub async fn add(&self, queue: &str, body: &[u8], error: &str, attempts: u32) -> Result<FailedEnvelope, DlqError> {
        let failed = FailedEnvelope {
            queue: queue.to_string(),
            kind: EventKind::from_queue(queue),
            body: String::from_utf8_lossy(body).into_owned(),
            error: error.to_string(),
            attempts,
            failed_at: chrono::Utc::now().to_rfc3339(),
        };
        let document = serde_json::to_vec(&failed)?;
        let target = dlq_queue_name(queue);

        if let Err(e) = self.gateway.publish(&target, Bytes::from(document)).await {
            error!(queue = %queue, error = %e, "Failed to dead-letter delivery");
            return Err(e.into());
        }

        info!(
            queue = %queue,
            dlq = %target,
            attempts = attempts,
            reason = %error,
            "Delivery moved to dead-letter queue"
        );
        Ok(failed)
    }
}
