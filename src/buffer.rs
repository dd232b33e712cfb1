//! Bounded hand-off between request handling and the publisher pool.
//!
//! The [`IngestionBuffer`] is a FIFO of fixed capacity. Producers (HTTP
//! handlers) await [`IngestionBuffer::enqueue`], which suspends while the
//! buffer is full; that suspension is the only backpressure in the system.
//! Consumers (publisher workers) share the receiving half and each call to
//! [`IngestionBuffer::dequeue`] hands one envelope to exactly one worker.
//!
//! [`IngestionBuffer::close`] stops new envelopes from being accepted but
//! leaves already buffered ones in place: `dequeue` keeps returning them and
//! only yields `None` once the buffer is both closed and empty. Producers
//! still waiting for a slot when the buffer closes get their envelope back
//! as [`BufferError::Closed`].

use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::envelope::Envelope;

/// Default buffer depth before producers block.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum BufferError {
    /// The buffer was closed; the envelope is handed back
    #[error("ingestion buffer is closed")]
    Closed(Envelope),

    /// Non-blocking insert found no free slot
    #[error("ingestion buffer is full")]
    Full(Envelope),
}

impl BufferError {
    /// Recover the envelope that could not be buffered.
    pub fn into_envelope(self) -> Envelope {
        match self {
            BufferError::Closed(e) | BufferError::Full(e) => e,
        }
    }
}

/// Multi-producer, multi-consumer bounded envelope queue.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct IngestionBuffer {
    /// `None` once closed.
    sender: Arc<StdMutex<Option<mpsc::Sender<Envelope>>>>,
    receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    /// Flips to `true` on close and wakes producers waiting for a slot.
    closed: watch::Sender<bool>,
    capacity: usize,
}

impl IngestionBuffer {
    /// Create a buffer holding at most `capacity` envelopes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self {
            sender: Arc::new(StdMutex::new(Some(tx))),
            receiver: Arc::new(Mutex::new(rx)),
            closed,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self) -> Option<mpsc::Sender<Envelope>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of envelopes currently buffered.
    pub fn len(&self) -> usize {
        match self.sender() {
            Some(tx) => self.capacity - tx.capacity(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Append an envelope, waiting for a free slot while the buffer is full.
    ///
    /// Gives the envelope back as [`BufferError::Closed`] if the buffer is
    /// closed before a slot frees up.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), BufferError> {
        let mut closed = self.closed.subscribe();
        let Some(tx) = self.sender() else {
            return Err(BufferError::Closed(envelope));
        };
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(BufferError::Closed(envelope)),
            permit = tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(envelope);
                    Ok(())
                }
                Err(_) => Err(BufferError::Closed(envelope)),
            },
        }
    }

    /// Append an envelope only if a slot is free right now.
    pub fn try_enqueue(&self, envelope: Envelope) -> Result<(), BufferError> {
        let Some(tx) = self.sender() else {
            return Err(BufferError::Closed(envelope));
        };
        tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(envelope) => BufferError::Full(envelope),
            mpsc::error::TrySendError::Closed(envelope) => BufferError::Closed(envelope),
        })
    }

    /// Take the oldest envelope, waiting while the buffer is empty.
    ///
    /// Returns `None` once the buffer is closed and fully drained.
    pub async fn dequeue(&self) -> Option<Envelope> {
        let mut rx = self.receiver.lock().await;
        let envelope = rx.recv().await;
        if envelope.is_none() {
            debug!("Ingestion buffer drained");
        }
        envelope
    }

    /// Stop accepting envelopes. Already buffered envelopes stay available.
    pub fn close(&self) {
        let taken = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.closed.send_replace(true);
        if let Some(tx) = taken {
            info!(
                buffered = self.capacity - tx.capacity(),
                "Ingestion buffer closed"
            );
        }
    }
}
