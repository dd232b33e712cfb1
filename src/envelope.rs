//! Envelope codec for clubrelay.
//!
//! An [`Envelope`] is the unit that travels through the pipeline: it is
//! produced by the HTTP layer, parked in the ingestion buffer, published to
//! the broker and finally decoded by a consumer processor.
//!
//! On the wire an envelope is a small JSON document:
//!
//! ```json
//! {
//!   "type": "create_discount_club",
//!   "data": { "name": "Gold", "description": "desc", ... }
//! }
//! ```
//!
//! The `type` tag selects both the broker queue and the schema of `data`.
//! Inside the process the tag is the closed [`EventKind`] enumeration and the
//! decoded payload is an [`Event`], so every match over event kinds is
//! checked for exhaustiveness by the compiler.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;

use crate::domain::{Club, SignupPayload, User};

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The outer envelope is not valid JSON or misses `type`/`data`
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The `data` document does not match the schema of its kind
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    /// The payload bytes are not a JSON document
    #[error("payload is not valid JSON: {0}")]
    RawPayload(#[source] serde_json::Error),
}

/// The three event kinds relayed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "create_discount_club")]
    CreateClub,
    #[serde(rename = "users")]
    CreateUser,
    #[serde(rename = "discount_club_signup")]
    ClubSignup,
}

impl EventKind {
    /// All kinds, in queue declaration order.
    pub const ALL: [EventKind; 3] = [
        EventKind::CreateClub,
        EventKind::CreateUser,
        EventKind::ClubSignup,
    ];

    /// Broker queue that carries envelopes of this kind.
    pub fn queue_name(self) -> &'static str {
        match self {
            EventKind::CreateClub => "discount_club_create",
            EventKind::CreateUser => "users",
            EventKind::ClubSignup => "discount_club_signup",
        }
    }

    /// Tag written to the `type` field of the wire envelope.
    pub fn wire_tag(self) -> &'static str {
        match self {
            EventKind::CreateClub => "create_discount_club",
            EventKind::CreateUser => "users",
            EventKind::ClubSignup => "discount_club_signup",
        }
    }

    /// Reverse lookup of [`EventKind::queue_name`].
    pub fn from_queue(queue: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.queue_name() == queue)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_tag())
    }
}

/// An event kind tag paired with its still-encoded payload.
///
/// Envelopes are immutable once built; cloning is cheap because the payload
/// is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: EventKind,
    payload: Bytes,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: EventKind,
    data: &'a RawValue,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: EventKind,
    data: Box<RawValue>,
}

impl Envelope {
    /// Wrap a serializable payload.
    pub fn new<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self, CodecError> {
        let payload = serde_json::to_vec(payload).map_err(|source| CodecError::Payload { kind, source })?;
        Ok(Self {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Wrap payload bytes that are already JSON encoded.
    pub fn from_raw(kind: EventKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let text = std::str::from_utf8(&self.payload).map_err(|_| {
            CodecError::RawPayload(serde::de::Error::custom("payload is not UTF-8"))
        })?;
        let data: &RawValue = serde_json::from_str(text).map_err(CodecError::RawPayload)?;
        serde_json::to_vec(&WireOut {
            kind: self.kind,
            data,
        })
        .map_err(CodecError::Envelope)
    }

    /// Parse the wire format. The inner payload is kept encoded.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireIn = serde_json::from_slice(bytes).map_err(CodecError::Envelope)?;
        Ok(Self {
            kind: wire.kind,
            payload: Bytes::copy_from_slice(wire.data.get().as_bytes()),
        })
    }

    /// Decode the inner payload with the schema of this envelope's kind.
    pub fn open(&self) -> Result<Event, CodecError> {
        Event::from_envelope(self)
    }
}

/// A decoded event: one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateClub(Club),
    CreateUser(User),
    ClubSignup(SignupPayload),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::CreateClub(_) => EventKind::CreateClub,
            Event::CreateUser(_) => EventKind::CreateUser,
            Event::ClubSignup(_) => EventKind::ClubSignup,
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, CodecError> {
        let kind = envelope.kind();
        let bytes = envelope.payload();
        let wrap = |source| CodecError::Payload { kind, source };
        match kind {
            EventKind::CreateClub => serde_json::from_slice(bytes).map(Event::CreateClub).map_err(wrap),
            EventKind::CreateUser => serde_json::from_slice(bytes).map(Event::CreateUser).map_err(wrap),
            EventKind::ClubSignup => serde_json::from_slice(bytes).map(Event::ClubSignup).map_err(wrap),
        }
    }

    pub fn into_envelope(self) -> Result<Envelope, CodecError> {
        match &self {
            Event::CreateClub(club) => Envelope::new(EventKind::CreateClub, club),
            Event::CreateUser(user) => Envelope::new(EventKind::CreateUser, user),
            Event::ClubSignup(signup) => Envelope::new(EventKind::ClubSignup, signup),
        }
    }
}
