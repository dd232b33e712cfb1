//! # clubrelay
//!
//! Asynchronous relay for discount-club registrations.
//!
//! ## Architecture
//!
//! ```text
//! HTTP ──enqueue──▶ IngestionBuffer ──▶ PublisherPool ──▶ broker queues ──▶ ConsumerProcessors ──▶ Store
//!                                                                │
//!                                                                └──(exhausted)──▶ <queue>_dlq
//! ```
//!
//! Requests are validated and acknowledged immediately; persistence happens
//! later, once per message, with at-least-once delivery. Duplicate writes are
//! detected by the store's uniqueness rules and treated as success.
//!
//! ## Modules
//!
//! - [`envelope`]: event kinds, envelope wire format, decoded [`Event`]s
//! - [`domain`]: clubs, users, signups and request validation
//! - [`buffer`]: bounded ingestion buffer
//! - [`publisher`]: supervised publisher pool
//! - [`broker`]: broker gateway trait with memory and Redis Streams gateways
//! - [`consumer`]: per-queue consumer processors
//! - [`dlq`]: dead-letter queue
//! - [`store`]: persistence trait with memory and Redis stores
//! - [`services`]: business operations
//! - [`lifecycle`]: pipeline startup and shutdown
//! - [`http`]: axum routes

pub mod broker;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod domain;
pub mod envelope;
pub mod http;
pub mod lifecycle;
pub mod publisher;
pub mod services;
pub mod shutdown;
pub mod store;
pub mod telemetry;

pub use broker::{BrokerGateway, MemoryBroker, RedisBroker};
pub use buffer::IngestionBuffer;
pub use config::ClubRelayConfig;
pub use envelope::{Envelope, Event, EventKind};
pub use lifecycle::{Pipeline, ShutdownReport, StartupError};
pub use shutdown::ShutdownSignal;
pub use store::{MemoryStore, RedisStore, Store};
pub use telemetry::{Metric, NoopTelemetry, PipelineMetrics, Telemetry};
