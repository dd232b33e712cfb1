//! Observability capability.
//!
//! Components never reach for global tracer or meter state. They receive an
//! `Arc<dyn Telemetry>` at construction and report [`Metric`]s through it.
//! [`PipelineMetrics`] keeps process-local counters that `GET /metrics`
//! exposes; [`NoopTelemetry`] discards everything.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::consumer::DeliveryOutcome;
use crate::domain::PlanType;
use crate::envelope::EventKind;

/// A single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    HttpRequest { status: u16 },
    EnvelopeAccepted(EventKind),
    EnvelopePublished(EventKind),
    PublishFailed(EventKind),
    Delivery { kind: EventKind, outcome: DeliveryOutcome },
    /// A user joined a club plan: active gauge +1, new-plan counter +1.
    PlanSignup(PlanType),
    /// Links deactivated by a cancellation: active gauge -n.
    PlanCancelled { links: u64 },
}

pub trait Telemetry: Send + Sync {
    fn record(&self, metric: Metric);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record(&self, _metric: Metric) {}
}

fn kind_index(kind: EventKind) -> usize {
    match kind {
        EventKind::CreateClub => 0,
        EventKind::CreateUser => 1,
        EventKind::ClubSignup => 2,
    }
}

#[derive(Debug, Default)]
struct PerKind([AtomicU64; 3]);

impl PerKind {
    fn incr(&self, kind: EventKind) {
        self.0[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, kind: EventKind) -> u64 {
        self.0[kind_index(kind)].load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        EventKind::ALL
            .iter()
            .map(|kind| (kind.wire_tag(), self.get(*kind)))
            .collect()
    }
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    http_requests: AtomicU64,
    http_client_errors: AtomicU64,
    http_server_errors: AtomicU64,
    accepted: PerKind,
    published: PerKind,
    publish_failures: PerKind,
    acked: AtomicU64,
    duplicates: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    active_plans: AtomicI64,
    new_plans_basic: AtomicU64,
    new_plans_premium: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub http_requests: u64,
    pub http_client_errors: u64,
    pub http_server_errors: u64,
    pub accepted: BTreeMap<&'static str, u64>,
    pub published: BTreeMap<&'static str, u64>,
    pub publish_failures: BTreeMap<&'static str, u64>,
    pub acked: u64,
    pub duplicates: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub active_plans: i64,
    pub new_plans: BTreeMap<String, u64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let new_plans = [
            (PlanType::Basic, &self.new_plans_basic),
            (PlanType::Premium, &self.new_plans_premium),
        ]
        .into_iter()
        .map(|(plan, counter)| (plan.to_string(), load(counter)))
        .collect();

        MetricsSnapshot {
            http_requests: load(&self.http_requests),
            http_client_errors: load(&self.http_client_errors),
            http_server_errors: load(&self.http_server_errors),
            accepted: self.accepted.snapshot(),
            published: self.published.snapshot(),
            publish_failures: self.publish_failures.snapshot(),
            acked: load(&self.acked),
            duplicates: load(&self.duplicates),
            requeued: load(&self.requeued),
            dead_lettered: load(&self.dead_lettered),
            active_plans: self.active_plans.load(Ordering::Relaxed),
            new_plans,
        }
    }
}

impl Telemetry for PipelineMetrics {
    fn record(&self, metric: Metric) {
        match metric {
            Metric::HttpRequest { status } => {
                self.http_requests.fetch_add(1, Ordering::Relaxed);
                match status {
                    400..=499 => self.http_client_errors.fetch_add(1, Ordering::Relaxed),
                    500..=599 => self.http_server_errors.fetch_add(1, Ordering::Relaxed),
                    _ => 0,
                };
            }
            Metric::EnvelopeAccepted(kind) => self.accepted.incr(kind),
            Metric::EnvelopePublished(kind) => self.published.incr(kind),
            Metric::PublishFailed(kind) => self.publish_failures.incr(kind),
            Metric::Delivery { outcome, .. } => {
                let counter = match outcome {
                    DeliveryOutcome::Acked => &self.acked,
                    DeliveryOutcome::Duplicate => &self.duplicates,
                    DeliveryOutcome::Requeued => &self.requeued,
                    DeliveryOutcome::DeadLettered => &self.dead_lettered,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Metric::PlanSignup(plan) => {
                self.active_plans.fetch_add(1, Ordering::Relaxed);
                match plan {
                    PlanType::Basic => self.new_plans_basic.fetch_add(1, Ordering::Relaxed),
                    PlanType::Premium => self.new_plans_premium.fetch_add(1, Ordering::Relaxed),
                };
            }
            Metric::PlanCancelled { links } => {
                self.active_plans.fetch_sub(links as i64, Ordering::Relaxed);
            }
        }
    }
}
