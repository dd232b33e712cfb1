//! HTTP surface.
//!
//! Write endpoints validate the body, wrap it in an envelope and enqueue it;
//! nothing is persisted on the request path. Read endpoints query the store
//! through the services.
//!
//! | Route | Effect |
//! |---|---|
//! | `POST /contrate/discount-club` | enqueue `create_discount_club`, 201 |
//! | `POST /contrate/discount-club/user` | enqueue `users`, 200 |
//! | `POST /contrate/discount-club/signup` | enqueue `discount_club_signup`, 201 |
//! | `POST /user/cancel/club` | enqueue a cancelling `discount_club_signup`, 202 |
//! | `POST /user/state` | `{email, state}` |
//! | `POST /user/plan/status` | `{email, status, plan}` |
//! | `GET /health` | liveness |
//! | `GET /metrics` | [`MetricsSnapshot`](crate::telemetry::MetricsSnapshot) |

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferError, IngestionBuffer};
use crate::domain::{
    Club, ClubRequest, EmailRequest, SignupAction, SignupRequest, User, UserRequest, ValidationError,
};
use crate::envelope::{CodecError, Envelope, EventKind};
use crate::services::{ServiceError, Services};
use crate::shutdown::ShutdownSignal;
use crate::store::StoreError;
use crate::telemetry::{Metric, PipelineMetrics, Telemetry};

#[derive(Clone)]
pub struct AppState {
    pub buffer: IngestionBuffer,
    pub services: Services,
    pub metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("service is shutting down")]
    Unavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<CodecError> for ApiError {
    fn from(e: CodecError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<BufferError> for ApiError {
    fn from(_: BufferError) -> Self {
        ApiError::Unavailable
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Store(StoreError::NotFound(what)) => ApiError::NotFound(format!("{} not found", what)),
            ServiceError::Store(StoreError::Unavailable(_)) => ApiError::Unavailable,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/contrate/discount-club", post(create_club))
        .route("/contrate/discount-club/user", post(create_user))
        .route("/contrate/discount-club/signup", post(club_signup))
        .route("/user/cancel/club", post(cancel_club))
        .route("/user/state", post(user_state))
        .route("/user/plan/status", post(plan_status))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), track_request))
        .with_state(state)
}

/// Serve the app until `shutdown` fires.
///
/// In-flight requests then get at most [`ShutdownSignal::timeout`] to
/// finish before the server is dropped.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: ShutdownSignal) -> std::io::Result<()> {
    let graceful = shutdown.clone();
    let server = axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { graceful.recv().await })
        .into_future();
    tokio::pin!(server);

    let deadline = async {
        shutdown.recv().await;
        tokio::time::sleep(shutdown.timeout()).await;
    };
    tokio::select! {
        result = &mut server => result,
        _ = deadline => {
            warn!(
                timeout_ms = shutdown.timeout().as_millis() as u64,
                "HTTP server did not drain before the deadline, dropping open requests"
            );
            Ok(())
        }
    }
}

async fn track_request(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    state.metrics.record(Metric::HttpRequest { status });
    info!(
        method = %method,
        path = %path,
        status = status,
        latency_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );
    response
}

/// Hand an envelope to the pipeline.
async fn accept(state: &AppState, envelope: Envelope) -> Result<(), ApiError> {
    let kind = envelope.kind();
    if let Err(e) = state.buffer.enqueue(envelope).await {
        warn!(kind = %kind, "Rejecting envelope, ingestion buffer closed");
        return Err(e.into());
    }
    state.metrics.record(Metric::EnvelopeAccepted(kind));
    debug!(kind = %kind, "Envelope accepted");
    Ok(())
}

fn accepted(kind: EventKind) -> Json<Value> {
    Json(json!({ "status": "accepted", "type": kind.wire_tag() }))
}

async fn create_club(
    State(state): State<AppState>,
    body: Result<Json<ClubRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body?;
    let club = Club::try_from(request)?;
    accept(&state, Envelope::new(EventKind::CreateClub, &club)?).await?;
    Ok((StatusCode::CREATED, accepted(EventKind::CreateClub)))
}

async fn create_user(
    State(state): State<AppState>,
    body: Result<Json<UserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body?;
    let user = User::try_from(request)?;
    accept(&state, Envelope::new(EventKind::CreateUser, &user)?).await?;
    Ok((StatusCode::OK, accepted(EventKind::CreateUser)))
}

async fn club_signup(
    State(state): State<AppState>,
    body: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body?;
    let signup = request.into_payload(SignupAction::Signup)?;
    accept(&state, Envelope::new(EventKind::ClubSignup, &signup)?).await?;
    Ok((StatusCode::CREATED, accepted(EventKind::ClubSignup)))
}

async fn cancel_club(
    State(state): State<AppState>,
    body: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body?;
    let cancel = request.into_payload(SignupAction::Cancel)?;
    accept(&state, Envelope::new(EventKind::ClubSignup, &cancel)?).await?;
    Ok((StatusCode::ACCEPTED, accepted(EventKind::ClubSignup)))
}

async fn user_state(
    State(state): State<AppState>,
    body: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(EmailRequest { email }) = body?;
    if email.trim().is_empty() {
        return Err(ApiError::BadRequest("email must not be empty".to_string()));
    }
    let active = state.services.users.state(&email).await?;
    Ok(Json(json!({ "email": email, "state": active })))
}

async fn plan_status(
    State(state): State<AppState>,
    body: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(EmailRequest { email }) = body?;
    if email.trim().is_empty() {
        return Err(ApiError::BadRequest("email must not be empty".to_string()));
    }
    let response = match state.services.signups.plan_status(&email).await? {
        Some(status) => json!({ "email": email, "status": status.active, "plan": status.plan }),
        None => json!({ "email": email, "status": false, "plan": null }),
    };
    Ok(Json(response))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.buffer.is_closed() {
        error!("Health check while shutting down");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ok",
        "buffered": state.buffer.len(),
        "capacity": state.buffer.capacity(),
    })))
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "metrics": state.metrics.snapshot(),
    }))
}
