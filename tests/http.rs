//! HTTP surface driven over a real socket.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use clubrelay::broker::{BrokerError, BrokerGateway, MemoryBroker, Subscription};
use clubrelay::config::PipelineConfig;
use clubrelay::http::{app, serve, AppState};
use clubrelay::lifecycle::Pipeline;
use clubrelay::shutdown::ShutdownSignal;
use clubrelay::store::MemoryStore;
use clubrelay::telemetry::PipelineMetrics;

struct Server {
    base: String,
    client: reqwest::Client,
    state: AppState,
    store: Arc<MemoryStore>,
    pipeline: Pipeline,
}

impl Server {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let config = PipelineConfig {
            retry_base_delay_ms: 5,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::start(
            &config,
            Arc::new(MemoryBroker::new()),
            store.clone(),
            metrics.clone(),
            ShutdownSignal::new(),
        )
        .await
        .unwrap();

        let state = AppState {
            buffer: pipeline.buffer().clone(),
            services: pipeline.services().clone(),
            metrics,
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state.clone());
        tokio::spawn(async move { axum::serve(listener, router).await });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            state,
            store,
            pipeline,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn wait_for(&self, what: &str, check: impl Fn(&MemoryStore) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check(&self.store) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn gold_club() -> Value {
    json!({
        "name": "Gold",
        "description": "weekly discounts",
        "acquisitionChannel": "online",
        "acquisitionLocation": "website",
        "planType": "premium"
    })
}

#[tokio::test]
async fn club_user_signup_flow() {
    let server = Server::start().await;

    let (status, body) = server.post("/contrate/discount-club", gold_club()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["type"], "create_discount_club");

    let (status, _) = server
        .post(
            "/contrate/discount-club/user",
            json!({ "name": "Ann Smith", "email": "ann@example.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    server
        .wait_for("club and user", |s| s.club_count() == 1 && s.user_count() == 1)
        .await;

    let (status, body) = server.post("/user/state", json!({ "email": "ann@example.com" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "email": "ann@example.com", "state": true }));

    let (status, _) = server
        .post(
            "/contrate/discount-club/signup",
            json!({ "email": "ann@example.com", "clubName": "Gold" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    server.wait_for("signup", |s| s.user_club_count() == 1).await;

    let (status, body) = server
        .post("/user/plan/status", json!({ "email": "ann@example.com" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], true);
    assert_eq!(body["plan"], "premium");

    let (status, _) = server
        .post("/user/cancel/club", json!({ "email": "ann@example.com" }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (_, body) = server
            .post("/user/plan/status", json!({ "email": "ann@example.com" }))
            .await;
        if body["status"] == false {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cancel never applied");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    server.pipeline.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_the_pipeline() {
    let server = Server::start().await;

    let mut club = gold_club();
    club["planType"] = json!("gold");
    let (status, body) = server.post("/contrate/discount-club", club).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("plan type"));

    let (status, _) = server
        .post("/contrate/discount-club/user", json!({ "name": "Al", "email": "al@example.com" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .post("/contrate/discount-club/signup", json!({ "email": "al@example.com" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = server
        .client
        .post(format!("{}/contrate/discount-club", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let metrics: Value = server
        .client
        .get(format!("{}/metrics", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["metrics"]["http_client_errors"], 4);
    assert_eq!(metrics["metrics"]["accepted"]["create_discount_club"], 0);

    server.pipeline.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn unknown_user_reads_are_not_found() {
    let server = Server::start().await;

    let (status, body) = server.post("/user/state", json!({ "email": "ghost@example.com" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = server
        .post("/user/plan/status", json!({ "email": "ghost@example.com" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.pipeline.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn closed_buffer_answers_503() {
    let server = Server::start().await;
    let health = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    server.state.buffer.close();
    let (status, _) = server.post("/contrate/discount-club", gold_club()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    server.pipeline.shutdown(Duration::from_secs(2)).await;
}

/// Every publish hangs for `stall` and then fails.
struct StalledBroker {
    inner: MemoryBroker,
    stall: Duration,
}

#[async_trait]
impl BrokerGateway for StalledBroker {
    async fn declare_queues(&self, names: &[&str]) -> Result<(), BrokerError> {
        self.inner.declare_queues(names).await
    }

    async fn publish(&self, _: &str, _: Bytes) -> Result<(), BrokerError> {
        tokio::time::sleep(self.stall).await;
        Err(BrokerError::Connection("broker unreachable".to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.inner.consume(queue).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn publisher_giving_up_stops_server_and_pipeline() {
    let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(1));
    let config = PipelineConfig {
        capacity: 1,
        pool_size: 1,
        max_worker_restarts: 0,
        retry_base_delay_ms: 5,
        ..PipelineConfig::default()
    };
    let broker = StalledBroker {
        inner: MemoryBroker::new(),
        stall: Duration::from_millis(500),
    };
    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline = Pipeline::start(
        &config,
        Arc::new(broker),
        Arc::new(MemoryStore::new()),
        metrics.clone(),
        shutdown.clone(),
    )
    .await
    .unwrap();

    let state = AppState {
        buffer: pipeline.buffer().clone(),
        services: pipeline.services().clone(),
        metrics,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/contrate/discount-club", listener.local_addr().unwrap());
    let server = tokio::spawn(serve(listener, state, shutdown.clone()));

    // One envelope in flight, one buffered, one producer parked on the full buffer.
    let client = reqwest::Client::new();
    let posts: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            let url = url.clone();
            let mut club = gold_club();
            club["name"] = json!(format!("Club {}", i));
            tokio::spawn(async move { client.post(url).json(&club).send().await.map(|r| r.status()) })
        })
        .collect();

    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        server.await.unwrap().unwrap();
        pipeline.shutdown(shutdown.timeout()).await
    })
    .await;
    let report = stopped.expect("server and pipeline should stop once the publisher gives up");

    assert!(shutdown.is_shutdown());
    assert_eq!(report.pool.map(|pool| (pool.published, pool.failed_workers)), Some((0, 1)));

    let mut statuses = Vec::new();
    for post in posts {
        statuses.push(post.await.unwrap().unwrap());
    }
    assert!(
        statuses
            .iter()
            .all(|s| *s == StatusCode::CREATED || *s == StatusCode::SERVICE_UNAVAILABLE),
        "{:?}",
        statuses
    );
    assert!(statuses.contains(&StatusCode::SERVICE_UNAVAILABLE), "{:?}", statuses);
}
