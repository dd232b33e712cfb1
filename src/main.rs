//! clubrelay server.
//!
//! ## Configuration
//!
//! - `CLUBRELAY_CONFIG`: path to the TOML config (default `config/clubrelay.toml`)
//! - `RUST_LOG`: log filter, overrides `logging.level`
//! - any `${VAR}` referenced from the config file, e.g. `REDIS_URL`

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clubrelay::broker::{BrokerGateway, MemoryBroker, RedisBroker};
use clubrelay::config::{Backend, BrokerConfig, ClubRelayConfig, LogFormat, LoggingConfig, StoreConfig};
use clubrelay::http::{serve, AppState};
use clubrelay::lifecycle::{Pipeline, StartupError};
use clubrelay::shutdown::ShutdownSignal;
use clubrelay::store::{MemoryStore, RedisStore, Store};
use clubrelay::telemetry::PipelineMetrics;

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn BrokerGateway>, StartupError> {
    match config.backend {
        Backend::Memory => {
            info!("Using in-memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        Backend::Redis => {
            let broker = RedisBroker::connect(&config.url, &config.consumer_group, config.consumer_name())
                .await
                .map_err(|e| StartupError::Connect {
                    component: "broker",
                    reason: e.to_string(),
                })?;
            Ok(Arc::new(broker))
        }
    }
}

async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn Store>, StartupError> {
    match config.backend {
        Backend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Backend::Redis => {
            let store = RedisStore::connect(&config.url).await.map_err(|e| StartupError::Connect {
                component: "store",
                reason: e.to_string(),
            })?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = ClubRelayConfig::load()?;
    init_logging(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "clubrelay starting");

    let shutdown = ShutdownSignal::with_timeout(config.server.shutdown_timeout());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;

    let gateway = connect_broker(&config.broker).await?;
    let store = connect_store(&config.store).await?;
    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline = Pipeline::start(
        &config.pipeline,
        gateway,
        store,
        metrics.clone(),
        shutdown.clone(),
    )
    .await?;

    let state = AppState {
        buffer: pipeline.buffer().clone(),
        services: pipeline.services().clone(),
        metrics,
    };

    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait().await });

    info!(addr = %addr, "clubrelay listening");
    serve(listener, state, shutdown.clone()).await?;

    let report = pipeline.shutdown(shutdown.timeout()).await;
    info!(
        published = report.pool.as_ref().map_or(0, |p| p.published),
        consumers = report.consumers.len(),
        timed_out = report.timed_out,
        "clubrelay stopped"
    );
    Ok(())
}
