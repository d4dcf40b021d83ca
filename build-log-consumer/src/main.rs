use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use build_log_consumer::config::Config;
use build_log_consumer::kafka::GroupConsumer;
use build_log_consumer::metrics_server::{serve, setup_metrics_routes};
use build_log_consumer::pipeline::Pipeline;
use build_log_consumer::processor::EventProcessor;
use build_log_consumer::stores::deployment::PostgresDeploymentStore;
use build_log_consumer::stores::log_sink::build_log_sink;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "build log consumer"
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router)?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server on {} failed: {}", bind, e);
        }
    }))
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler, only ctrl-c will stop the consumer: {}",
                e
            );
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting build log consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    config.validate()?;

    info!(
        "Consuming {} as group {} from {}",
        config.kafka_consumer_topic, config.kafka_consumer_group, config.kafka_hosts
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the deployments database")?;

    let log_sink = build_log_sink(&config, &pool).await?;
    let deployments = Arc::new(PostgresDeploymentStore::new(
        pool.clone(),
        config.status_write_policy,
    ));
    let processor = EventProcessor::new(deployments, log_sink);

    let consumer = GroupConsumer::new(&config.group_consumer_config())
        .context("Failed to create Kafka consumer")?;

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let pipeline = Pipeline::new(
        consumer,
        processor,
        config.worker_pool_size,
        config.shutdown_timeout(),
    );
    pipeline.run_until(shutdown_signal()).await;

    server_handle.abort();
    pool.close().await;
    info!("Build log consumer stopped");

    Ok(())
}
