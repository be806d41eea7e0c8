//! Consume queued customer events and resolve them to profiles.
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use common_redis::{Client, RedisClient};
use envconfig::Envconfig;
use identity_common::idempotency::IdempotencyGuard;
use identity_common::lock::RedisLockService;
use identity_common::queue::EventQueue;
use identity_common::store::PgProfileStore;
use identity_worker::config::Config;
use identity_worker::health::HealthRegistry;
use identity_worker::ingestion::IngestionService;
use identity_worker::janitor::Janitor;
use identity_worker::merge::MergeEngine;
use identity_worker::publisher::{EventPublisher, NoopPublisher, RedisStreamPublisher};
use identity_worker::serve_metrics::{serve, setup_metrics_routes};
use identity_worker::worker::IngestionWorker;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "identity worker"
}

fn queue(config: &Config, client: Arc<dyn Client + Send + Sync>) -> EventQueue {
    EventQueue::new(
        client,
        config.queue_prefix.as_str(),
        config.retry_policy.provide(),
    )
    .with_visibility_timeout(config.visibility_timeout.0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("invalid configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    sqlx::migrate!("../identity-common/migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    let store = Arc::new(PgProfileStore::new(pool));

    // Shared by everything that does not block on the server.
    let redis: Arc<dyn Client + Send + Sync> = Arc::new(
        RedisClient::with_config(
            config.redis_url.clone(),
            Some(config.redis_response_timeout.0),
            Some(config.redis_connection_timeout.0),
        )
        .await
        .context("failed to connect to redis")?,
    );

    let publisher: Arc<dyn EventPublisher> = if config.publish_streams {
        Arc::new(RedisStreamPublisher::new(
            redis.clone(),
            config.stream_max_len,
            config.merge_stream_max_len,
        ))
    } else {
        Arc::new(NoopPublisher)
    };
    let merger = MergeEngine::new(
        store.clone(),
        Arc::new(RedisLockService::new(redis.clone(), config.merge_lock_ttl())),
        config.merge_config(),
    );
    let service = Arc::new(IngestionService::new(
        store,
        merger,
        IdempotencyGuard::new(redis.clone(), config.idempotency_ttl()),
        publisher,
    ));

    let liveness = HealthRegistry::new("liveness");
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::with_capacity(config.worker_count + 1);

    // A worker's deadline must outlast one blocking dequeue plus a backoff.
    let worker_deadline = time::Duration::try_from(
        config.dequeue_timeout.0 + config.error_backoff.0 + std::time::Duration::from_secs(30),
    )
    .context("worker deadline out of range")?;

    for index in 0..config.worker_count {
        let name = format!("{}-{}", config.worker_name, index);
        // Blocking pops hold their connection, so each worker gets its own.
        let client = RedisClient::new(config.redis_url.clone())
            .await
            .context("failed to connect to redis")?;
        let worker = IngestionWorker::new(
            &name,
            queue(&config, Arc::new(client)),
            service.clone(),
            config.dequeue_timeout.0,
            config.error_backoff.0,
            config.failure_threshold,
            liveness.register(name.clone(), worker_deadline).await,
        );
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    let janitor_deadline = time::Duration::try_from(config.janitor_interval.0 * 3)
        .context("janitor deadline out of range")?;
    let janitor = Janitor::new(
        queue(&config, redis),
        config.janitor_interval.0,
        liveness.register("janitor".to_string(), janitor_deadline).await,
    );
    tasks.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move { janitor.run(shutdown).await }
    }));

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || {
                let liveness = liveness.clone();
                async move { liveness.get_status().await }
            }),
        );
    let router = setup_metrics_routes(router).context("failed to install metrics recorder")?;
    let bind = config.bind();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = serve(router, &bind, shutdown).await {
                error!("failed to serve metrics: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down...");
    shutdown.cancel();

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("task panicked: {}", e);
        }
    }
    server.await.context("metrics server panicked")?;

    Ok(())
}
