use std::time;

use chrono::Utc;
use identity_common::metrics_consts::QUEUE_DEPTH;
use identity_common::queue::{EventQueue, QueueError, QueueStats};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::health::HealthHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JanitorReport {
    pub retried: usize,
    pub reclaimed: usize,
    pub stats: QueueStats,
}

/// Periodic queue maintenance: re-enqueues failed events whose retry time has
/// come, hands back events held by dead workers and reports queue depth.
pub struct Janitor {
    queue: EventQueue,
    interval: time::Duration,
    liveness: HealthHandle,
}

impl Janitor {
    pub fn new(queue: EventQueue, interval: time::Duration, liveness: HealthHandle) -> Self {
        Self {
            queue,
            interval,
            liveness,
        }
    }

    pub async fn run_once(&self) -> Result<JanitorReport, QueueError> {
        let now = Utc::now();
        let retried = self.queue.retry_due(now).await?;
        let reclaimed = self.queue.reclaim_expired(now).await?;
        let stats = self.queue.stats().await?;

        metrics::gauge!(QUEUE_DEPTH, "list" => "pending").set(stats.pending as f64);
        metrics::gauge!(QUEUE_DEPTH, "list" => "processing").set(stats.processing as f64);
        metrics::gauge!(QUEUE_DEPTH, "list" => "failed").set(stats.failed as f64);

        Ok(JanitorReport {
            retried,
            reclaimed,
            stats,
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.run_once().await {
                Ok(report) => {
                    self.liveness.report_healthy().await;
                    if report.retried > 0 || report.reclaimed > 0 {
                        info!(
                            retried = report.retried,
                            reclaimed = report.reclaimed,
                            "janitor requeued events"
                        );
                    }
                }
                Err(e) => error!("janitor run failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use common_redis::MockRedisClient;
    use identity_common::retry::RetryPolicy;
    use serde_json::json;

    use crate::health::HealthRegistry;

    async fn janitor(queue: EventQueue) -> Janitor {
        let liveness = HealthRegistry::new("liveness")
            .register("janitor".to_string(), ::time::Duration::seconds(30))
            .await;
        Janitor::new(queue, time::Duration::from_millis(10), liveness)
    }

    fn queue(client: &MockRedisClient, visibility_timeout: time::Duration) -> EventQueue {
        let policy = RetryPolicy::build(1, time::Duration::ZERO)
            .max_attempts(3)
            .provide();
        EventQueue::new(Arc::new(client.clone()), "events", policy)
            .with_visibility_timeout(visibility_timeout)
    }

    #[tokio::test]
    async fn test_run_once_retries_due_failures() {
        let client = MockRedisClient::new();
        let queue = queue(&client, time::Duration::from_secs(300));
        queue.enqueue("T1", "visit", json!({})).await.unwrap();
        let dequeued = queue
            .dequeue(time::Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        queue.fail(&dequeued, "boom").await.unwrap();

        let report = janitor(queue).await.run_once().await.unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.stats.pending, 1);
        assert_eq!(report.stats.failed, 0);
    }

    #[tokio::test]
    async fn test_run_once_reclaims_expired_leases() {
        let client = MockRedisClient::new();
        let queue = queue(&client, time::Duration::ZERO);
        queue.enqueue("T1", "visit", json!({})).await.unwrap();
        queue
            .dequeue(time::Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(time::Duration::from_millis(5)).await;

        let report = janitor(queue).await.run_once().await.unwrap();

        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.stats.pending, 1);
        assert_eq!(report.stats.processing, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let client = MockRedisClient::new();
        let janitor = janitor(queue(&client, time::Duration::from_secs(300))).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        janitor.run(shutdown).await;
    }
}
