use std::sync::Arc;
use std::time;

use identity_common::queue::{EventQueue, FailureDisposition};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::health::{ComponentStatus, HealthHandle};
use crate::ingestion::{IngestOutcome, IngestionService};

/// What happened to the one queue item a worker handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Ingested(IngestOutcome),
    Failed(FailureDisposition),
}

/// A worker that pulls events off the queue and ingests them one at a time.
pub struct IngestionWorker {
    /// An identifier for this worker, used in logs and health checks.
    name: String,
    queue: EventQueue,
    service: Arc<IngestionService>,
    dequeue_timeout: time::Duration,
    error_backoff: time::Duration,
    /// Consecutive processing failures tolerated before backing off.
    failure_threshold: u32,
    liveness: HealthHandle,
}

impl IngestionWorker {
    pub fn new(
        name: &str,
        queue: EventQueue,
        service: Arc<IngestionService>,
        dequeue_timeout: time::Duration,
        error_backoff: time::Duration,
        failure_threshold: u32,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            service,
            dequeue_timeout,
            error_backoff,
            failure_threshold: failure_threshold.max(1),
            liveness,
        }
    }

    /// Take at most one event off the queue and ingest it. Returns `None` if
    /// nothing arrived within the dequeue timeout.
    pub async fn process_next(&self) -> Result<Option<Processed>, WorkerError> {
        let Some(dequeued) = self.queue.dequeue(self.dequeue_timeout).await? else {
            return Ok(None);
        };
        let event_id = dequeued.event.id;

        match self
            .service
            .ingest_event(dequeued.event.clone().into())
            .await
        {
            Ok(outcome) => {
                self.queue.complete(&dequeued).await?;
                debug!(worker = self.name, %event_id, "processed event");
                Ok(Some(Processed::Ingested(outcome)))
            }
            Err(e) => {
                error!(worker = self.name, %event_id, "failed to ingest event: {}", e);
                let disposition = self.queue.fail(&dequeued, &e.to_string()).await?;
                if disposition == FailureDisposition::Exhausted {
                    warn!(worker = self.name, %event_id, "event exhausted its retries");
                }
                Ok(Some(Processed::Failed(disposition)))
            }
        }
    }

    /// Process events until `shutdown` is cancelled. An in-flight event is
    /// always finished before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = self.name, "starting ingestion worker");
        let mut consecutive_failures = 0;

        self.liveness.report_healthy().await;

        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(processed) => {
                    self.liveness.report_healthy().await;
                    match processed {
                        Some(Processed::Failed(_)) => consecutive_failures += 1,
                        Some(Processed::Ingested(_)) => consecutive_failures = 0,
                        None => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(worker = self.name, "queue unavailable: {}", e);
                    self.liveness.report_healthy().await;
                    consecutive_failures = self.failure_threshold;
                }
                Err(e) => {
                    // Stays unhealthy until a later pass succeeds.
                    error!(worker = self.name, "queue error: {}", e);
                    self.liveness.report_status(ComponentStatus::Unhealthy).await;
                    consecutive_failures = self.failure_threshold;
                }
            }

            if consecutive_failures >= self.failure_threshold {
                warn!(
                    worker = self.name,
                    consecutive_failures,
                    "backing off for {:?}",
                    self.error_backoff
                );
                consecutive_failures = 0;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.error_backoff) => {}
                }
            }
        }

        info!(worker = self.name, "ingestion worker stopped");
    }
}
