//! Liveness reporting for the worker's long-running loops.
//!
//! Every loop registers a component and must report healthy more often than
//! its deadline. The process is healthy only while every component is: one
//! that never reported, reported unhealthy or missed its deadline fails the
//! probe and gets the pod restarted.
use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Must report again before this instant.
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Missed its reporting deadline.
    Stalled,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        self.components
            .write()
            .await
            .insert(self.component.clone(), status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component that must report at least once every `deadline`.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        self.components
            .write()
            .await
            .insert(component.clone(), ComponentStatus::Starting);

        HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let mut components = self.components.read().await.clone();

        for status in components.values_mut() {
            if matches!(status, ComponentStatus::HealthyUntil(until) if *until <= now) {
                *status = ComponentStatus::Stalled;
            }
        }

        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));
        if !healthy {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");

        assert!(!registry.get_status().await.healthy);
    }

    #[tokio::test]
    async fn test_all_components_must_report() {
        let registry = HealthRegistry::new("liveness");
        let worker = registry
            .register("worker-0".to_string(), Duration::seconds(30))
            .await;
        let janitor = registry
            .register("janitor".to_string(), Duration::seconds(30))
            .await;

        let status = registry.get_status().await;
        assert!(!status.healthy);
        assert_eq!(status.components["janitor"], ComponentStatus::Starting);

        worker.report_healthy().await;
        assert!(!registry.get_status().await.healthy);

        janitor.report_healthy().await;
        assert!(registry.get_status().await.healthy);

        janitor.report_status(ComponentStatus::Unhealthy).await;
        assert!(!registry.get_status().await.healthy);
    }

    #[tokio::test]
    async fn test_missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let worker = registry
            .register("worker-0".to_string(), Duration::seconds(30))
            .await;

        worker
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc() - Duration::seconds(1),
            ))
            .await;

        let status = registry.get_status().await;
        assert!(!status.healthy);
        assert_eq!(status.components["worker-0"], ComponentStatus::Stalled);
    }

    #[tokio::test]
    async fn test_status_code_follows_health() {
        let healthy = HealthStatus {
            healthy: true,
            components: HashMap::new(),
        };

        assert_eq!(healthy.into_response().status(), StatusCode::OK);
        assert_eq!(
            HealthStatus::default().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
