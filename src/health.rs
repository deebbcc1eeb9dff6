use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub algorithm: String,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub backend: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Reports store reachability. An unreachable store degrades the service but
/// requests keep flowing under the failure policy.
pub struct HealthChecker {
    store: Arc<dyn StateStore>,
    backend: &'static str,
    algorithm: &'static str,
    timeout: Duration,
    started: Instant,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn StateStore>,
        backend: &'static str,
        algorithm: &'static str,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            algorithm,
            timeout,
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub async fn check_health(&self) -> HealthStatus {
        let store_status = self.check_store().await;

        let overall_status = if store_status.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime().as_secs(),
            algorithm: self.algorithm.to_string(),
            dependencies: DependencyStatus {
                store: store_status,
            },
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.store.ping()).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("no answer within {:?}", self.timeout)),
        };

        ServiceStatus {
            status: if error.is_none() { "healthy" } else { "unavailable" }.to_string(),
            backend: self.backend.to_string(),
            response_time_ms,
            error,
        }
    }
}
