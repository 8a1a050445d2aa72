use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::observability::metrics::LatencyTimer;

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        let unhealthy = dependencies.iter().filter(|d| d.status.is_unhealthy()).count();

        if unhealthy == 0 {
            HealthStatus::Healthy
        } else if unhealthy < dependencies.len() {
            // One backing store down still leaves the other usable.
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Health checker for the engine's backing stores. A store outage is what
/// turns requests into 503s under fail-closed, so it is the thing worth
/// watching.
pub struct HealthChecker {
    pool: Option<PgPool>,
    redis_client: Option<redis::Client>,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(pool: Option<PgPool>, redis_client: Option<redis::Client>) -> Self {
        Self {
            pool,
            redis_client,
            start_time: std::time::Instant::now(),
        }
    }

    pub async fn check_database(&self) -> Option<DependencyHealth> {
        let pool = self.pool.as_ref()?;
        let timer = LatencyTimer::new();

        let health = match sqlx::query("SELECT 1").fetch_one(pool).await {
            Ok(_) => DependencyHealth::healthy("postgres", timer.elapsed_ms()),
            Err(e) => DependencyHealth::unhealthy("postgres", e.to_string()),
        };
        Some(health)
    }

    pub async fn check_redis(&self) -> Option<DependencyHealth> {
        let client = self.redis_client.as_ref()?;
        let timer = LatencyTimer::new();

        let health = match client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                let ping: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                match ping {
                    Ok(_) => DependencyHealth::healthy("redis", timer.elapsed_ms()),
                    Err(e) => DependencyHealth::unhealthy("redis", e.to_string()),
                }
            }
            Err(e) => DependencyHealth::unhealthy("redis", e.to_string()),
        };
        Some(health)
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        let mut dependencies = Vec::new();
        if let Some(db) = self.check_database().await {
            dependencies.push(db);
        }
        if let Some(redis) = self.check_redis().await {
            dependencies.push(redis);
        }

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.start_time.elapsed().as_secs(),
            dependencies,
        )
    }
}
