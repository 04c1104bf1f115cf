//! Health and metrics endpoints for container orchestration

use super::{with_state, AppState};
use crate::ingestion::IngestionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use warp::http::StatusCode;
use warp::Filter;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentCheck {
    pub status: &'static str,
    pub message: String,
}

impl ComponentCheck {
    fn healthy<S: Into<String>>(message: S) -> Self {
        Self {
            status: "healthy",
            message: message.into(),
        }
    }

    fn unhealthy<S: Into<String>>(message: S) -> Self {
        Self {
            status: "unhealthy",
            message: message.into(),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub ingestion_state: IngestionState,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub checks: BTreeMap<&'static str, ComponentCheck>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: DateTime<Utc>,
}

/// Overall health is driven by the ingestion loop. The liveness monitor and
/// observers are reported but never make the service unhealthy.
pub fn health_report(state: &AppState) -> HealthReport {
    let ingestion_state = *state.ingestion.borrow();
    let snapshot = state.metrics.snapshot();
    let mut checks = BTreeMap::new();

    let ingestion = if ingestion_state == IngestionState::Consuming {
        ComponentCheck::healthy("Consuming telemetry")
    } else {
        ComponentCheck::unhealthy(format!("Ingestion loop is {ingestion_state:?}"))
    };
    let overall = ingestion.is_healthy();
    checks.insert("ingestion", ingestion);

    checks.insert(
        "liveness",
        if snapshot.liveness.running {
            ComponentCheck::healthy(format!("{} ticks completed", snapshot.liveness.ticks))
        } else {
            ComponentCheck::unhealthy("Liveness monitor not running")
        },
    );

    checks.insert(
        "observers",
        ComponentCheck::healthy(format!(
            "{} active connections",
            state.registry.connection_count()
        )),
    );

    HealthReport {
        status: if overall { "healthy" } else { "degraded" },
        ingestion_state,
        timestamp: Utc::now(),
        uptime_seconds: snapshot.uptime_seconds,
        checks,
    }
}

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    // GET /health - component checks, 503 unless consuming
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: AppState| {
            let report = health_report(&state);
            let code = if report.is_healthy() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&report), code)
        });

    // GET /ready - readiness probe
    let ready = warp::path!("ready")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: AppState| {
            let ready = *state.ingestion.borrow() == IngestionState::Consuming;
            let code = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(
                warp::reply::json(&ReadinessResponse {
                    ready,
                    timestamp: Utc::now(),
                }),
                code,
            )
        });

    // GET /live - liveness probe
    let live = warp::path!("live").and(warp::get()).map(|| {
        warp::reply::json(&LivenessResponse {
            alive: true,
            timestamp: Utc::now(),
        })
    });

    // GET /metrics - counter snapshot
    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .map(|state: AppState| warp::reply::json(&state.metrics.snapshot()));

    health.or(ready).or(live).or(metrics)
}
