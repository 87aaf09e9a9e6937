//! Liveness endpoint reporting the state of both client connections.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::metrics::Metrics;
use crate::{mongo, nats};

/// Shared state behind the HTTP handlers.
pub struct AppState {
    pub mongo: mongodb::Client,
    pub nats: nats::jetstream::Client,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
}

impl From<bool> for Status {
    fn from(healthy: bool) -> Self {
        if healthy {
            Status::Up
        } else {
            Status::Down
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: Status,
    components: Components,
}

#[derive(Debug, Serialize)]
struct Components {
    mongo: Component,
    nats: Component,
}

#[derive(Debug, Serialize)]
struct Component {
    status: Status,
}

impl HealthResponse {
    fn new(mongo_up: bool, nats_up: bool) -> Self {
        Self {
            status: (mongo_up && nats_up).into(),
            components: Components {
                mongo: Component {
                    status: mongo_up.into(),
                },
                nats: Component {
                    status: nats_up.into(),
                },
            },
        }
    }

    fn up(&self) -> bool {
        self.status == Status::Up
    }
}

/// `GET /healthz`: 200 with both components `UP`, 503 otherwise.
pub async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let mongo_up = mongo::ping(&state.mongo).await.is_ok();
    let nats_up = state.nats.ping();

    let response = HealthResponse::new(mongo_up, nats_up);
    let code = if response.up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    state
        .metrics
        .export()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
