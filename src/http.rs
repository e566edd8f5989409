//! HTTP server implementation.
//!
//! Core endpoints only. Domain crates merge their own read routes into this router.

use axum::{extract::State, response::Json, routing::get, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::etl::engine::SyncStatus;

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    pub version: String,
    pub startup_time: i64,
    pub sync_status: watch::Receiver<SyncStatus>,
}

impl HttpState {
    pub fn new(sync_status: watch::Receiver<SyncStatus>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            startup_time: chrono::Utc::now().timestamp(),
            sync_status,
        }
    }
}

/// Health check response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` while the current block keeps failing.
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub sync: SyncStatus,
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    let now = chrono::Utc::now().timestamp();
    let uptime = now - state.startup_time;
    let sync = state.sync_status.borrow().clone();

    let status = if sync.consecutive_failures > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime_seconds: uptime,
        sync,
    })
}

/// Create the core HTTP router with basic endpoints.
pub fn create_http_router(sync_status: watch::Receiver<SyncStatus>) -> Router {
    let state = Arc::new(HttpState::new(sync_status));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::engine::SyncState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_health(app: Router) -> HealthResponse {
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (tx, rx) = watch::channel(SyncStatus::default());
        tx.send_modify(|s| {
            s.state = SyncState::Waiting;
            s.cursor = Some(12);
        });

        let health = get_health(create_http_router(rx)).await;

        assert_eq!(health.status, "healthy");
        assert!(health.uptime_seconds >= 0);
        assert_eq!(health.sync.state, SyncState::Waiting);
        assert_eq!(health.sync.cursor, Some(12));
    }

    #[tokio::test]
    async fn test_health_reports_failing_blocks() {
        let (tx, rx) = watch::channel(SyncStatus::default());
        tx.send_modify(|s| {
            s.consecutive_failures = 3;
            s.last_error = Some("store write failed".to_string());
        });

        let health = get_health(create_http_router(rx)).await;

        assert_eq!(health.status, "degraded");
        assert_eq!(health.sync.last_error.as_deref(), Some("store write failed"));
    }
}
