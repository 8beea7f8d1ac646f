use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let total = state.sandboxes.len().await as u64;
    let running = state.sandboxes.running_count().await as u64;
    let metrics = state.metrics.snapshot();

    let status = if metrics.errors.store == 0 && metrics.errors.websocket == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sandboxes: metrics::SandboxHealth { total, running },
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness check: returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, http::StatusCode, routing::get};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_sandboxes() {
        let (state, _runtime, _tmp) = crate::test_helpers::test_app_state();
        state.sandboxes.get_or_create("p1").await;
        state.metrics.connection_opened();

        let app = Router::new()
            .route("/health", get(health_handler))
            .with_state(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let health: metrics::HealthStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.sandboxes.total, 1);
        assert_eq!(health.sandboxes.running, 0);
        assert_eq!(health.connections, 1);
    }

    #[tokio::test]
    async fn test_degraded_after_store_error() {
        let (state, _runtime, _tmp) = crate::test_helpers::test_app_state();
        state.metrics.store_error();

        let app = Router::new()
            .route("/health", get(health_handler))
            .with_state(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let health: metrics::HealthStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "degraded");
    }
}
