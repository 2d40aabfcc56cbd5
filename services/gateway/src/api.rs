//! HTTP surface wiring the pool to callers
//!
//! Thin glue only: handlers parse the request, run the pool's retry loop with
//! the upstream client as the unit of work, and shape the outcome into JSON.
//! All failure policy lives in the keypool crate.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::Secret;
use futures_util::stream::BoxStream;
use keypool::{Error as PoolError, KeyPool, LeasedKey, WorkError};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{info, warn};

use crate::metrics;
use crate::upstream::GeminiClient;

/// Where generation requests get their key from.
///
/// `Single` is the fallback path when pooling is disabled: one fixed key,
/// no retry, no cooldown tracking.
pub enum KeySource {
    Pool(Arc<KeyPool>),
    Single(Secret<String>),
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub keys: Arc<KeySource>,
    pub client: Arc<GeminiClient>,
    pub prometheus: PrometheusHandle,
}

#[derive(Debug, Deserialize)]
pub struct GenerateParams {
    pub prompt: String,
}

enum GenError {
    /// Retry budget consumed; surfaced as 503.
    Exhausted(PoolError),
    /// Single-key mode upstream failure; surfaced as 502.
    Upstream(WorkError),
}

/// JSON error response: {"error":{"type":...,"message":...,"request_id":...}}
fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

async fn run_generation(state: &AppState, prompt: &str) -> Result<String, GenError> {
    match state.keys.as_ref() {
        KeySource::Pool(pool) => {
            let client = state.client.clone();
            let prompt = prompt.to_owned();
            pool.generate_with_retry(move |lease| {
                let client = client.clone();
                let prompt = prompt.clone();
                async move { client.generate(&lease, &prompt).await }
            })
            .await
            .map_err(GenError::Exhausted)
        }
        KeySource::Single(key) => {
            let lease = LeasedKey {
                id: key.masked(),
                key: key.clone(),
            };
            state
                .client
                .generate(&lease, prompt)
                .await
                .map_err(GenError::Upstream)
        }
    }
}

async fn run_stream(
    state: &AppState,
    prompt: &str,
) -> Result<BoxStream<'static, reqwest::Result<Bytes>>, GenError> {
    match state.keys.as_ref() {
        KeySource::Pool(pool) => {
            let client = state.client.clone();
            let prompt = prompt.to_owned();
            pool.generate_stream_with_retry(move |lease| {
                let client = client.clone();
                let prompt = prompt.clone();
                async move { client.open_stream(&lease, &prompt).await }
            })
            .await
            .map_err(GenError::Exhausted)
        }
        KeySource::Single(key) => {
            let lease = LeasedKey {
                id: key.masked(),
                key: key.clone(),
            };
            state
                .client
                .open_stream(&lease, prompt)
                .await
                .map_err(GenError::Upstream)
        }
    }
}

fn generation_error_response(err: GenError, request_id: &str) -> Response {
    match err {
        GenError::Exhausted(e) => {
            warn!(request_id, error = %e, "generation failed, pool exhausted");
            metrics::record_generation("exhausted", 0.0);
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "pool_exhausted",
                &e.to_string(),
                request_id,
            )
        }
        GenError::Upstream(e) => {
            warn!(request_id, error = %e, "generation failed in single-key mode");
            metrics::record_generation("upstream_error", 0.0);
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &e.to_string(),
                request_id,
            )
        }
    }
}

/// POST /api/generate — one blocking completion.
pub async fn generate(State(state): State<AppState>, Json(params): Json<GenerateParams>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();

    match run_generation(&state, &params.prompt).await {
        Ok(text) => {
            let elapsed = started.elapsed().as_secs_f64();
            info!(request_id, elapsed_secs = elapsed, "generation complete");
            metrics::record_generation("success", elapsed);
            Json(serde_json::json!({
                "text": text,
                "request_id": request_id,
            }))
            .into_response()
        }
        Err(err) => generation_error_response(err, &request_id),
    }
}

/// POST /api/generate/stream — streaming completion, SSE passthrough.
///
/// Retry/failover applies only to opening the stream; once bytes are flowing
/// they are forwarded verbatim and a mid-stream fault ends the response.
pub async fn generate_stream(
    State(state): State<AppState>,
    Json(params): Json<GenerateParams>,
) -> Response {
    let request_id = new_request_id();

    match run_stream(&state, &params.prompt).await {
        Ok(stream) => {
            info!(request_id, "stream opened");
            metrics::record_generation("stream_opened", 0.0);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => generation_error_response(err, &request_id),
    }
}

/// GET /api/pool/status — monitoring snapshot with derived capacity figures.
pub async fn pool_status(State(state): State<AppState>) -> Response {
    match state.keys.as_ref() {
        KeySource::Pool(pool) => {
            let status = pool.status().await;
            let config = pool.config();
            let capacity =
                status.total as u64 * u64::from(config.max_requests_per_window);
            Json(serde_json::json!({
                "success": true,
                "pool_status": status,
                "performance": {
                    "total_capacity": format!(
                        "{capacity} requests per {}s window",
                        config.window_duration.as_secs()
                    ),
                    "current_availability": format!("{} keys available", status.available),
                    "rate_limited": format!("{} keys cooling down", status.cooling_down),
                },
            }))
            .into_response()
        }
        KeySource::Single(_) => Json(serde_json::json!({
            "success": true,
            "pool_status": {
                "status": "single_key",
                "available_keys": 1,
            },
        }))
        .into_response(),
    }
}

/// GET /health — pool-aware health for load balancers.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.keys.as_ref() {
        KeySource::Pool(pool) => {
            let status = pool.status().await;
            Json(serde_json::json!({
                "status": status.health_label(),
                "keys_total": status.total,
                "keys_available": status.available,
                "keys_cooling_down": status.cooling_down,
            }))
            .into_response()
        }
        KeySource::Single(_) => Json(serde_json::json!({
            "status": "healthy",
            "mode": "single_key",
        }))
        .into_response(),
    }
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn error_response_shape() {
        let resp = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "pool_exhausted",
            "pool exhausted after 3 attempts: quota",
            "req_abc",
        );
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }
}
