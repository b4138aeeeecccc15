//! Metrics Route
//!
//! - GET /metrics - Prometheus text exposition of hub metrics

use axum::{extract::State, http::header, response::IntoResponse};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

/// GET /metrics
///
/// 503 when no Prometheus recorder was installed at startup.
pub async fn prometheus(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let handle = state.metrics.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("metrics recorder is not installed".to_string())
    })?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}
