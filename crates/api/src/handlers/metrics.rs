use axum::{extract::State, http::header, response::IntoResponse};

use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

pub async fn metrics_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let handle = state.prometheus.as_ref().ok_or(ApiError::NotFound)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}
