use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

/// `version` 形如 `v1`
pub async fn schema_handler(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let version: u32 = version
        .strip_prefix('v')
        .and_then(|n| n.parse().ok())
        .ok_or(ApiError::NotFound)?;
    let path = state.schema.path_for_version(version);
    debug!(path = %path.display(), version, "读取Schema文件");

    match tokio::fs::read(&path).await {
        Ok(contents) => Ok(([(header::CONTENT_TYPE, "application/xml")], contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::Internal(format!(
            "读取Schema文件 {} 失败: {e}",
            path.display()
        ))),
    }
}
