use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use gateway_config::WireFormat;
use gateway_domain::EventKind;
use gateway_errors::GatewayError;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

/// 解码、校验事件并交给对应的发布者
///
/// 没有 Content-Type 时按 XML 处理。
pub async fn publish_event(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let kind: EventKind = kind.parse().map_err(|_| ApiError::NotFound)?;
    let format = match headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        None => WireFormat::Xml,
        Some(content_type) => WireFormat::from_content_type(content_type)
            .ok_or_else(|| ApiError::UnsupportedMediaType(content_type.to_string()))?,
    };

    let raw = std::str::from_utf8(&body)
        .map_err(|e| GatewayError::decode(format!("payload is not valid UTF-8: {e}")))?;
    let event = state
        .gateway
        .codec()
        .decode(format, kind, raw)
        .inspect_err(|e| warn!(event = %kind, error = %e, "拒绝无效事件"))?;

    let publisher = state
        .publishers
        .get(&kind)
        .ok_or_else(|| ApiError::Unavailable(format!("{kind} 没有可用的发布者")))?;
    let job_id = event.job_id().to_string();
    publisher.send(event).await?;

    info!(event = %kind, job_id = %job_id, "事件已提交");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "event": kind.slug(),
            "job_id": job_id,
        })),
    ))
}
