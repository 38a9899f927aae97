use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gateway_errors::GatewayError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("网关错误: {0}")]
    Gateway(#[from] GatewayError),

    #[error("未找到资源")]
    NotFound,

    #[error("不支持的内容类型: {0}")]
    UnsupportedMediaType(String),

    #[error("服务不可用: {0}")]
    Unavailable(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Gateway(
                GatewayError::Validation(_) | GatewayError::Decode(_) | GatewayError::Encode(_),
            ) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(GatewayError::Publish(_) | GatewayError::Connection(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Gateway(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_message, error_type, suggestions) = match &self {
            ApiError::Gateway(err) if status == StatusCode::BAD_REQUEST => (
                format!("事件无效: {err}"),
                "INVALID_EVENT".to_string(),
                vec![
                    "XML 事件需符合 GET /schema/v1/clustercode.xsd".to_string(),
                    "JSON 事件需包含 job_id 等必填字段".to_string(),
                ],
            ),
            ApiError::Gateway(err) if status == StatusCode::SERVICE_UNAVAILABLE => (
                format!("消息代理不可用: {err}"),
                "BROKER_UNAVAILABLE".to_string(),
                vec!["查看 GET /health 检查消息代理连接".to_string()],
            ),
            ApiError::Gateway(err) => (
                "系统内部错误".to_string(),
                "INTERNAL_ERROR".to_string(),
                vec![format!("错误详情: {err}")],
            ),
            ApiError::NotFound => (
                "请求的资源不存在".to_string(),
                "NOT_FOUND".to_string(),
                vec!["请检查请求URL是否正确".to_string()],
            ),
            ApiError::UnsupportedMediaType(content_type) => (
                format!("不支持的内容类型: {content_type}"),
                "UNSUPPORTED_MEDIA_TYPE".to_string(),
                vec!["Content-Type 应为 application/xml 或 application/json".to_string()],
            ),
            ApiError::Unavailable(msg) => (
                format!("服务不可用: {msg}"),
                "SERVICE_UNAVAILABLE".to_string(),
                vec!["查看 GET /health 检查系统状态".to_string()],
            ),
            ApiError::Internal(msg) => (
                "系统内部错误".to_string(),
                "INTERNAL_ERROR".to_string(),
                vec![format!("错误详情: {msg}")],
            ),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16(),
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}
