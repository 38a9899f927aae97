//! # Gateway API
//!
//! 网关的 HTTP 面：健康检查、Prometheus 指标、Schema 文件下载，
//! 以及把外部提交的事件转发到对应发布者的入口。
//!
//! ## API 端点
//!
//! - `GET /` 占位页
//! - `GET /health` 健康检查，包含消息代理连接状态
//! - `GET /metrics` Prometheus 文本格式指标（`prometheus.enabled` 关闭时为 404）
//! - `GET /schema/v{version}/clustercode.xsd` 按版本下载 Schema
//! - `POST /api/v1/events/{kind}` 提交 XML 或 JSON 事件

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建带中间件的完整应用
pub fn create_app(state: AppState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
