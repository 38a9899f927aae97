use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use gateway_config::SchemaConfig;
use gateway_domain::EventKind;
use gateway_infrastructure::{Gateway, PublisherHandle};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::handlers::{
    events::publish_event, health::health_check, metrics::metrics_handler, root::root_handler,
    schema::schema_handler,
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub publishers: Arc<HashMap<EventKind, PublisherHandle>>,
    pub schema: SchemaConfig,
    /// `None` 表示未启用 Prometheus 导出
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        gateway: Gateway,
        publishers: HashMap<EventKind, PublisherHandle>,
        schema: SchemaConfig,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            gateway,
            publishers: Arc::new(publishers),
            schema,
            prometheus,
        }
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/schema/{version}/clustercode.xsd", get(schema_handler))
        .route("/api/v1/events/{kind}", post(publish_event))
        .with_state(state)
}
