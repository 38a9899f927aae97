use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Map, Value};

use crate::routes::AppState;

/// 消息代理断开时返回 503，负载均衡据此摘除实例
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let connected = state.gateway.is_connected();
    let publishers: Map<String, Value> = state
        .publishers
        .iter()
        .map(|(kind, handle)| (kind.slug().to_string(), Value::Bool(!handle.is_closed())))
        .collect();

    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if connected { "ok" } else { "degraded" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "clustercode-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "broker": {
                "target": state.gateway.connection().target(),
                "connected": connected,
            },
            "publishers": publishers,
        })),
    )
}
