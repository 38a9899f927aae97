//! 消息代理活动计数器
//!
//! 只通过 `metrics` 门面递增，导出由二进制安装的 Prometheus recorder 负责。

use gateway_domain::CompletionDecision;
use metrics::{counter, describe_counter};

pub const MESSAGES_CONSUMED: &str = "gateway_messages_consumed_total";
pub const MESSAGES_ACKNOWLEDGED: &str = "gateway_messages_acknowledged_total";
pub const MESSAGES_INVALID: &str = "gateway_messages_invalid_total";
pub const MESSAGES_PUBLISHED: &str = "gateway_messages_published_total";
pub const PUBLISH_ERRORS: &str = "gateway_publish_errors_total";

/// 注册指标描述，安装 recorder 之后调用一次
pub fn describe_metrics() {
    describe_counter!(MESSAGES_CONSUMED, "从队列收到的投递数");
    describe_counter!(MESSAGES_ACKNOWLEDGED, "按处理决定分类的确认数");
    describe_counter!(MESSAGES_INVALID, "未通过校验或解码而被拒绝的投递数");
    describe_counter!(MESSAGES_PUBLISHED, "成功发布的事件数");
    describe_counter!(PUBLISH_ERRORS, "发布失败的事件数");
}

pub fn record_consumed(queue: &str) {
    counter!(MESSAGES_CONSUMED, "queue" => queue.to_string()).increment(1);
}

pub fn record_acknowledged(queue: &str, decision: CompletionDecision) {
    counter!(
        MESSAGES_ACKNOWLEDGED,
        "queue" => queue.to_string(),
        "decision" => decision.as_str()
    )
    .increment(1);
}

pub fn record_invalid(queue: &str, reason: &'static str) {
    counter!(MESSAGES_INVALID, "queue" => queue.to_string(), "reason" => reason).increment(1);
}

pub fn record_published(exchange: &str, routing_key: &str) {
    counter!(
        MESSAGES_PUBLISHED,
        "exchange" => exchange.to_string(),
        "routing_key" => routing_key.to_string()
    )
    .increment(1);
}

pub fn record_publish_error(exchange: &str, routing_key: &str) {
    counter!(
        PUBLISH_ERRORS,
        "exchange" => exchange.to_string(),
        "routing_key" => routing_key.to_string()
    )
    .increment(1);
}
