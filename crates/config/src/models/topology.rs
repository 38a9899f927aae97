use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use gateway_domain::EventKind;
use serde::{Deserialize, Serialize};

use super::message_queue::BrokerConfig;
use crate::validation::{ConfigValidator, ValidationUtils};

/// 消息体的线上格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// 绑定 Schema，解码前先校验
    #[default]
    Xml,
    /// 只做结构化解码，不做 Schema 校验
    Json,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Xml => "application/xml",
            WireFormat::Json => "application/json",
        }
    }

    /// 根据 Content-Type 推断格式，带参数（如 charset）也能识别
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        match mime {
            "application/xml" | "text/xml" => Some(WireFormat::Xml),
            "application/json" => Some(WireFormat::Json),
            _ => None,
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xml" => Ok(WireFormat::Xml),
            "json" => Ok(WireFormat::Json),
            _ => Err(format!("Invalid wire format: {s}. Valid formats: xml, json")),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Xml => write!(f, "xml"),
            WireFormat::Json => write!(f, "json"),
        }
    }
}

/// 传给消息代理的声明参数值（x-dead-letter-exchange、x-message-ttl 等）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// 为空时由消息代理生成队列名
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: BTreeMap<String, ArgValue>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            arguments: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: BTreeMap<String, ArgValue>,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "fanout".to_string(),
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: BTreeMap::new(),
        }
    }
}

/// 一个队列/交换机拓扑的完整声明
///
/// 启动时由配置构造，之后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTopologyConfig {
    pub queue: QueueOptions,
    pub exchange: Option<ExchangeOptions>,
    pub routing_key: String,
    pub consumer_name: String,
    /// 本系统必须始终为 false
    pub auto_ack: bool,
    /// 固定为 1，保证每个队列同时只有一条在处理的投递
    pub prefetch_count: u16,
    pub wire_format: WireFormat,
    pub mandatory: bool,
}

impl Default for QueueTopologyConfig {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            exchange: None,
            routing_key: String::new(),
            consumer_name: String::new(),
            auto_ack: false,
            prefetch_count: 1,
            wire_format: WireFormat::Xml,
            mandatory: false,
        }
    }
}

impl QueueTopologyConfig {
    /// 持久化的工作队列，通过默认交换机按队列名路由
    pub fn work_queue(name: impl Into<String>, wire_format: WireFormat) -> Self {
        Self {
            queue: QueueOptions {
                name: name.into(),
                ..QueueOptions::default()
            },
            wire_format,
            ..Self::default()
        }
    }

    /// 绑定到 fanout 交换机的独占订阅队列，队列名由消息代理生成
    pub fn fanout_subscription(exchange: impl Into<String>, wire_format: WireFormat) -> Self {
        Self {
            queue: QueueOptions {
                name: String::new(),
                durable: false,
                exclusive: true,
                ..QueueOptions::default()
            },
            exchange: Some(ExchangeOptions {
                name: exchange.into(),
                ..ExchangeOptions::default()
            }),
            wire_format,
            ..Self::default()
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.queue.arguments.insert(
            "x-dead-letter-exchange".to_string(),
            ArgValue::Text(exchange.into()),
        );
        self
    }

    /// 日志和指标中使用的拓扑名称
    pub fn display_name(&self) -> &str {
        match &self.exchange {
            Some(exchange) if self.queue.name.is_empty() => &exchange.name,
            _ => &self.queue.name,
        }
    }

    /// 发布目标 (exchange, routing_key)
    ///
    /// 未配置交换机时走默认交换机，routing key 取队列名。
    pub fn publish_target<'a>(&'a self, declared_queue: &'a str) -> (&'a str, &'a str) {
        match &self.exchange {
            Some(exchange) => (exchange.name.as_str(), self.routing_key.as_str()),
            None if self.routing_key.is_empty() => ("", declared_queue),
            None => ("", self.routing_key.as_str()),
        }
    }
}

impl ConfigValidator for QueueTopologyConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.auto_ack {
            return Err(crate::ConfigError::Validation(format!(
                "topology {}: auto_ack must be false, every delivery needs an explicit completion decision",
                self.display_name()
            )));
        }
        if self.prefetch_count != 1 {
            return Err(crate::ConfigError::Validation(format!(
                "topology {}: prefetch_count must be 1, got {}",
                self.display_name(),
                self.prefetch_count
            )));
        }
        match &self.exchange {
            Some(exchange) => {
                ValidationUtils::validate_not_empty(&exchange.name, "exchange.name")?;
                ValidationUtils::validate_not_empty(&exchange.kind, "exchange.kind")?;
            }
            None => ValidationUtils::validate_not_empty(&self.queue.name, "queue.name")?,
        }
        if self.queue.name.is_empty() && !self.queue.exclusive {
            return Err(crate::ConfigError::Validation(format!(
                "topology {}: server-named queues must be exclusive",
                self.display_name()
            )));
        }
        Ok(())
    }
}

/// 网关使用的全部拓扑
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySet {
    pub task_added: QueueTopologyConfig,
    pub task_completed: QueueTopologyConfig,
    pub task_cancelled: QueueTopologyConfig,
    pub slice_added: QueueTopologyConfig,
    pub slice_completed: QueueTopologyConfig,
}

impl TopologySet {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        let format = config.wire_format;
        let channels = &config.channels;
        let work_queue = |name: &str| {
            let topology = QueueTopologyConfig::work_queue(name, format);
            match &config.dead_letter_exchange {
                Some(dlx) => topology.with_dead_letter_exchange(dlx.clone()),
                None => topology,
            }
        };

        Self {
            task_added: work_queue(&channels.task.added),
            task_completed: work_queue(&channels.task.completed),
            task_cancelled: QueueTopologyConfig::fanout_subscription(
                channels.task.cancelled.clone(),
                format,
            ),
            slice_added: work_queue(&channels.slice.added),
            slice_completed: work_queue(&channels.slice.completed),
        }
    }

    pub fn get(&self, kind: EventKind) -> &QueueTopologyConfig {
        match kind {
            EventKind::TaskAdded => &self.task_added,
            EventKind::TaskCompleted => &self.task_completed,
            EventKind::TaskCancelled => &self.task_cancelled,
            EventKind::SliceAdded => &self.slice_added,
            EventKind::SliceCompleted => &self.slice_completed,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventKind, &QueueTopologyConfig)> + '_ {
        EventKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}

impl ConfigValidator for TopologySet {
    fn validate(&self) -> crate::ConfigResult<()> {
        for (_, topology) in self.iter() {
            topology.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_queue_defaults() {
        let topology = QueueTopologyConfig::work_queue("slice-added", WireFormat::Xml);
        assert!(topology.queue.durable);
        assert!(!topology.queue.auto_delete);
        assert!(!topology.queue.exclusive);
        assert!(!topology.auto_ack);
        assert_eq!(topology.prefetch_count, 1);
        assert!(topology.exchange.is_none());
        assert_eq!(topology.publish_target("slice-added"), ("", "slice-added"));
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_fanout_subscription_defaults() {
        let topology = QueueTopologyConfig::fanout_subscription("task-cancelled", WireFormat::Xml);
        assert!(!topology.queue.durable);
        assert!(topology.queue.exclusive);
        assert!(topology.queue.name.is_empty());

        let exchange = topology.exchange.as_ref().unwrap();
        assert_eq!(exchange.kind, "fanout");
        assert!(exchange.durable);
        assert_eq!(topology.display_name(), "task-cancelled");
        assert_eq!(topology.publish_target("amq.gen-1"), ("task-cancelled", ""));
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_auto_ack_and_prefetch_are_enforced() {
        let mut topology = QueueTopologyConfig::work_queue("task-added", WireFormat::Xml);
        topology.auto_ack = true;
        assert!(topology.validate().is_err());

        let mut topology = QueueTopologyConfig::work_queue("task-added", WireFormat::Xml);
        topology.prefetch_count = 10;
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_server_named_queue_must_be_exclusive() {
        let mut topology = QueueTopologyConfig::fanout_subscription("task-cancelled", WireFormat::Xml);
        topology.queue.exclusive = false;
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_topology_set_from_defaults() {
        let mut config = BrokerConfig::default();
        config.dead_letter_exchange = Some("gateway-dlx".to_string());
        let set = TopologySet::from_broker_config(&config);

        assert_eq!(set.task_added.queue.name, "task-added");
        assert_eq!(set.slice_added.queue.name, "slice-added");
        assert_eq!(set.slice_completed.queue.name, "slice-completed");
        assert_eq!(set.task_completed.queue.name, "task-completed");
        assert_eq!(
            set.task_cancelled.exchange.as_ref().map(|e| e.name.as_str()),
            Some("task-cancelled")
        );
        assert_eq!(
            set.task_added.queue.arguments.get("x-dead-letter-exchange"),
            Some(&ArgValue::Text("gateway-dlx".to_string()))
        );
        // 独占订阅队列不做死信
        assert!(set.task_cancelled.queue.arguments.is_empty());
        assert!(set.validate().is_ok());
        assert_eq!(set.get(EventKind::SliceAdded), &set.slice_added);
    }

    #[test]
    fn test_wire_format_from_content_type() {
        assert_eq!(
            WireFormat::from_content_type("application/xml; charset=utf-8"),
            Some(WireFormat::Xml)
        );
        assert_eq!(WireFormat::from_content_type("text/xml"), Some(WireFormat::Xml));
        assert_eq!(
            WireFormat::from_content_type("application/json"),
            Some(WireFormat::Json)
        );
        assert_eq!(WireFormat::from_content_type("text/plain"), None);
        assert_eq!("JSON".parse::<WireFormat>().unwrap(), WireFormat::Json);
    }
}
