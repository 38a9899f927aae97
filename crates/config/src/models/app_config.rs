use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{
    api::{ApiSection, HttpConfig, PrometheusConfig},
    logging::LogConfig,
    message_queue::BrokerConfig,
    topology::TopologySet,
};
use crate::source::ConfigSource;
use crate::validation::ConfigValidator;

/// 网关的完整配置，字段层级与配置文件的键路径一致
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rabbitmq: BrokerConfig,
    pub api: ApiSection,
    pub http: HttpConfig,
    pub prometheus: PrometheusConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let source = ConfigSource::load(config_path).context("构建配置失败")?;
        source.resolve().context("解析配置失败")
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 由配置推导出的队列/交换机拓扑
    pub fn topologies(&self) -> TopologySet {
        TopologySet::from_broker_config(&self.rabbitmq)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.rabbitmq.validate()?;
        self.api.schema.validate()?;
        self.http.validate()?;
        self.log.validate()?;
        self.topologies().validate()?;
        Ok(())
    }
}
