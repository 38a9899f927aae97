use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

/// Schema 文件位置，对应配置路径 `api.schema.*`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// 网关自身校验消息使用的 Schema
    pub latest: String,
    /// 按版本号定位 Schema 文件，`%d` 替换为版本号
    #[serde(rename = "filepattern")]
    pub file_pattern: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            latest: "schema/clustercode_v1.xsd".to_string(),
            file_pattern: "schema/clustercode_v%d.xsd".to_string(),
        }
    }
}

impl SchemaConfig {
    pub fn path_for_version(&self, version: u32) -> PathBuf {
        PathBuf::from(self.file_pattern.replace("%d", &version.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub schema: SchemaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    pub enabled: bool,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ConfigValidator for SchemaConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.latest, "api.schema.latest")?;
        ValidationUtils::validate_not_empty(&self.file_pattern, "api.schema.filepattern")?;
        if !self.file_pattern.contains("%d") {
            return Err(crate::ConfigError::Validation(
                "api.schema.filepattern must contain a %d version placeholder".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConfigValidator for HttpConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.addr, "http.addr")?;
        self.addr.parse::<std::net::SocketAddr>().map_err(|e| {
            crate::ConfigError::Validation(format!("http.addr is not a socket address: {e}"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_path_for_version() {
        let config = SchemaConfig::default();
        assert_eq!(
            config.path_for_version(1),
            PathBuf::from("schema/clustercode_v1.xsd")
        );
        assert_eq!(
            config.path_for_version(12),
            PathBuf::from("schema/clustercode_v12.xsd")
        );
    }

    #[test]
    fn test_schema_pattern_requires_placeholder() {
        let config = SchemaConfig {
            file_pattern: "schema/clustercode.xsd".to_string(),
            ..SchemaConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(SchemaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_http_addr_validation() {
        assert!(HttpConfig::default().validate().is_ok());
        let config = HttpConfig {
            addr: ":8080".to_string(),
        };
        assert!(config.validate().is_err());
    }
}
