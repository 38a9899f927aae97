use serde::{Deserialize, Serialize};

use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "Invalid log level: {s}. Valid levels: trace, debug, info, warn, error"
            )),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
    Pretty,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            "pretty" => Ok(OutputFormat::Pretty),
            _ => Err(format!(
                "Log formatter '{s}' is not supported. Valid formats: json, text, pretty"
            )),
        }
    }
}

/// 日志配置，对应配置路径 `log.*`
///
/// level/formatter 保留原始字符串，无法识别时由调用方回退到默认值并告警，
/// 而不是让进程启动失败。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub formatter: String,
    pub timestamps: bool,
    pub caller: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            formatter: "json".to_string(),
            timestamps: false,
            caller: false,
        }
    }
}

impl LogConfig {
    pub fn resolved_level(&self) -> Result<LogLevel, String> {
        self.level.parse()
    }

    pub fn resolved_format(&self) -> Result<OutputFormat, String> {
        self.formatter.parse()
    }
}

impl ConfigValidator for LogConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        // 无效的 level/formatter 在初始化日志时回退，不视为配置错误
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_log_config_resolution() {
        let config = LogConfig::default();
        assert_eq!(config.resolved_level().unwrap(), LogLevel::Info);
        assert_eq!(config.resolved_format().unwrap(), OutputFormat::Json);

        let config = LogConfig {
            formatter: "logfmt".to_string(),
            ..LogConfig::default()
        };
        let err = config.resolved_format().unwrap_err();
        assert!(err.contains("logfmt"));
    }
}
