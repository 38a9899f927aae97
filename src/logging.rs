//! 日志初始化
//!
//! `RUST_LOG` 优先于配置中的 `log.level`。无法识别的级别或格式回退到默认值，
//! 并在日志系统就绪后输出告警。

use anyhow::{Context, Result};
use gateway_config::{LogConfig, LogLevel, OutputFormat};
use tracing::warn;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSettings {
    pub level: LogLevel,
    pub format: OutputFormat,
    pub timestamps: bool,
    pub caller: bool,
}

impl LogSettings {
    /// 解析配置，返回设置和需要告警的回退说明
    pub fn resolve(config: &LogConfig) -> (Self, Vec<String>) {
        let mut fallbacks = Vec::new();
        let level = config.resolved_level().unwrap_or_else(|e| {
            fallbacks.push(format!("{e}. Using info."));
            LogLevel::Info
        });
        let format = config.resolved_format().unwrap_or_else(|e| {
            fallbacks.push(format!("{e}. Using json."));
            OutputFormat::Json
        });
        (
            Self {
                level,
                format,
                timestamps: config.timestamps,
                caller: config.caller,
            },
            fallbacks,
        )
    }
}

fn fmt_layer(settings: &LogSettings) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer()
        .with_file(settings.caller)
        .with_line_number(settings.caller);
    match (settings.format, settings.timestamps) {
        (OutputFormat::Json, true) => layer.json().boxed(),
        (OutputFormat::Json, false) => layer.json().without_time().boxed(),
        (OutputFormat::Text, true) => layer.compact().boxed(),
        (OutputFormat::Text, false) => layer.compact().without_time().boxed(),
        (OutputFormat::Pretty, true) => layer.pretty().boxed(),
        (OutputFormat::Pretty, false) => layer.pretty().without_time().boxed(),
    }
}

/// 初始化日志系统
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let (settings, fallbacks) = LogSettings::resolve(config);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_string()));

    tracing_subscriber::registry()
        .with(fmt_layer(&settings))
        .with(env_filter)
        .try_init()
        .context("初始化日志系统失败")?;

    for message in fallbacks {
        warn!("{message}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let (settings, fallbacks) = LogSettings::resolve(&LogConfig::default());
        assert!(fallbacks.is_empty());
        assert_eq!(settings.level, LogLevel::Info);
        assert_eq!(settings.format, OutputFormat::Json);
        assert!(!settings.timestamps);
        assert!(!settings.caller);
    }

    #[test]
    fn test_resolve_falls_back_on_unknown_values() {
        let config = LogConfig {
            level: "chatty".to_string(),
            formatter: "logfmt".to_string(),
            timestamps: true,
            caller: true,
        };
        let (settings, fallbacks) = LogSettings::resolve(&config);
        assert_eq!(settings.level, LogLevel::Info);
        assert_eq!(settings.format, OutputFormat::Json);
        assert!(settings.timestamps);
        assert_eq!(fallbacks.len(), 2);
        assert!(fallbacks[0].contains("chatty"));
        assert!(fallbacks[1].contains("logfmt"));
    }

    #[test]
    fn test_resolve_text_format() {
        let config = LogConfig {
            level: "debug".to_string(),
            formatter: "text".to_string(),
            ..LogConfig::default()
        };
        let (settings, fallbacks) = LogSettings::resolve(&config);
        assert!(fallbacks.is_empty());
        assert_eq!(settings.level, LogLevel::Debug);
        assert_eq!(settings.format, OutputFormat::Text);
    }
}
