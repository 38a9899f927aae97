//! XML Schema 校验
//!
//! Schema 在启动时加载一次并编译为内部模型，之后每条 XML 消息在解码前
//! 都要先通过校验。加载失败属于启动期致命错误。

mod instance;
mod model;

use std::path::Path;
use std::sync::Arc;

use gateway_errors::{GatewayError, GatewayResult};
use tracing::{debug, info};

use model::XsdModel;

/// 随网关发布的 v1 Schema
pub const BUNDLED_SCHEMA_V1: &str = include_str!("../../../../schema/clustercode_v1.xsd");

/// 已加载的 Schema，可在多个消费者之间共享
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    origin: String,
    model: Arc<XsdModel>,
}

impl SchemaValidator {
    /// 从文件加载 Schema
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        debug!(path = %origin, "加载Schema");

        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::schema_load(origin.clone(), e))?;
        let validator = Self::parse(&text, origin)?;

        info!(
            path = %validator.origin,
            elements = validator.model.element_names().count(),
            "Schema加载完成"
        );
        Ok(validator)
    }

    /// 从内存中的 Schema 文本构造，`origin` 只用于错误信息
    pub fn parse(text: &str, origin: impl Into<String>) -> GatewayResult<Self> {
        let origin = origin.into();
        let model = XsdModel::compile(text).map_err(|e| GatewayError::schema_load(origin.clone(), e))?;
        Ok(Self {
            origin,
            model: Arc::new(model),
        })
    }

    pub fn bundled_v1() -> GatewayResult<Self> {
        Self::parse(BUNDLED_SCHEMA_V1, "bundled:clustercode_v1.xsd")
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Schema 是否声明了该全局元素
    pub fn declares(&self, element: &str) -> bool {
        self.model.global_element(element).is_some()
    }

    /// 校验一段 XML 文本
    ///
    /// 无法解析为 XML 或不符合 Schema 时返回 [`GatewayError::Validation`]，
    /// 错误信息为校验引擎给出的诊断。
    pub fn validate(&self, raw: &str) -> GatewayResult<()> {
        let document = roxmltree::Document::parse(raw).map_err(|e| {
            GatewayError::validation(format!(
                "provided XML string does not seem to be well-formed XML: {e}"
            ))
        })?;
        instance::validate_document(&self.model, &document).map_err(GatewayError::Validation)
    }

    pub fn is_valid(&self, raw: &str) -> bool {
        self.validate(raw).is_ok()
    }
}
