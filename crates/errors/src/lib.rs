use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("消息代理连接错误: {0}")]
    Connection(String),
    #[error("拓扑声明失败: {name} - {message}")]
    TopologyDeclaration { name: String, message: String },
    #[error("加载Schema失败: {path} - {message}")]
    SchemaLoad { path: String, message: String },
    #[error("Schema校验失败: {0}")]
    Validation(String),
    #[error("消息解码失败: {0}")]
    Decode(String),
    #[error("消息编码失败: {0}")]
    Encode(String),
    #[error("消息发布失败: {0}")]
    Publish(String),
    #[error("消息确认失败: {0}")]
    Acknowledge(String),
    #[error("协议违规: {0}")]
    ProtocolViolation(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn topology<N: Into<String>, M: ToString>(name: N, message: M) -> Self {
        Self::TopologyDeclaration {
            name: name.into(),
            message: message.to_string(),
        }
    }
    pub fn schema_load<P: Into<String>, M: ToString>(path: P, message: M) -> Self {
        Self::SchemaLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 启动阶段不可恢复的错误，进程应当退出
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection(_)
                | GatewayError::TopologyDeclaration { .. }
                | GatewayError::SchemaLoad { .. }
                | GatewayError::Configuration(_)
        )
    }

    /// 单条入站消息本身有问题（不影响后续消息的消费）
    pub fn is_invalid_message(&self) -> bool {
        matches!(self, GatewayError::Validation(_) | GatewayError::Decode(_))
    }

    /// 用于指标标签的稳定错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Connection(_) => "connection",
            GatewayError::TopologyDeclaration { .. } => "topology",
            GatewayError::SchemaLoad { .. } => "schema_load",
            GatewayError::Validation(_) => "validation",
            GatewayError::Decode(_) => "decode",
            GatewayError::Encode(_) => "encode",
            GatewayError::Publish(_) => "publish",
            GatewayError::Acknowledge(_) => "acknowledge",
            GatewayError::ProtocolViolation(_) => "protocol_violation",
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}
